//! Repository layer for database access.
//!
//! This module implements the Repository Pattern to abstract all database interactions,
//! creating a clean and maintainable data access layer.

pub mod share_job;

pub use share_job::*;
