//! Database models for the share service.
//!
//! These models map directly to the database schema.

pub mod share_job;

pub use share_job::*;
