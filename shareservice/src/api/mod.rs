//! HTTP surface of the share service.
//!
//! Exposes the script-style share endpoint used by the photobooth and the
//! download page, plus health checks.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
