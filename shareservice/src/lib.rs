//! shareservice library crate.
//!
//! A job-handshake broker between a photobooth (producer) and the download
//! page opened from a QR code (consumer). Jobs live in a SQLite store; the
//! producer long-polls for claimed jobs and uploads the matching file.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod utils;

pub use error::{Error, Result};
