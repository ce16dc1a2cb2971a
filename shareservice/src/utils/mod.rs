//! Small helpers shared across modules.

pub mod fs;
pub mod mime;
