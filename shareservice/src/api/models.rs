//! API request and response models.

use serde::{Deserialize, Serialize};

/// Fields of a share request, read from the query string or a form body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShareParams {
    pub action: Option<String>,
    pub id: Option<String>,
    pub apikey: Option<String>,
}

impl ShareParams {
    /// Fill fields missing here from `other`.
    pub fn merge(mut self, other: ShareParams) -> Self {
        self.action = self.action.or(other.action);
        self.id = self.id.or(other.id);
        self.apikey = self.apikey.or(other.apikey);
        self
    }

    /// Identifier, if present and non-empty.
    pub fn identifier(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Response of the `info` action.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: u32,
    pub name: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}
