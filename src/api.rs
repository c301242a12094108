//! Request and response bodies of the external operations.

use serde::{Deserialize, Serialize};

use crate::admission::{IdentifierType, UsageKey};
use crate::error::Result;
use crate::queue::Priority;

fn default_weight() -> u64 {
    1
}

/// Identifies the state of one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    pub identifier: String,
    pub identifier_type: IdentifierType,
}

impl KeyRequest {
    pub fn key(&self) -> Result<UsageKey> {
        UsageKey::parse(&self.identifier, self.identifier_type)
    }
}

/// Body of `POST /check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    #[serde(default = "default_weight")]
    pub request_weight: u64,
    #[serde(default)]
    pub operation: String,
}

/// Body of `POST /queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub request_id: String,
    #[serde(default)]
    pub operation: String,
    /// Falls back to the identifier's configured default priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Falls back to, and is capped by, the queue policy's max wait.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

/// Names one queued request (`GET /queue/status`, `POST /queue/cancel`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRef {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub request_id: String,
}

/// Body of `POST /release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub concurrent_in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub reset: bool,
    pub discarded_entries: usize,
}

/// Body returned alongside a 4xx/5xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}
