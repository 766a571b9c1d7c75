//! Type definitions for the server module.
//!
//! This module contains request and response types used by the REST API
//! endpoints. Field names follow the wire convention of the fleet API
//! front-end (camelCase with ID suffixes).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Request body for `POST /sandboxes`.
#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    /// The template to restore from.
    #[serde(rename = "templateID")]
    pub template_id: String,

    /// The requesting team.
    #[serde(rename = "teamID")]
    pub team_id: Option<String>,

    /// Metadata exposed to the guest.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Optional friendly name.
    pub alias: Option<String>,

    /// Renewable TTL in seconds.
    pub timeout: Option<u64>,

    /// Absolute lifetime cap in hours.
    #[serde(rename = "maxInstanceLengthHours")]
    pub max_instance_length_hours: Option<u64>,
}

/// Response body for `POST /sandboxes`.
#[derive(Debug, Serialize)]
pub struct CreateSandboxResponse {
    /// The new sandbox's id.
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,

    /// The worker node's short id.
    #[serde(rename = "clientID")]
    pub client_id: String,

    /// The template the sandbox restored from.
    #[serde(rename = "templateID")]
    pub template_id: String,

    /// The friendly name, if one was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Query parameters for `GET /sandboxes`.
#[derive(Debug, Deserialize)]
pub struct ListSandboxesQuery {
    /// Restrict the listing to one team.
    #[serde(rename = "teamID")]
    pub team_id: Option<String>,
}

/// One live sandbox in a `GET /sandboxes` listing.
#[derive(Debug, Serialize)]
pub struct ListedSandbox {
    /// The sandbox's id.
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,

    /// The worker node's short id.
    #[serde(rename = "clientID")]
    pub client_id: String,

    /// The template the sandbox restored from.
    #[serde(rename = "templateID")]
    pub template_id: String,

    /// The owning team, if any.
    #[serde(rename = "teamID", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    /// The friendly name, if one was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Client-supplied metadata.
    pub metadata: HashMap<String, String>,

    /// When the sandbox started.
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
}

/// Request body for `POST /sandboxes/{id}/refresh`.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// New renewable TTL in seconds.
    pub timeout: u64,
}

/// Error response returned when an operation fails.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Client-safe error message.
    pub error: String,

    /// Stable error code for programmatic handling.
    pub code: String,
}
