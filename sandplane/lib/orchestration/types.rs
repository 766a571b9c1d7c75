use std::{collections::HashMap, path::PathBuf, time::Duration};

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::config::{
    DEFAULT_MAX_INSTANCE_LENGTH_HOURS, DEFAULT_SESSION_TTL, DEFAULT_TEAM_SANDBOX_LIMIT,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client's request for a new sandbox.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct CreateRequest {
    /// The template to restore from.
    template_id: String,

    /// The requesting team, if any.
    #[builder(default)]
    team_id: Option<String>,

    /// Optional friendly name.
    #[builder(default)]
    alias: Option<String>,

    /// Client-supplied metadata, exposed to the guest.
    #[builder(default)]
    metadata: HashMap<String, String>,

    /// Renewable TTL for the session.
    #[builder(default = DEFAULT_SESSION_TTL)]
    ttl: Duration,

    /// Absolute cap on the sandbox's lifetime.
    #[builder(default = Duration::from_secs(DEFAULT_MAX_INSTANCE_LENGTH_HOURS * 3600))]
    max_instance_length: Duration,
}

/// The result of a successful sandbox creation.
#[derive(Debug, Clone)]
pub struct CreatedSandbox {
    /// The new sandbox's id.
    pub sandbox_id: String,

    /// The worker node's short id.
    pub client_id: String,

    /// The template the sandbox restored from.
    pub template_id: String,

    /// The friendly name, if one was given.
    pub alias: Option<String>,
}

/// Node-level settings the orchestrator needs for every sandbox.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct OrchestratorSettings {
    /// This worker node's id.
    node_id: String,

    /// Directory holding template artifacts.
    templates_dir: PathBuf,

    /// Per-team concurrent sandbox limit.
    #[builder(default = DEFAULT_TEAM_SANDBOX_LIMIT)]
    team_limit: usize,

    /// Guest kernel version booted into sandboxes.
    kernel_version: String,

    /// Hypervisor version string, used for capability gating.
    firecracker_version: String,

    /// Whether to request huge-page memory backing when supported.
    #[builder(default)]
    huge_pages: bool,
}
