use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{runtime::VmHandle, slot::Slot};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One live sandbox tracked by the session cache.
///
/// The record exclusively owns its VM handle and slot reservation; external
/// collaborators hold sandbox ids and resolve them through the cache.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct SessionRecord {
    /// The sandbox's id, unique across the fleet.
    sandbox_id: String,

    /// The worker node's short id.
    client_id: String,

    /// The template this sandbox restored from.
    template_id: String,

    /// The owning team, if any.
    #[builder(default)]
    team_id: Option<String>,

    /// The template build the sandbox booted.
    build_id: String,

    /// Optional friendly name.
    #[builder(default)]
    alias: Option<String>,

    /// Client-supplied metadata.
    #[builder(default)]
    metadata: HashMap<String, String>,

    /// When the sandbox started.
    #[builder(default = Utc::now())]
    started_at: DateTime<Utc>,

    /// Absolute cap on the sandbox's lifetime.
    max_instance_length: Duration,

    /// Handle to the running VM.
    handle: VmHandle,

    /// The sandbox's reserved network slot.
    slot: Slot,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionRecord {
    /// The instant past which no refresh can extend this sandbox.
    pub fn absolute_cap(&self) -> DateTime<Utc> {
        self.started_at
            + chrono::Duration::from_std(self.max_instance_length)
                .unwrap_or_else(|_| chrono::Duration::max_value())
    }
}
