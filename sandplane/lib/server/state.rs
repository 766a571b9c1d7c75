//! Server state management.
//!
//! This module provides the ServerState type which holds the shared
//! components HTTP handlers need, primarily the Orchestrator instance.

use std::sync::Arc;

use crate::orchestration::Orchestrator;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared server state containing the orchestrator.
///
/// Cloned into every request handler; the orchestrator is internally
/// synchronized, so no outer lock is needed.
#[derive(Clone)]
pub struct ServerState {
    /// The shared orchestrator instance
    orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    /// Creates a new ServerState instance
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Gets a reference to the orchestrator
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
