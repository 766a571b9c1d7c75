use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    cache::{SessionCache, SessionRecord},
    config::{ALLOCATION_POLL_INTERVAL, CREATE_RETRY_TIMEOUT},
    network::NetworkBuilder,
    runtime::{TaskStore, VmHandle},
    slot::{node_short_id, SlotAllocator},
    utils,
    vm::{rootfs, SandboxConfig, VmLauncher},
    ErrorClass, SandplaneError, SandplaneResult,
};

use super::{CreateRequest, CreatedSandbox, OrchestratorSettings};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives the sandbox lifecycle across the slot allocator, network builder,
/// VM launcher, task store, and session cache.
pub struct Orchestrator {
    /// Node-level settings applied to every sandbox.
    settings: OrchestratorSettings,

    /// The slot allocator.
    allocator: Arc<SlotAllocator>,

    /// The network environment builder.
    network: Arc<NetworkBuilder>,

    /// The VM launcher.
    launcher: Arc<VmLauncher>,

    /// The task registry.
    tasks: Arc<TaskStore>,

    /// The session cache.
    cache: SessionCache,

    /// Receives sandbox ids whose VM exited on its own.
    exit_tx: mpsc::UnboundedSender<String>,

    /// Cancels in-flight creations on process shutdown.
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates the orchestrator and spawns the VM-exit drain task.
    ///
    /// A monitor that sees its VM die posts the sandbox id to an internal
    /// channel rather than reaching back into the cache; the drain task
    /// turns each message into a `kill`.
    pub fn new(
        settings: OrchestratorSettings,
        allocator: Arc<SlotAllocator>,
        network: Arc<NetworkBuilder>,
        launcher: Arc<VmLauncher>,
        tasks: Arc<TaskStore>,
        cache: SessionCache,
    ) -> Self {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();

        let drain_cache = cache.clone();
        tokio::spawn(async move {
            while let Some(sandbox_id) = exit_rx.recv().await {
                match drain_cache.kill(&sandbox_id) {
                    Ok(()) => {
                        tracing::info!(sandbox_id, "VM exited on its own, session evicted")
                    }
                    Err(SandplaneError::SandboxNotFound(_)) => {
                        // Already torn down by an expiry or explicit delete.
                    }
                    Err(e) => {
                        tracing::warn!(sandbox_id, error = %e, "failed to evict exited VM")
                    }
                }
            }
        });

        Self {
            settings,
            allocator,
            network,
            launcher,
            tasks,
            cache,
            exit_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a sandbox from `request`.
    ///
    /// Sandbox-id collisions are retried with a regenerated id for up to the
    /// create-retry window; all other failures unwind whatever was built and
    /// surface immediately.
    pub async fn create(&self, request: CreateRequest) -> SandplaneResult<CreatedSandbox> {
        let build_id_file = utils::build_id_path(
            self.settings.get_templates_dir(),
            request.get_template_id(),
        );
        if !build_id_file.exists() {
            return Err(SandplaneError::TemplateNotFound(
                request.get_template_id().clone(),
            ));
        }

        let deadline = tokio::time::Instant::now() + CREATE_RETRY_TIMEOUT;

        loop {
            let sandbox_id = format!("sb-{}", Uuid::new_v4().simple());

            match self.try_create(&request, &sandbox_id).await {
                Err(e)
                    if e.class() == ErrorClass::AlreadyExists
                        && tokio::time::Instant::now() < deadline =>
                {
                    tracing::warn!(sandbox_id, error = %e, "id conflict, retrying with a new id");
                }
                other => return other,
            }
        }
    }

    /// Explicitly deletes a sandbox.
    pub fn remove(&self, sandbox_id: &str) -> SandplaneResult<()> {
        self.cache.kill(sandbox_id)
    }

    /// Extends a sandbox's deadline.
    pub fn refresh(&self, sandbox_id: &str, ttl: Duration) -> SandplaneResult<()> {
        self.cache.refresh(sandbox_id, ttl)
    }

    /// Reads a sandbox's session record.
    pub fn get(&self, sandbox_id: &str) -> Option<SessionRecord> {
        self.cache.get(sandbox_id)
    }

    /// Lists live sandboxes, optionally filtered by team.
    pub fn list(&self, team_id: Option<&str>) -> Vec<SessionRecord> {
        self.cache.list(team_id)
    }

    /// Cancels in-flight creations, evicts every live session, and waits for
    /// the teardown pipeline to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        for record in self.cache.list(None) {
            if let Err(e) = self.cache.kill(record.get_sandbox_id()) {
                tracing::warn!(
                    sandbox_id = %record.get_sandbox_id(),
                    error = %e,
                    "failed to evict session during shutdown"
                );
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.tasks.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn try_create(
        &self,
        request: &CreateRequest,
        sandbox_id: &str,
    ) -> SandplaneResult<CreatedSandbox> {
        let template_id = request.get_template_id();

        // Admission: hold a unit of the team's quota for the whole build.
        let reservation = self.cache.reserve(
            sandbox_id,
            request.get_team_id().as_deref(),
            *self.settings.get_team_limit(),
        )?;

        let cancel = self.cancel.child_token();

        // C1: slot reservation.
        let slot = match self
            .allocator
            .reserve(self.settings.get_node_id(), sandbox_id, &cancel)
            .await
        {
            Ok(slot) => slot,
            Err(e) => {
                reservation.release();
                return Err(e);
            }
        };

        // C2: network environment. On failure the builder has already
        // removed everything, the slot included.
        if let Err(e) = self.network.create(&slot, sandbox_id).await {
            reservation.release();
            return Err(e);
        }

        if cancel.is_cancelled() {
            let _ = self.network.remove(&slot, sandbox_id).await;
            reservation.release();
            return Err(SandplaneError::Cancelled(format!(
                "creation of {}",
                sandbox_id
            )));
        }

        // C3: VM restore.
        let build_id =
            match rootfs::resolve_build_id(self.settings.get_templates_dir(), template_id).await {
                Ok(build_id) => build_id,
                Err(e) => {
                    let _ = self.network.remove(&slot, sandbox_id).await;
                    reservation.release();
                    return Err(e);
                }
            };

        let config = SandboxConfig::builder()
            .sandbox_id(sandbox_id.to_string())
            .template_id(template_id.clone())
            .team_id(request.get_team_id().clone())
            .alias(request.get_alias().clone())
            .kernel_version(self.settings.get_kernel_version().clone())
            .firecracker_version(self.settings.get_firecracker_version().clone())
            .huge_pages(*self.settings.get_huge_pages())
            .max_instance_length(*request.get_max_instance_length())
            .metadata(request.get_metadata().clone())
            .build();

        let task_id = Uuid::new_v4().to_string();
        let handle = match self.launcher.launch(&task_id, &config, &slot).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.network.remove(&slot, sandbox_id).await;
                reservation.release();
                return Err(e);
            }
        };

        // The VM must report alive before the sandbox is registered.
        if !wait_for_running(&handle).await {
            let _ = handle.shutdown().await;
            let _ = self.network.remove(&slot, sandbox_id).await;
            reservation.release();
            return Err(SandplaneError::BootFailed(format!(
                "VM for {} never reached running",
                sandbox_id
            )));
        }

        if let Err(e) = self.tasks.insert(handle.clone()).await {
            let _ = handle.shutdown().await;
            let _ = self.network.remove(&slot, sandbox_id).await;
            reservation.release();
            return Err(e);
        }

        let client_id = node_short_id(self.settings.get_node_id());
        let record = SessionRecord::builder()
            .sandbox_id(sandbox_id.to_string())
            .client_id(client_id.clone())
            .template_id(template_id.clone())
            .team_id(request.get_team_id().clone())
            .build_id(build_id)
            .alias(request.get_alias().clone())
            .metadata(request.get_metadata().clone())
            .max_instance_length(*request.get_max_instance_length())
            .handle(handle.clone())
            .slot(slot.clone())
            .build();

        // C5: registration. A successful add consumes the reservation.
        if let Err(e) = self.cache.add(record, *request.get_ttl()) {
            self.tasks.remove(&task_id).await;
            let _ = handle.shutdown().await;
            let _ = self.network.remove(&slot, sandbox_id).await;
            reservation.release();
            return Err(e);
        }
        drop(reservation);

        self.spawn_exit_watcher(&handle);

        Ok(CreatedSandbox {
            sandbox_id: sandbox_id.to_string(),
            client_id,
            template_id: template_id.clone(),
            alias: request.get_alias().clone(),
        })
    }

    /// Watches one VM and posts its sandbox id when it exits, so the cache
    /// can evict the session without the handle holding a cache pointer.
    fn spawn_exit_watcher(&self, handle: &VmHandle) {
        let exit_tx = self.exit_tx.clone();
        let handle = handle.clone();

        tokio::spawn(async move {
            let mut wait = std::pin::pin!(handle.wait());
            if wait.next().await.is_some() {
                let _ = exit_tx.send(handle.sandbox_id().to_string());
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn wait_for_running(handle: &VmHandle) -> bool {
    let deadline = tokio::time::Instant::now() + CREATE_RETRY_TIMEOUT;

    while tokio::time::Instant::now() < deadline {
        if handle.is_running().await {
            return true;
        }
        tokio::time::sleep(ALLOCATION_POLL_INTERVAL).await;
    }

    false
}
