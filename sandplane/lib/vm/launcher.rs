use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use sandutils::{ProcessMonitor, CONSOLE_LOG_FILENAME};
use tokio::{fs, process::Command};

use crate::{
    config::{DEFAULT_FIRECRACKER_EXE_PATH, FIRECRACKER_EXE_ENV_VAR, HYPERVISOR_READY_TIMEOUT},
    runtime::VmHandle,
    slot::{Slot, TAP_NAME},
    utils, SandplaneError, SandplaneResult,
};

use super::{
    rootfs, BootSource, Drive, HypervisorApi, HypervisorCapabilities, MachineConfig, MemBackend,
    NetworkInterface, SandboxConfig, SnapshotLoad, VmLogMonitor,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Boots sandbox VMs from template snapshots.
///
/// The launcher prepares the copy-on-write rootfs and mount plan, starts the
/// hypervisor inside the sandbox's network namespace under an unshared mount
/// namespace (so the overlay stays private to the VM process tree), drives
/// the control socket through configure-and-restore, and returns a
/// [`VmHandle`] for the running process.
pub struct VmLauncher {
    /// Directory holding template artifacts.
    templates_dir: PathBuf,

    /// Directory for per-sandbox scratch state.
    runtime_dir: PathBuf,

    /// Path of the hypervisor binary.
    firecracker_exe: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmLauncher {
    /// Creates a launcher, resolving the hypervisor binary from the
    /// environment or its default install path.
    pub fn new(
        templates_dir: impl AsRef<Path>,
        runtime_dir: impl AsRef<Path>,
    ) -> SandplaneResult<Self> {
        let firecracker_exe =
            sandutils::resolve_env_path(FIRECRACKER_EXE_ENV_VAR, DEFAULT_FIRECRACKER_EXE_PATH)?;

        Ok(Self::with_hypervisor(
            templates_dir,
            runtime_dir,
            firecracker_exe,
        ))
    }

    /// Creates a launcher with an explicit hypervisor binary path.
    pub fn with_hypervisor(
        templates_dir: impl AsRef<Path>,
        runtime_dir: impl AsRef<Path>,
        firecracker_exe: impl Into<PathBuf>,
    ) -> Self {
        Self {
            templates_dir: templates_dir.as_ref().to_path_buf(),
            runtime_dir: runtime_dir.as_ref().to_path_buf(),
            firecracker_exe: firecracker_exe.into(),
        }
    }

    /// Boots a VM for `config` inside `slot`'s namespace and returns its
    /// handle.
    ///
    /// On any failure after the process is spawned, the process is killed and
    /// reaped and the sandbox's scratch state removed before the error is
    /// returned.
    pub async fn launch(
        &self,
        task_id: &str,
        config: &SandboxConfig,
        slot: &Slot,
    ) -> SandplaneResult<VmHandle> {
        let capabilities =
            HypervisorCapabilities::from_version_string(config.get_firecracker_version())?;
        let sandbox_id = config.get_sandbox_id();
        let template_id = config.get_template_id();

        let build_id = rootfs::resolve_build_id(&self.templates_dir, template_id).await?;

        let memfile = utils::memfile_path(&self.templates_dir, template_id);
        let snapfile = utils::snapfile_path(&self.templates_dir, template_id);
        for artifact in [&memfile, &snapfile] {
            if !artifact.exists() {
                return Err(SandplaneError::BootFailed(format!(
                    "snapshot artifact missing at {}",
                    artifact.display()
                )));
            }
        }

        let rootfs_path =
            rootfs::reflink_rootfs(&self.templates_dir, template_id, &build_id, sandbox_id).await?;

        let env_dir = utils::env_instance_dir(&self.templates_dir, template_id, sandbox_id);
        let build_dir = utils::build_dir(&self.templates_dir, template_id, &build_id);
        fs::create_dir_all(&build_dir).await?;

        let scratch_dir = self.runtime_dir.join(sandbox_id);
        if !config.get_persistent() {
            rootfs::prepare_scratch_dirs(&scratch_dir).await?;
        }

        let socket_path = utils::hypervisor_socket_path(&self.templates_dir, template_id, sandbox_id);
        if socket_path.exists() {
            fs::remove_file(&socket_path).await?;
        }

        let mount = rootfs::mount_command(
            &env_dir,
            &build_dir,
            &scratch_dir,
            *config.get_persistent(),
        );
        let shell_cmd = format!(
            "{} && ip netns exec {} {} --api-sock {}",
            mount,
            slot.netns_name(),
            self.firecracker_exe.display(),
            socket_path.display()
        );

        tracing::debug!(sandbox_id, cmd = %shell_cmd, "launching VM");

        let mut child = Command::new("unshare")
            .args(["--pid", "--fork", "--mount", "--kill-child", "--", "sh", "-c"])
            .arg(&shell_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            SandplaneError::BootFailed("VM process exited before a pid was captured".into())
        })?;

        let mut monitor = VmLogMonitor::new(sandbox_id.clone());
        monitor
            .start(
                pid,
                child.stdout.take(),
                child.stderr.take(),
                scratch_dir.join(CONSOLE_LOG_FILENAME),
            )
            .await?;

        let api = HypervisorApi::new(&socket_path);
        if let Err(e) = self
            .configure_and_restore(&api, config, &capabilities, &rootfs_path, &memfile, &snapfile)
            .await
        {
            tracing::error!(sandbox_id, error = %e, "VM boot failed, stopping process");
            stop_failed_boot(&mut child, pid).await;
            rootfs::cleanup_sandbox_dirs(&self.templates_dir, template_id, sandbox_id, &scratch_dir)
                .await;
            return Err(e);
        }

        // Guest metadata is best-effort after the snapshot is resumed.
        if !config.get_metadata().is_empty() {
            let metadata = serde_json::to_value(config.get_metadata())?;
            if let Err(e) = api.put_mmds(&metadata).await {
                tracing::warn!(sandbox_id, error = %e, "failed to set guest metadata");
            }
        }

        tracing::info!(sandbox_id, pid, "VM restored and running");

        Ok(VmHandle::new(
            task_id,
            sandbox_id.clone(),
            pid,
            child,
            socket_path,
            slot.netns_name(),
        ))
    }

    /// Deletes a sandbox's on-disk state after its VM is gone.
    pub async fn cleanup(&self, template_id: &str, sandbox_id: &str) {
        let scratch_dir = self.runtime_dir.join(sandbox_id);
        rootfs::cleanup_sandbox_dirs(&self.templates_dir, template_id, sandbox_id, &scratch_dir)
            .await;
    }

    async fn configure_and_restore(
        &self,
        api: &HypervisorApi,
        config: &SandboxConfig,
        capabilities: &HypervisorCapabilities,
        rootfs_path: &Path,
        memfile: &Path,
        snapfile: &Path,
    ) -> SandplaneResult<()> {
        api.wait_ready(HYPERVISOR_READY_TIMEOUT).await?;

        let huge_pages = (*config.get_huge_pages() && capabilities.supports_huge_pages())
            .then(|| "2M".to_string());

        api.put_machine_config(&MachineConfig {
            vcpu_count: *config.get_vcpus(),
            mem_size_mib: *config.get_ram_mib(),
            huge_pages,
        })
        .await?;

        api.put_boot_source(&BootSource {
            kernel_image_path: utils::kernel_image_path(
                &self.templates_dir,
                config.get_kernel_version(),
            )
            .display()
            .to_string(),
            boot_args: None,
        })
        .await?;

        // The drives list is exactly the per-sandbox rootfs reflink.
        api.put_drive(&Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: rootfs_path.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        })
        .await?;

        // Exactly one network interface, backed by the namespace's tap.
        api.put_network_interface(&NetworkInterface {
            iface_id: "net0".to_string(),
            host_dev_name: TAP_NAME.to_string(),
        })
        .await?;

        api.load_snapshot(&SnapshotLoad {
            snapshot_path: snapfile.display().to_string(),
            mem_backend: MemBackend {
                backend_type: "File".to_string(),
                backend_path: memfile.display().to_string(),
            },
            resume_vm: true,
        })
        .await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Kills and reaps a VM process whose boot went wrong.
async fn stop_failed_boot(child: &mut tokio::process::Child, pid: u32) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = %e, "failed to kill half-booted VM");
        }
    }

    if let Err(e) = child.wait().await {
        tracing::warn!(pid, error = %e, "failed to reap half-booted VM");
    }
}
