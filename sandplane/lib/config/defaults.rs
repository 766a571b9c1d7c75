use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs for a sandbox VM.
pub const DEFAULT_NUM_VCPUS: u8 = 2;

/// The default amount of RAM in MiB for a sandbox VM.
pub const DEFAULT_RAM_MIB: u32 = 512;

/// Default address for the HTTP server.
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:5010";

/// Highest per-node slot index (slots are 0..=255).
pub const MAX_SLOT_INDEX: u8 = 255;

/// Number of characters of the node id used to key slot entries.
pub const NODE_SHORT_ID_LEN: usize = 8;

/// How long the slot allocator sleeps before rescanning a full node.
pub const SLOT_RESCAN_DELAY: Duration = Duration::from_secs(2);

/// Liveness poll interval for running VMs.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long a VM gets to exit after SIGTERM before SIGKILL.
pub const VM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the shutdown path re-checks the process after signalling.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval while waiting for a created VM to reach Running.
pub const ALLOCATION_POLL_INTERVAL: Duration = Duration::from_millis(80);

/// How long to wait for the hypervisor control socket to accept connections.
pub const HYPERVISOR_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long sandbox creation retries id conflicts and allocation polls.
pub const CREATE_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default renewable TTL for sessions inserted without an explicit timeout.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Default absolute lifetime cap for a sandbox, in hours.
pub const DEFAULT_MAX_INSTANCE_LENGTH_HOURS: u64 = 24;

/// Default per-team concurrent sandbox limit.
pub const DEFAULT_TEAM_SANDBOX_LIMIT: usize = 20;

/// The directory where named network namespaces are bound.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// The shared hosts file extended with per-sandbox entries.
pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

/// Default directory holding template artifacts.
pub const DEFAULT_TEMPLATES_DIR: &str = "/var/lib/sandplane/templates";

/// Default directory for per-sandbox scratch state (overlays, logs).
pub const DEFAULT_RUNTIME_DIR: &str = "/var/lib/sandplane/run";

/// Default path of the hypervisor binary.
pub const DEFAULT_FIRECRACKER_EXE_PATH: &str = "/usr/local/bin/firecracker";

/// Environment variable overriding the hypervisor binary path.
pub const FIRECRACKER_EXE_ENV_VAR: &str = "SANDPLANE_FIRECRACKER_EXE";
