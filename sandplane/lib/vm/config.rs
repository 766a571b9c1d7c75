use std::{collections::HashMap, time::Duration};

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::config::{DEFAULT_NUM_VCPUS, DEFAULT_RAM_MIB};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything needed to boot one sandbox VM from a template snapshot.
///
/// ## Examples
///
/// ```rust
/// use std::time::Duration;
/// use sandplane::vm::SandboxConfig;
///
/// let config = SandboxConfig::builder()
///     .sandbox_id("sb-1".to_string())
///     .template_id("base".to_string())
///     .kernel_version("6.1".to_string())
///     .firecracker_version("v1.7.0_a1b2c3d".to_string())
///     .max_instance_length(Duration::from_secs(3600))
///     .build();
/// ```
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct SandboxConfig {
    /// The sandbox's id, unique across the fleet.
    sandbox_id: String,

    /// The template this sandbox restores from.
    template_id: String,

    /// The owning team, if any.
    #[builder(default)]
    team_id: Option<String>,

    /// Optional friendly name.
    #[builder(default)]
    alias: Option<String>,

    /// Number of vCPUs.
    #[builder(default = DEFAULT_NUM_VCPUS)]
    vcpus: u8,

    /// Guest memory in MiB.
    #[builder(default = DEFAULT_RAM_MIB)]
    ram_mib: u32,

    /// Guest kernel version, resolved to an image under the templates root.
    kernel_version: String,

    /// Hypervisor version string, e.g. `v1.7.0_a1b2c3d`.
    firecracker_version: String,

    /// Whether to back guest memory with huge pages when the hypervisor
    /// supports it.
    #[builder(default)]
    huge_pages: bool,

    /// Absolute cap on the sandbox's lifetime.
    max_instance_length: Duration,

    /// Guest metadata exposed through the VM metadata service.
    #[builder(default)]
    metadata: HashMap<String, String>,

    /// Whether rootfs mutations persist across the template's build dir
    /// (bind mount) instead of being discarded on teardown (overlay).
    #[builder(default)]
    persistent: bool,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = SandboxConfig::builder()
            .sandbox_id("sb-1".to_string())
            .template_id("base".to_string())
            .kernel_version("6.1".to_string())
            .firecracker_version("v1.7.0".to_string())
            .max_instance_length(Duration::from_secs(60))
            .build();

        assert_eq!(*config.get_vcpus(), DEFAULT_NUM_VCPUS);
        assert_eq!(*config.get_ram_mib(), DEFAULT_RAM_MIB);
        assert!(!config.get_persistent());
        assert!(config.get_team_id().is_none());
        assert!(config.get_metadata().is_empty());
    }
}
