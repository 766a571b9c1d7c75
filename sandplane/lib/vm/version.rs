use semver::Version;

use crate::{SandplaneError, SandplaneResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Features available on the hypervisor, derived from its version string.
///
/// Version strings on disk look like `v1.7.2_a1b2c3d`: the last release tag
/// followed by a commit-hash suffix. Only the release tag participates in
/// capability gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorCapabilities {
    /// The parsed release version.
    version: Version,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorCapabilities {
    /// Parses a hypervisor version string into its capability set.
    pub fn from_version_string(raw: &str) -> SandplaneResult<Self> {
        let tag = raw.split('_').next().unwrap_or(raw);
        let tag = tag.strip_prefix('v').unwrap_or(tag);

        let version = Version::parse(tag)
            .map_err(|e| SandplaneError::InvalidHypervisorVersion(format!("{}: {}", raw, e)))?;

        Ok(Self { version })
    }

    /// The parsed release version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether the hypervisor supports backing guest memory with huge pages.
    pub fn supports_huge_pages(&self) -> bool {
        self.version >= Version::new(1, 7, 0)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_tag_with_commit_suffix() {
        let caps = HypervisorCapabilities::from_version_string("v1.7.2_a1b2c3d").unwrap();
        assert_eq!(caps.version(), &Version::new(1, 7, 2));
    }

    #[test]
    fn test_parses_bare_tag() {
        let caps = HypervisorCapabilities::from_version_string("1.6.0").unwrap();
        assert_eq!(caps.version(), &Version::new(1, 6, 0));
    }

    #[test]
    fn test_huge_pages_gated_on_version() {
        let old = HypervisorCapabilities::from_version_string("v1.6.9_deadbee").unwrap();
        assert!(!old.supports_huge_pages());

        let exact = HypervisorCapabilities::from_version_string("v1.7.0_deadbee").unwrap();
        assert!(exact.supports_huge_pages());

        let newer = HypervisorCapabilities::from_version_string("v1.10.1").unwrap();
        assert!(newer.supports_huge_pages());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            HypervisorCapabilities::from_version_string("not-a-version"),
            Err(SandplaneError::InvalidHypervisorVersion(_))
        ));
    }
}
