//! Filesystem layout helpers for template and sandbox artifacts.
//!
//! The per-template layout on a worker node is:
//!
//! ```text
//! {root}/{templateID}/build_id                              # current build id
//! {root}/{templateID}/memfile                               # memory snapshot
//! {root}/{templateID}/snapfile                              # VM snapshot metadata
//! {root}/{templateID}/builds/{buildID}/                     # per-build mount target
//! {root}/{templateID}/envInstances/{sandboxID}/rootfs.ext4  # reflink per sandbox
//! ```

use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file containing the template's current build id.
pub const BUILD_ID_FILENAME: &str = "build_id";

/// The memory snapshot file of a template.
pub const MEMFILE_FILENAME: &str = "memfile";

/// The VM snapshot metadata file of a template.
pub const SNAPFILE_FILENAME: &str = "snapfile";

/// The sub directory holding per-build mount targets.
pub const BUILDS_SUBDIR: &str = "builds";

/// The sub directory holding per-sandbox writable rootfs copies.
pub const ENV_INSTANCES_SUBDIR: &str = "envInstances";

/// The root filesystem image filename.
pub const ROOTFS_FILENAME: &str = "rootfs.ext4";

/// The hypervisor control socket filename inside a sandbox's instance dir.
pub const HYPERVISOR_SOCKET_FILENAME: &str = "firecracker.socket";

/// The sub directory for per-sandbox overlay upper layers.
pub const OVERLAY_UPPER_SUBDIR: &str = "overlay-rw";

/// The sub directory for per-sandbox overlay work dirs.
pub const OVERLAY_WORK_SUBDIR: &str = "overlay-work";

/// The sub directory holding guest kernels, keyed by kernel version.
pub const KERNELS_SUBDIR: &str = "kernels";

/// The kernel image filename inside a kernel version directory.
pub const KERNEL_IMAGE_FILENAME: &str = "vmlinux.bin";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the directory holding a template's artifacts.
pub fn template_dir(root: impl AsRef<Path>, template_id: &str) -> PathBuf {
    root.as_ref().join(template_id)
}

/// Returns the path of a template's `build_id` file.
pub fn build_id_path(root: impl AsRef<Path>, template_id: &str) -> PathBuf {
    template_dir(root, template_id).join(BUILD_ID_FILENAME)
}

/// Returns the path of a template's memory snapshot.
pub fn memfile_path(root: impl AsRef<Path>, template_id: &str) -> PathBuf {
    template_dir(root, template_id).join(MEMFILE_FILENAME)
}

/// Returns the path of a template's snapshot metadata file.
pub fn snapfile_path(root: impl AsRef<Path>, template_id: &str) -> PathBuf {
    template_dir(root, template_id).join(SNAPFILE_FILENAME)
}

/// Returns the mount target directory of a specific build.
pub fn build_dir(root: impl AsRef<Path>, template_id: &str, build_id: &str) -> PathBuf {
    template_dir(root, template_id)
        .join(BUILDS_SUBDIR)
        .join(build_id)
}

/// Returns the rootfs image path of a specific build.
pub fn build_rootfs_path(root: impl AsRef<Path>, template_id: &str, build_id: &str) -> PathBuf {
    build_dir(root, template_id, build_id).join(ROOTFS_FILENAME)
}

/// Returns the per-sandbox instance directory.
pub fn env_instance_dir(root: impl AsRef<Path>, template_id: &str, sandbox_id: &str) -> PathBuf {
    template_dir(root, template_id)
        .join(ENV_INSTANCES_SUBDIR)
        .join(sandbox_id)
}

/// Returns the per-sandbox writable rootfs copy path.
pub fn env_instance_rootfs_path(
    root: impl AsRef<Path>,
    template_id: &str,
    sandbox_id: &str,
) -> PathBuf {
    env_instance_dir(root, template_id, sandbox_id).join(ROOTFS_FILENAME)
}

/// Returns the guest kernel image path for a kernel version.
pub fn kernel_image_path(root: impl AsRef<Path>, kernel_version: &str) -> PathBuf {
    root.as_ref()
        .join(KERNELS_SUBDIR)
        .join(kernel_version)
        .join(KERNEL_IMAGE_FILENAME)
}

/// Returns the hypervisor control socket path for a sandbox.
pub fn hypervisor_socket_path(
    root: impl AsRef<Path>,
    template_id: &str,
    sandbox_id: &str,
) -> PathBuf {
    env_instance_dir(root, template_id, sandbox_id).join(HYPERVISOR_SOCKET_FILENAME)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_layout() {
        let root = Path::new("/srv/templates");

        assert_eq!(
            build_id_path(root, "tmpl-a"),
            PathBuf::from("/srv/templates/tmpl-a/build_id")
        );
        assert_eq!(
            memfile_path(root, "tmpl-a"),
            PathBuf::from("/srv/templates/tmpl-a/memfile")
        );
        assert_eq!(
            snapfile_path(root, "tmpl-a"),
            PathBuf::from("/srv/templates/tmpl-a/snapfile")
        );
        assert_eq!(
            build_rootfs_path(root, "tmpl-a", "b1"),
            PathBuf::from("/srv/templates/tmpl-a/builds/b1/rootfs.ext4")
        );
        assert_eq!(
            env_instance_rootfs_path(root, "tmpl-a", "sb-1"),
            PathBuf::from("/srv/templates/tmpl-a/envInstances/sb-1/rootfs.ext4")
        );
    }
}
