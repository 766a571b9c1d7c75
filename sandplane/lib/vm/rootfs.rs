use std::path::{Path, PathBuf};

use tokio::{fs, process::Command};

use crate::{
    utils::{
        self, OVERLAY_UPPER_SUBDIR, OVERLAY_WORK_SUBDIR,
    },
    SandplaneError, SandplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a template's current build id from its `build_id` file.
pub async fn resolve_build_id(
    templates_dir: impl AsRef<Path>,
    template_id: &str,
) -> SandplaneResult<String> {
    let path = utils::build_id_path(&templates_dir, template_id);

    let raw = fs::read_to_string(&path).await.map_err(|e| {
        SandplaneError::InvalidTemplate(format!(
            "cannot read build id at {}: {}",
            path.display(),
            e
        ))
    })?;

    let build_id = raw.trim();
    if build_id.is_empty() {
        return Err(SandplaneError::InvalidTemplate(format!(
            "empty build id file at {}",
            path.display()
        )));
    }

    Ok(build_id.to_string())
}

/// Reflink-copies the template's build rootfs into the sandbox's instance
/// directory, so the guest can mutate its disk without touching the template.
///
/// `cp --reflink=auto` gives copy-on-write on filesystems that support it and
/// falls back to a full copy elsewhere.
pub async fn reflink_rootfs(
    templates_dir: impl AsRef<Path>,
    template_id: &str,
    build_id: &str,
    sandbox_id: &str,
) -> SandplaneResult<PathBuf> {
    let source = utils::build_rootfs_path(&templates_dir, template_id, build_id);
    if !source.exists() {
        return Err(SandplaneError::BootFailed(format!(
            "build rootfs missing at {}",
            source.display()
        )));
    }

    let target = utils::env_instance_rootfs_path(&templates_dir, template_id, sandbox_id);
    fs::create_dir_all(target.parent().expect("instance rootfs has a parent")).await?;

    let output = Command::new("cp")
        .arg("--reflink=auto")
        .arg(&source)
        .arg(&target)
        .output()
        .await?;

    if !output.status.success() {
        return Err(SandplaneError::BootFailed(format!(
            "reflink copy of {} failed: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(target)
}

/// Assembles the mount half of the VM launch command line.
///
/// Persistent sandboxes bind-mount their instance directory over the build
/// directory, so guest writes survive teardown. Ephemeral sandboxes mount an
/// overlay whose upper and work dirs live in per-sandbox scratch space that
/// is deleted with the sandbox.
pub fn mount_command(
    env_dir: &Path,
    build_dir: &Path,
    scratch_dir: &Path,
    persistent: bool,
) -> String {
    if persistent {
        format!(
            "mount --bind {} {}",
            env_dir.display(),
            build_dir.display()
        )
    } else {
        format!(
            "mount -t overlay overlay -o lowerdir={},upperdir={},workdir={} {}",
            env_dir.display(),
            scratch_dir.join(OVERLAY_UPPER_SUBDIR).display(),
            scratch_dir.join(OVERLAY_WORK_SUBDIR).display(),
            build_dir.display()
        )
    }
}

/// Creates the overlay scratch directories for an ephemeral sandbox.
pub async fn prepare_scratch_dirs(scratch_dir: &Path) -> SandplaneResult<()> {
    fs::create_dir_all(scratch_dir.join(OVERLAY_UPPER_SUBDIR)).await?;
    fs::create_dir_all(scratch_dir.join(OVERLAY_WORK_SUBDIR)).await?;
    Ok(())
}

/// Deletes a sandbox's instance directory and scratch space.
///
/// Best-effort; missing directories are fine.
pub async fn cleanup_sandbox_dirs(
    templates_dir: impl AsRef<Path>,
    template_id: &str,
    sandbox_id: &str,
    scratch_dir: &Path,
) {
    let instance_dir = utils::env_instance_dir(&templates_dir, template_id, sandbox_id);

    for dir in [&instance_dir, &scratch_dir.to_path_buf()] {
        if let Err(e) = fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove sandbox dir");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_build_id_trims() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let template_dir = dir.path().join("tmpl");
        fs::create_dir_all(&template_dir).await?;
        fs::write(template_dir.join("build_id"), "b1\n").await?;

        let build_id = resolve_build_id(dir.path(), "tmpl").await?;
        assert_eq!(build_id, "b1");
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_build_id_missing_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_build_id(dir.path(), "ghost").await;
        assert!(matches!(result, Err(SandplaneError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_resolve_build_id_empty_is_invalid() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let template_dir = dir.path().join("tmpl");
        fs::create_dir_all(&template_dir).await?;
        fs::write(template_dir.join("build_id"), "  \n").await?;

        let result = resolve_build_id(dir.path(), "tmpl").await;
        assert!(matches!(result, Err(SandplaneError::InvalidTemplate(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_reflink_rootfs_copies_image() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let build_dir = dir.path().join("tmpl/builds/b1");
        fs::create_dir_all(&build_dir).await?;
        fs::write(build_dir.join("rootfs.ext4"), b"fake image").await?;

        let target = reflink_rootfs(dir.path(), "tmpl", "b1", "sb-1").await?;
        assert_eq!(
            target,
            dir.path().join("tmpl/envInstances/sb-1/rootfs.ext4")
        );
        assert_eq!(fs::read(&target).await?, b"fake image");
        Ok(())
    }

    #[tokio::test]
    async fn test_reflink_rootfs_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let result = reflink_rootfs(dir.path(), "tmpl", "b1", "sb-1").await;
        assert!(matches!(result, Err(SandplaneError::BootFailed(_))));
    }

    #[test]
    fn test_mount_command_overlay() {
        let cmd = mount_command(
            Path::new("/t/envInstances/sb-1"),
            Path::new("/t/builds/b1"),
            Path::new("/run/sb-1"),
            false,
        );
        assert_eq!(
            cmd,
            "mount -t overlay overlay -o lowerdir=/t/envInstances/sb-1,upperdir=/run/sb-1/overlay-rw,workdir=/run/sb-1/overlay-work /t/builds/b1"
        );
    }

    #[test]
    fn test_mount_command_bind() {
        let cmd = mount_command(
            Path::new("/t/envInstances/sb-1"),
            Path::new("/t/builds/b1"),
            Path::new("/run/sb-1"),
            true,
        );
        assert_eq!(cmd, "mount --bind /t/envInstances/sb-1 /t/builds/b1");
    }
}
