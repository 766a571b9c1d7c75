//! `sandutils::path` is a module containing path utilities for the sandplane project.

use std::path::{Path, PathBuf};

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix for log files
pub const LOG_SUFFIX: &str = "log";

/// The filename for a VM's console log file
pub const CONSOLE_LOG_FILENAME: &str = "console.log";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the path to a binary, preferring an environment variable override.
///
/// If `env_var` is set, its value is used as the binary path. Otherwise the
/// provided default path is used. In both cases the path must exist on disk.
///
/// ## Arguments
///
/// * `env_var` - Name of the environment variable that may override the path
/// * `default_path` - Path to fall back to when the variable is unset
pub fn resolve_env_path(
    env_var: &str,
    default_path: impl AsRef<Path>,
) -> SandutilsResult<PathBuf> {
    let (path, source) = match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => (PathBuf::from(value), format!("${}", env_var)),
        _ => (
            default_path.as_ref().to_path_buf(),
            "default path".to_string(),
        ),
    };

    if !path.exists() {
        return Err(SandutilsError::BinaryNotFound(
            path.display().to_string(),
            source,
        ));
    }

    Ok(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
