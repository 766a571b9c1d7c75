use std::{env, path::PathBuf};

use getset::Getters;

use super::{DEFAULT_HOSTS_FILE, DEFAULT_RUNTIME_DIR, DEFAULT_TEMPLATES_DIR};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Address of the distributed KV store backing slot reservations.
pub const KV_ADDRESS_ENV_VAR: &str = "SANDPLANE_KV_ADDRESS";

/// Access token for the KV store.
pub const KV_TOKEN_ENV_VAR: &str = "SANDPLANE_KV_TOKEN";

/// Address of the template manager service.
pub const TEMPLATE_MANAGER_ENV_VAR: &str = "SANDPLANE_TEMPLATE_MANAGER_ADDRESS";

/// Analytics collector endpoint.
pub const ANALYTICS_ENDPOINT_ENV_VAR: &str = "SANDPLANE_ANALYTICS_ENDPOINT";

/// API key sent with analytics events.
pub const ANALYTICS_API_KEY_ENV_VAR: &str = "SANDPLANE_ANALYTICS_API_KEY";

/// Directory holding template artifacts.
pub const TEMPLATES_DIR_ENV_VAR: &str = "SANDPLANE_TEMPLATES_DIR";

/// Directory for per-sandbox scratch state.
pub const RUNTIME_DIR_ENV_VAR: &str = "SANDPLANE_RUNTIME_DIR";

/// Hosts file extended with per-sandbox entries.
pub const HOSTS_FILE_ENV_VAR: &str = "SANDPLANE_HOSTS_FILE";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Process-level configuration resolved once at startup from the environment.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct EnvConfig {
    /// KV store address; `None` selects the in-process store.
    kv_address: Option<String>,

    /// KV store access token.
    kv_token: Option<String>,

    /// Template manager address, if a remote manager is deployed.
    template_manager_address: Option<String>,

    /// Analytics endpoint; `None` disables event reporting.
    analytics_endpoint: Option<String>,

    /// Analytics API key.
    analytics_api_key: Option<String>,

    /// Directory holding template artifacts.
    templates_dir: PathBuf,

    /// Directory for per-sandbox scratch state.
    runtime_dir: PathBuf,

    /// Hosts file extended with per-sandbox entries.
    hosts_file: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvConfig {
    /// Resolves configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            kv_address: non_empty_var(KV_ADDRESS_ENV_VAR),
            kv_token: non_empty_var(KV_TOKEN_ENV_VAR),
            template_manager_address: non_empty_var(TEMPLATE_MANAGER_ENV_VAR),
            analytics_endpoint: non_empty_var(ANALYTICS_ENDPOINT_ENV_VAR),
            analytics_api_key: non_empty_var(ANALYTICS_API_KEY_ENV_VAR),
            templates_dir: non_empty_var(TEMPLATES_DIR_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR)),
            runtime_dir: non_empty_var(RUNTIME_DIR_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR)),
            hosts_file: non_empty_var(HOSTS_FILE_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_FILE)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn non_empty_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
