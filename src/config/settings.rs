/*
* Tool Settings
* -------------
* @module: config/settings
*
* Layered like every other config in this codebase, lowest priority first:
*
*   1. hard-coded defaults (LIBVIRT_DEFAULT_URI feeds the URI default)
*   2. config/settings.{toml,yaml,json} if present
*   3. an explicit --settings file
*   4. CLUSTER_MANAGER_* environment variables
*   5. command-line flags (applied by the CLI after loading)
*/

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::ConfigError;

pub const ENV_PREFIX: &str = "CLUSTER_MANAGER";
pub const DEFAULT_STATE_PATH: &str = "output/state.json";
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub state_path: PathBuf,
    pub log_level: String,
    pub libvirt_uri: String,
    /// Graceful shutdown budget before a VM is forced off.
    pub shutdown_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on concurrent per-VM hypervisor calls.
    pub max_workers: usize,
    /// Storage pools are created as `<storage_root>/<cluster>`.
    pub storage_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            log_level: "info".to_string(),
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            shutdown_timeout_secs: 60,
            poll_interval_ms: 2000,
            max_workers: 4,
            storage_root: PathBuf::from("/var/lib/libvirt/images/clusters"),
        }
    }
}

impl Settings {
    /// Load from the real process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(file, None)
    }

    /// `env` replaces the process environment when given.
    pub fn load_with_env(file: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let libvirt_uri = match &env {
            Some(vars) => vars.get("LIBVIRT_DEFAULT_URI").cloned(),
            None => std::env::var("LIBVIRT_DEFAULT_URI").ok(),
        }
        .unwrap_or(defaults.libvirt_uri);

        let mut builder = Config::builder()
            .set_default("state_path", defaults.state_path.to_string_lossy().into_owned())?
            .set_default("log_level", defaults.log_level)?
            .set_default("libvirt_uri", libvirt_uri)?
            .set_default("shutdown_timeout_secs", defaults.shutdown_timeout_secs)?
            .set_default("poll_interval_ms", defaults.poll_interval_ms)?
            .set_default("max_workers", defaults.max_workers as u64)?
            .set_default("storage_root", defaults.storage_root.to_string_lossy().into_owned())?
            .add_source(File::with_name("config/settings").required(false));

        if let Some(path) = file {
            debug!(settings = %path.display(), "Loading settings file");
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true).source(env))
            .build()?
            .try_deserialize()?;
        Ok(settings.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(10);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
