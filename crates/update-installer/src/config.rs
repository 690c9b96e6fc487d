use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PACKAGE_NAME: &str = "com.truelytech.habitency";
pub const DEFAULT_STATUS_ACTION: &str = "com.truelytech.habitency.INSTALL_STATUS";
pub const SCRATCH_FILE_NAME: &str = "habitex-update.apk";
pub const SESSION_WRITE_NAME: &str = "habitex-update";

/// Android O, the first release with the per-app "install unknown apps" grant.
pub const PERMISSION_GATE_MIN_SDK: i32 = 26;

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_package_name() -> String {
    DEFAULT_PACKAGE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "std::env::temp_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_package_name")]
    pub package_name: String,
    #[serde(default)]
    pub status_action: String,
    #[serde(default = "default_true")]
    pub restart_after_install: bool,
    /// `None` keeps the correlation open until the OS reports a terminal status.
    #[serde(default)]
    pub result_timeout_ms: Option<u64>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            scratch_dir: std::env::temp_dir(),
            package_name: default_package_name(),
            status_action: DEFAULT_STATUS_ACTION.to_string(),
            restart_after_install: true,
            result_timeout_ms: None,
        }
    }
}

impl UpdaterConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>, package_name: impl Into<String>) -> Self {
        let package_name = package_name.into();
        Self {
            scratch_dir: scratch_dir.into(),
            status_action: format!("{package_name}.INSTALL_STATUS"),
            package_name,
            ..Self::default()
        }
    }

    /// Applies `HABITENCY_UPDATE_*` overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("HABITENCY_UPDATE_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("HABITENCY_UPDATE_READ_TIMEOUT_MS") {
            self.read_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("HABITENCY_UPDATE_RESULT_TIMEOUT_MS") {
            self.result_timeout_ms = (ms > 0).then_some(ms);
        }
        self.restart_after_install =
            env_bool("HABITENCY_UPDATE_RESTART_AFTER_INSTALL", self.restart_after_install);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn result_timeout(&self) -> Option<Duration> {
        self.result_timeout_ms.map(Duration::from_millis)
    }

    pub fn scratch_path(&self) -> PathBuf {
        scratch_path_in(&self.scratch_dir)
    }

    pub fn package_name(&self) -> &str {
        if self.package_name.is_empty() {
            DEFAULT_PACKAGE_NAME
        } else {
            &self.package_name
        }
    }

    pub fn status_action(&self) -> &str {
        if self.status_action.is_empty() {
            DEFAULT_STATUS_ACTION
        } else {
            &self.status_action
        }
    }
}

pub fn scratch_path_in(dir: &Path) -> PathBuf {
    dir.join(SCRATCH_FILE_NAME)
}

fn normalized_env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = normalized_env_var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {key}={raw}: not a number");
            None
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    normalized_env_var(key)
        .and_then(|value| match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
