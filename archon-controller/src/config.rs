// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Library configuration and user preferences.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ArchonError;

/// Timeouts and delays used by the controller procedures, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Deadline for establishing the TCP connection.
    pub controller_connect: f64,
    /// Per-command timeout while streaming a configuration.
    pub write_config_timeout: f64,
    /// Delay between configuration lines.
    pub write_config_delay: f64,
    /// Seconds to wait per flush cycle.
    pub flushing: f64,
    /// Longest a blocking readout may poll for buffer completion.
    pub readout_max: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            controller_connect: 5.0,
            write_config_timeout: 2.0,
            write_config_delay: 0.0001,
            flushing: 8.4,
            readout_max: 60.0,
        }
    }
}

/// Configuration of a controller instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchonConfig {
    pub timeouts: Timeouts,
    /// Firmware parameters applied on every `reset`, after the state
    /// parameters have been zeroed.
    pub default_parameters: HashMap<String, i64>,
    /// Number of configuration slots the device exposes to `RCONFIG`.
    pub max_config_lines: usize,
    /// Where to persist per-controller preferences such as the last
    /// ACF loaded. `None` disables persistence.
    pub user_config_file: Option<PathBuf>,
}

impl Default for ArchonConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            default_parameters: HashMap::new(),
            max_config_lines: 16384,
            user_config_file: None,
        }
    }
}

impl ArchonConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ArchonError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|err| ArchonError::Config(format!("{}: {err}", path.display())))
    }
}

/// Converts a configured number of seconds into a [`Duration`].
pub(crate) fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Per-controller state persisted across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Absolute path of the last ACF loaded, keyed by controller name.
    #[serde(default)]
    pub last_acf_loaded: HashMap<String, String>,
}

impl UserPreferences {
    /// Reads the preferences file, returning defaults when it does not
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self, ArchonError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|err| ArchonError::Config(format!("{}: {err}", path.display())))
    }

    pub fn store(&self, path: &Path) -> Result<(), ArchonError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|err| ArchonError::Config(err.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
