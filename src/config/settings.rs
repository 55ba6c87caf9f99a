//! Static gateway settings.
//!
//! Unlike [`crate::config::Configuration`], these are read once at startup and describe the
//! gateway process itself: where it listens, where dynamic configuration comes from, how
//! long backend calls may take and how it logs.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level static settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub entrypoint: EntrypointSettings,
    pub providers: ProvidersSettings,
    pub backend: BackendSettings,
    pub log: LogSettings,
    pub shutdown: ShutdownSettings,
    pub listener_panic_policy: ListenerPanicPolicy,
}

/// Listening socket of the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntrypointSettings {
    pub address: String,
    /// Grace period given to in-flight requests on stop
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for EntrypointSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Dynamic configuration sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    /// Minimum interval between two emissions of the same provider
    #[serde(with = "humantime_serde")]
    pub throttle_duration: Duration,
    /// Provider whose first snapshot gates activation
    pub required: Option<String>,
    pub file: Option<FileProviderSettings>,
}

impl Default for ProvidersSettings {
    fn default() -> Self {
        Self {
            throttle_duration: Duration::from_secs(2),
            required: Some("file".to_string()),
            file: None,
        }
    }
}

/// File provider source; exactly one of `filename` or `directory`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileProviderSettings {
    pub filename: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub watch: bool,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub throttle_duration: Option<Duration>,
}

impl Default for FileProviderSettings {
    fn default() -> Self {
        Self {
            filename: None,
            directory: None,
            watch: true,
            throttle_duration: None,
        }
    }
}

/// Outbound call settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle body buffers kept for reuse
    pub max_idle_buffers: usize,
    /// Largest request or response body the proxy will buffer
    pub max_body_bytes: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_idle_buffers: 64,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_spans: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Bound on waiting for background tasks during close
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// What the configuration watcher does when a listener panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPanicPolicy {
    /// Log the panic and keep calling the remaining listeners.
    #[default]
    Isolate,
    /// Log the panic, cancel the root context and stop applying snapshots.
    FailFast,
}
