//! Daemon configuration from environment variables.
//!
//! | Variable                                   | Default        |
//! |--------------------------------------------|----------------|
//! | `COURIER_BIND`                             | `0.0.0.0:8080` |
//! | `COURIER_WS_PATH`                          | `/ws`          |
//! | `COURIER_WRITE_TIMEOUT_MS`                 | `10000`        |
//! | `COURIER_DATA_DIR`                         | `courier_data` |
//! | `COURIER_SYNC_WRITES`                      | `false`        |
//! | `COURIER_PUSH_WORKERS`                     | `4`            |
//! | `COURIER_PUSH_QUEUE`                       | `1024`         |
//! | `GOOGLE_APPLICATION_CREDENTIALS_FILE_PATH` | unset          |
//! | `FCM_PROJECT_ID`                           | key file's     |
//!
//! FCM is enabled when a service-account key file is given.

use courier_relay::{PushConfig, ServerConfig, StoreConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{present} is set but {missing} is not")]
    Incomplete {
        present: &'static str,
        missing: &'static str,
    },
}

/// Where FCM credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcmSettings {
    /// Google service-account key file
    pub credentials_path: PathBuf,
    /// Overrides the key file's `project_id`
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub push: PushConfig,
    /// `None` runs with log-only wake signals
    pub fcm: Option<FcmSettings>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut server = ServerConfig::default();
        if let Some(bind) = get("COURIER_BIND") {
            server.bind_addr = bind;
        }
        if let Some(path) = get("COURIER_WS_PATH") {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid {
                    key: "COURIER_WS_PATH",
                    value: path,
                });
            }
            server.ws_path = path;
        }
        if let Some(ms) = get("COURIER_WRITE_TIMEOUT_MS") {
            let ms = parse_positive("COURIER_WRITE_TIMEOUT_MS", &ms)?;
            server.write_timeout = Duration::from_millis(ms as u64);
        }

        let mut store = StoreConfig::default();
        if let Some(dir) = get("COURIER_DATA_DIR") {
            store.path = PathBuf::from(dir);
        }
        if let Some(sync) = get("COURIER_SYNC_WRITES") {
            store.sync_writes = parse_bool("COURIER_SYNC_WRITES", &sync)?;
        }

        let mut push = PushConfig::default();
        if let Some(workers) = get("COURIER_PUSH_WORKERS") {
            push.workers = parse_positive("COURIER_PUSH_WORKERS", &workers)?;
        }
        if let Some(capacity) = get("COURIER_PUSH_QUEUE") {
            push.queue_capacity = parse_positive("COURIER_PUSH_QUEUE", &capacity)?;
        }

        let fcm = match (get("GOOGLE_APPLICATION_CREDENTIALS_FILE_PATH"), get("FCM_PROJECT_ID")) {
            (Some(path), project_id) => Some(FcmSettings {
                credentials_path: PathBuf::from(path),
                project_id,
            }),
            (None, None) => None,
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete {
                    present: "FCM_PROJECT_ID",
                    missing: "GOOGLE_APPLICATION_CREDENTIALS_FILE_PATH",
                })
            }
        };

        Ok(Self {
            server,
            store,
            push,
            fcm,
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match usize::from_str(value.trim()) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
