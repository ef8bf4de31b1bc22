//! Centralized configuration for the docstore CLI.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than on the first remote call.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use firestore::DEFAULT_DATABASE;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Firestore project id; may be omitted when the key carries one
    pub project_id: Option<String>,
    /// Path to the JSON service-account key
    pub credentials_path: Option<PathBuf>,
    /// `host:port` of a Firestore emulator
    pub emulator_host: Option<String>,
    /// Database id (default: `(default)`)
    pub database_id: String,
    /// Per-call timeout; `None` when FIRESTORE_TIMEOUT_SECS=0
    pub timeout: Option<Duration>,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        let project_id = non_empty("FIRESTORE_PROJECT_ID");
        let credentials_path = non_empty("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from);
        let emulator_host = non_empty("FIRESTORE_EMULATOR_HOST");

        // Emulator needs a project id, real Firestore needs a key
        match (&emulator_host, &credentials_path) {
            (Some(_), _) if project_id.is_none() => {
                return Err(ConfigError {
                    field: "FIRESTORE_PROJECT_ID",
                    message: "Required when FIRESTORE_EMULATOR_HOST is set".into(),
                });
            }
            (None, None) => {
                return Err(ConfigError {
                    field: "GOOGLE_APPLICATION_CREDENTIALS",
                    message: "Path to a service account key is required".into(),
                });
            }
            _ => {}
        }

        let database_id =
            non_empty("FIRESTORE_DATABASE_ID").unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let timeout = match non_empty("FIRESTORE_TIMEOUT_SECS") {
            None => Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e| ConfigError {
                    field: "FIRESTORE_TIMEOUT_SECS",
                    message: format!("Invalid number '{}': {}", raw, e),
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        let log_format =
            LogFormat::from_str(&lookup("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            project_id,
            credentials_path,
            emulator_host,
            database_id,
            timeout,
            log_format,
        })
    }

    /// Log warnings about risky configuration. The emulator warning is logged
    /// by the firestore adapter when the app is built.
    pub fn warn_if_risky(&self) {
        if self.timeout.is_none() {
            tracing::warn!("FIRESTORE_TIMEOUT_SECS=0: remote calls have no deadline");
        }
    }
}
