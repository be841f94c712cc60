//! Service configuration.
//!
//! Configuration is read from TOML. Every field has a default, so an empty
//! file is valid:
//!
//! ```toml
//! version = "0.1.0"
//! max_frame_size = 67108864
//! handshake_timeout_ms = 10000
//! idle_timeout_ms = 30000
//! call_timeout_ms = 5000
//!
//! [worker]
//! program = "/usr/local/bin/tsunagi-echo-worker"
//! args = []
//! cwd = "/tmp"
//! ```
//!
//! User config location: `<config dir>/tsunagi/tsunagi.toml`, where the
//! config dir is `$XDG_CONFIG_HOME` or `~/.config` on Linux.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Environment variable that replaces `worker.program`.
pub const WORKER_PATH_ENV: &str = "TSUNAGI_WORKER_PATH";

/// Worker started when none is configured, looked up on `PATH`.
pub const DEFAULT_WORKER_PROGRAM: &str = "tsunagi-echo-worker";

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How to launch the worker executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_PROGRAM)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Sent in the handshake; the worker must report the same string.
    pub version: String,
    /// Largest accepted payload, in bytes, in either direction.
    pub max_frame_size: usize,
    pub handshake_timeout_ms: u64,
    /// Stop the worker after it has been idle this long.
    pub idle_timeout_ms: Option<u64>,
    /// Default for `Service::call_with_timeout`.
    pub call_timeout_ms: Option<u64>,
    pub worker: WorkerCommand,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            idle_timeout_ms: None,
            call_timeout_ms: None,
            worker: WorkerCommand::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults with the given worker program.
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            worker: WorkerCommand::new(program),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document. Environment overrides are not
    /// applied.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.version.is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".into()));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be positive".into()));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} does not fit in a 32-bit length prefix",
                self.max_frame_size
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("idle_timeout_ms must be positive".into()));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker.program must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `TSUNAGI_WORKER_PATH` if it is set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(program) = std::env::var_os(WORKER_PATH_ENV).filter(|p| !p.is_empty()) {
            log::debug!(
                target: "tsunagi::config",
                "{} overrides worker program: {:?}",
                WORKER_PATH_ENV,
                program
            );
            self.worker.program = PathBuf::from(program);
        }
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Load a configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> ConfigResult<ServiceConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ServiceConfig::from_toml_str(&content)?.with_env_overrides())
}

/// Returns the path to the user configuration file.
///
/// Returns None if the platform config directory cannot be determined.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tsunagi").join("tsunagi.toml"))
}

/// Load the user configuration if the file exists.
pub fn load_user_config() -> ConfigResult<Option<ServiceConfig>> {
    match user_config_path() {
        Some(path) if path.is_file() => load_config(&path).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    /// Run `f` with `key` set to `value`, restoring the previous state after.
    fn with_env<T>(key: &str, value: Option<&Path>, f: impl FnOnce() -> T) -> T {
        let original = env::var_os(key);
        // SAFETY: callers are #[serial] so no other test touches the environment
        unsafe {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let result = f();
        // SAFETY: as above
        unsafe {
            match original {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        result
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.max_frame_size, 64 * 1024 * 1024);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.worker.program, PathBuf::from(DEFAULT_WORKER_PROGRAM));
    }

    #[test]
    fn test_full_document_is_parsed() {
        let config = ServiceConfig::from_toml_str(
            r#"
            version = "2.0.0"
            max_frame_size = 1024
            handshake_timeout_ms = 500
            idle_timeout_ms = 30000
            call_timeout_ms = 5000

            [worker]
            program = "/opt/worker"
            args = ["--quiet"]
            cwd = "/srv"
            "#,
        )
        .unwrap();

        assert_eq!(config.version, "2.0.0");
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(500));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.worker.program, PathBuf::from("/opt/worker"));
        assert_eq!(config.worker.args, vec!["--quiet".to_string()]);
        assert_eq!(config.worker.cwd, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = ServiceConfig::from_toml_str("max_frame = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for content in [
            "version = \"\"",
            "max_frame_size = 0",
            "max_frame_size = 8589934592",
            "handshake_timeout_ms = 0",
            "idle_timeout_ms = 0",
            "[worker]\nprogram = \"\"",
        ] {
            let err = ServiceConfig::from_toml_str(content).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(_)),
                "{content:?} should be invalid, got {err:?}"
            );
        }
    }

    #[test]
    #[serial(env)]
    fn test_load_config_reads_file_and_applies_override() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("tsunagi.toml");
        fs::write(&path, "[worker]\nprogram = \"/from/file\"\n").expect("failed to write config");

        let from_file = with_env(WORKER_PATH_ENV, None, || load_config(&path).unwrap());
        assert_eq!(from_file.worker.program, PathBuf::from("/from/file"));

        let overridden = with_env(WORKER_PATH_ENV, Some(Path::new("/from/env")), || {
            load_config(&path).unwrap()
        });
        assert_eq!(overridden.worker.program, PathBuf::from("/from/env"));
    }

    #[test]
    #[serial(env)]
    fn test_empty_override_is_ignored() {
        let config = with_env(WORKER_PATH_ENV, Some(Path::new("")), || {
            ServiceConfig::for_program("/kept").with_env_overrides()
        });
        assert_eq!(config.worker.program, PathBuf::from("/kept"));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial(env)]
    fn test_user_config_is_loaded_from_xdg_config_home() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config_dir = dir.path().join("tsunagi");
        fs::create_dir_all(&config_dir).expect("failed to create config dir");
        fs::write(config_dir.join("tsunagi.toml"), "idle_timeout_ms = 1500\n")
            .expect("failed to write config");

        let (path, loaded) = with_env("XDG_CONFIG_HOME", Some(dir.path()), || {
            (user_config_path(), load_user_config())
        });

        assert_eq!(path, Some(config_dir.join("tsunagi.toml")));
        let loaded = loaded.unwrap().expect("user config should exist");
        assert_eq!(loaded.idle_timeout(), Some(Duration::from_millis(1500)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial(env)]
    fn test_user_config_applies_worker_path_override() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config_dir = dir.path().join("tsunagi");
        fs::create_dir_all(&config_dir).expect("failed to create config dir");
        fs::write(
            config_dir.join("tsunagi.toml"),
            "[worker]\nprogram = \"/from/file\"\n",
        )
        .expect("failed to write config");

        let loaded = with_env("XDG_CONFIG_HOME", Some(dir.path()), || {
            with_env(WORKER_PATH_ENV, Some(Path::new("/from/env")), load_user_config)
        });

        let loaded = loaded.unwrap().expect("user config should exist");
        assert_eq!(loaded.worker.program, PathBuf::from("/from/env"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial(env)]
    fn test_absent_user_config_is_not_an_error() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let loaded = with_env("XDG_CONFIG_HOME", Some(dir.path()), load_user_config);
        assert!(loaded.unwrap().is_none());
    }
}
