use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ptftp_roots::{DEFAULT_CLIENT, FileRootRegistry, RootRegistry, StaticRootRegistry};

use crate::error::{Result, TftpError};
use crate::server::{DEFAULT_MAX_SESSIONS, SessionSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    /// Well-known address; IPv4 only
    pub bind_addr: SocketAddrV4,
    pub max_sessions: usize,
    pub session: SessionConfig,
    pub roots: RootsConfig,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 69),
            max_sessions: DEFAULT_MAX_SESSIONS,
            session: SessionConfig::default(),
            roots: RootsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// ACK timeout used when the client does not negotiate `timeout`
    pub default_timeout_secs: u64,
    pub retry_count: u32,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let settings = SessionSettings::default();
        Self {
            default_timeout_secs: settings.default_timeout.as_secs(),
            retry_count: settings.retry_count,
            poll_interval_ms: u64::try_from(settings.poll_interval.as_millis()).unwrap_or(1000),
            shutdown_timeout_secs: settings.shutdown_timeout.as_secs(),
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            retry_count: config.retry_count,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        }
    }
}

/// Where client roots come from: a directory with one file per client IP,
/// or a fixed table when no directory is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(rename = "static")]
    pub static_roots: StaticRootRegistry,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            static_roots: StaticRootRegistry::new().with_root(DEFAULT_CLIENT, "/srv/tftp"),
        }
    }
}

impl RootsConfig {
    pub fn registry(&self) -> Arc<dyn RootRegistry> {
        match self.dir {
            Some(ref dir) => Arc::new(FileRootRegistry::new(dir.clone())),
            None => Arc::new(self.static_roots.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Emit structured audit events alongside regular logs
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check the configuration before anything is bound or spawned.
///
/// With `validate_bind` the well-known address is also test-bound.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    if config.max_sessions == 0 {
        return Err(TftpError::Config(
            "max_sessions must be at least 1".to_string(),
        ));
    }

    validate_session_config(&config.session)?;
    validate_roots_config(&config.roots)?;

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}

fn validate_session_config(config: &SessionConfig) -> Result<()> {
    if !(1..=255).contains(&config.default_timeout_secs) {
        return Err(TftpError::Config(
            "session.default_timeout_secs must be in range 1-255".to_string(),
        ));
    }
    if config.retry_count == 0 {
        return Err(TftpError::Config(
            "session.retry_count must be at least 1".to_string(),
        ));
    }
    if config.poll_interval_ms == 0 {
        return Err(TftpError::Config(
            "session.poll_interval_ms must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_roots_config(config: &RootsConfig) -> Result<()> {
    match config.dir {
        Some(ref dir) => {
            if !dir.is_absolute() {
                return Err(TftpError::Config(
                    "roots.dir must be an absolute path".to_string(),
                ));
            }
            match std::fs::metadata(dir) {
                Ok(meta) if meta.is_dir() => Ok(()),
                Ok(_) => Err(TftpError::Config(
                    "roots.dir must be a directory".to_string(),
                )),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TftpError::Config(
                    "roots.dir does not exist; create it or adjust config".to_string(),
                )),
                Err(e) => Err(TftpError::Io(e)),
            }
        }
        None => {
            if config.static_roots.is_empty() {
                return Err(TftpError::Config(
                    "either roots.dir or at least one roots.static entry is required".to_string(),
                ));
            }
            config
                .static_roots
                .validate()
                .map_err(|e| TftpError::Config(format!("roots.static: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = TempDir::new()?;
        let toml = format!(
            r#"
bind_addr = "127.0.0.1:6969"

[roots.static]
"0.0.0.0" = "{}"
"10.0.0.5" = "/srv/tftp/10.0.0.5"
"#,
            root_dir.path().display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        validate_config(&config, false)?;

        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.static_root("10.0.0.5"), Some(PathBuf::from("/srv/tftp/10.0.0.5")));
        let settings = SessionSettings::from(&config.session);
        assert_eq!(settings, SessionSettings::default());
        Ok(())
    }

    impl TftpConfig {
        fn static_root(&self, client_ip: &str) -> Option<PathBuf> {
            self.roots.static_roots.roots().get(client_ip).cloned()
        }
    }

    #[test]
    fn default_config_round_trips_through_file(
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ptftp.toml");
        let mut config = TftpConfig::default();
        config.session.default_timeout_secs = 3;
        config.logging.format = LogFormat::Json;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        assert_eq!(loaded.session.default_timeout_secs, 3);
        assert_eq!(loaded.logging.format, LogFormat::Json);
        assert_eq!(loaded.static_root(DEFAULT_CLIENT), Some(PathBuf::from("/srv/tftp")));
        Ok(())
    }

    #[test]
    fn rejects_zero_bind_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            bind_addr: "127.0.0.1:0".parse()?,
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero bind port".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr port must be non-zero"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_sessions_and_bad_timeouts() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let config = TftpConfig {
            max_sessions: 0,
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero max_sessions".into()),
            Err(err) => assert!(format!("{err}").contains("max_sessions")),
        }

        for timeout in [0, 256] {
            let mut config = TftpConfig::default();
            config.session.default_timeout_secs = timeout;
            match validate_config(&config, false) {
                Ok(()) => return Err(format!("expected error for timeout {timeout}").into()),
                Err(err) => assert!(format!("{err}").contains("default_timeout_secs")),
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_relative_or_missing_roots_dir() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let mut config = TftpConfig::default();
        config.roots.dir = Some(PathBuf::from("relative/roots"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative roots.dir".into()),
            Err(err) => assert!(format!("{err}").contains("roots.dir must be an absolute path")),
        }

        config.roots.dir = Some(PathBuf::from("/nonexistent/ptftp/roots"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing roots.dir".into()),
            Err(err) => assert!(format!("{err}").contains("roots.dir does not exist")),
        }
        Ok(())
    }

    #[test]
    fn rejects_static_roots_with_bad_keys() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.roots.static_roots = StaticRootRegistry::new().with_root("../../etc", "/srv/tftp");
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for invalid static root key".into()),
            Err(err) => assert!(format!("{err}").contains("roots.static")),
        }

        config.roots.static_roots = StaticRootRegistry::new();
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for empty roots".into()),
            Err(err) => assert!(format!("{err}").contains("at least one roots.static entry")),
        }
        Ok(())
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.logging.file = Some(PathBuf::from("/nonexistent/ptftp/ptftp.log"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for logging.file parent".into()),
            Err(err) => {
                assert!(format!("{err}").contains("logging.file parent error"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let config = TftpConfig {
            bind_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            ..Default::default()
        };
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr is not available"));
            }
        }
        Ok(())
    }

    #[test]
    fn directory_roots_select_file_registry() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let roots_dir = TempDir::new()?;
        let serve_dir = TempDir::new()?;
        FileRootRegistry::new(roots_dir.path()).set_root("10.1.2.3", serve_dir.path())?;

        let config = RootsConfig {
            dir: Some(roots_dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(
            config.registry().find_root_path("10.1.2.3")?,
            serve_dir.path().to_path_buf()
        );
        Ok(())
    }
}
