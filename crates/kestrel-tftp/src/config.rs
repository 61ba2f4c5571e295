use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};
use crate::options::{Bound, Policy};
use crate::packet::MAX_BLOCK_SIZE;

/// Idle timeout used when the server was handed its socket by a supervisor
pub const SUPERVISED_IDLE_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub bind_addr: SocketAddr,
    pub root_dir: PathBuf,
    /// Block size bounds in bytes (RFC 2348)
    pub blksize: Bound,
    /// Timeout bounds in seconds (RFC 2349)
    pub timeout: Bound,
    /// Accepted for compatibility with older configs; never enforced
    pub retries: u32,
    /// Stop after this many seconds without an active transfer. 0 disables.
    pub idle_timeout_secs: u64,
    /// Account to switch to after binding when started as root
    pub user: String,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        let policy = Policy::default();
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 69),
            root_dir: PathBuf::from("/var/lib/tftpboot"),
            blksize: policy.blksize,
            timeout: policy.timeout,
            retries: policy.retries,
            idle_timeout_secs: 0,
            user: "nobody".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TftpConfig {
    /// Negotiation policy shared by every session.
    pub fn policy(&self) -> Policy {
        Policy {
            blksize: self.blksize,
            timeout: self.timeout,
            retries: self.retries,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured JSON audit events alongside the regular log
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
    Text,
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents).map_err(|e| {
        TftpError::InvalidConfig(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check a configuration before the server starts.
///
/// With `validate_bind` set, the well-known address is also test-bound and
/// released again.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::InvalidConfig(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::InvalidConfig(
                    "root_dir must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::InvalidConfig(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::InvalidConfig(format!(
            "root_dir is not readable: {}",
            e
        )));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::InvalidConfig(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::InvalidConfig(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    validate_bound("blksize", &config.blksize, 8, MAX_BLOCK_SIZE as u64)?;
    validate_bound("timeout", &config.timeout, 1, 255)?;

    if config.user.trim().is_empty() {
        return Err(TftpError::InvalidConfig("user must not be empty".to_string()));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::InvalidConfig("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::InvalidConfig(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::InvalidConfig(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::InvalidConfig(format!("logging.file not writable: {}", e)))?;
    }

    Ok(())
}

// min <= default <= max, all inside the protocol's own limits
fn validate_bound(name: &str, bound: &Bound, floor: u64, ceiling: u64) -> Result<()> {
    if bound.min < floor || bound.max > ceiling {
        return Err(TftpError::InvalidConfig(format!(
            "{} bounds must be within {}-{}",
            name, floor, ceiling
        )));
    }
    if !(bound.min <= bound.default && bound.default <= bound.max) {
        return Err(TftpError::InvalidConfig(format!(
            "{} must satisfy min <= default <= max (got {} <= {} <= {})",
            name, bound.min, bound.default, bound.max
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "kestrel_tftp_test_{}_{}",
            name,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn defaults_match_pxe_friendly_policy() {
        let config = TftpConfig::default();
        assert_eq!(config.bind_addr.port(), 69);
        assert_eq!(config.root_dir, PathBuf::from("/var/lib/tftpboot"));
        assert_eq!(config.policy(), Policy::default());
        assert_eq!(config.user, "nobody");
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.logging.audit_enabled);
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"
idle_timeout_secs = 45

[blksize]
default = 512
min = 512
max = 8192
"#,
            root_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        validate_config(&config, false)?;
        assert_eq!(config.blksize.max, 8192);
        assert_eq!(config.timeout, Policy::default().timeout);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(45)));
        Ok(())
    }

    #[test]
    fn written_config_loads_back() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("write")?;
        let path = dir.join("tftp.toml");
        let mut config = TftpConfig::default();
        config.root_dir = dir.clone();
        config.logging.format = LogFormat::Json;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        assert_eq!(loaded.root_dir, dir);
        assert_eq!(loaded.logging.format, LogFormat::Json);
        assert_eq!(loaded.policy(), config.policy());
        Ok(())
    }

    #[test]
    fn rejects_garbage_config_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("garbage")?;
        let path = dir.join("tftp.toml");
        std::fs::write(&path, "bind_addr = 69\n")?;
        match load_config(&path) {
            Ok(_) => return Err("expected error for bad bind_addr".into()),
            Err(err) => assert!(format!("{err}").contains("Invalid config file")),
        }
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("relative/path"),
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir must be an absolute path"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_missing_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("/nonexistent/kestrel-tftp"),
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir does not exist"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_bind_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind")?;
        config.bind_addr = "127.0.0.1:0".parse()?;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero bind port".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr port must be non-zero"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_inverted_blksize_bounds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("blksize")?;
        config.blksize = Bound {
            default: 2048,
            min: 512,
            max: 1428,
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for default above max".into()),
            Err(err) => {
                assert!(format!("{err}").contains("min <= default <= max"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_out_of_protocol_bounds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("limits")?;
        config.blksize.max = 65465;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for blksize above 65464".into()),
            Err(err) => assert!(format!("{err}").contains("blksize bounds must be within")),
        }

        config.blksize = Policy::default().blksize;
        config.timeout.min = 0;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero timeout".into()),
            Err(err) => assert!(format!("{err}").contains("timeout bounds must be within")),
        }
        Ok(())
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("logfile")?;
        config.logging.file = Some(PathBuf::from("/nonexistent/kestrel-tftp/log.txt"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for logging.file parent".into()),
            Err(err) => {
                assert!(format!("{err}").contains("logging.file parent error"));
            }
        }
        Ok(())
    }

    #[test]
    fn validates_bind_addr_availability_on_free_port()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let log_dir = temp_dir("bind_av_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-available")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        validate_config(&config, true)?;
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-in-use")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr is not available"));
            }
        }
        Ok(())
    }
}
