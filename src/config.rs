//! Configuration for the tunnel daemon.
//!
//! JSON-based configuration covering logging, session behaviour, the SOCKS
//! listener, the carrier API credentials and the QR toolchain. Every field
//! has a default; a missing file is not an error, an invalid one is.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, KEY_LEN};

/// Error types for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session.secret: {0}")]
    Secret(#[from] crypto::CryptoError),

    #[error("clubs is missing")]
    NoClubs,

    #[error("users is missing")]
    NoUsers,

    #[error("club `{0}`: {1} is missing")]
    ClubField(String, &'static str),

    #[error("user `{0}`: {1} is missing")]
    UserField(String, &'static str),

    #[error("session.queueSize must be > 0")]
    InvalidQueueSize,

    #[error("socks.{0} must be > 0")]
    InvalidSocksField(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub session: SessionConfig,
    pub socks: SocksConfig,
    pub api: ApiConfig,
    pub qr: QrConfig,
    pub clubs: Vec<ClubConfig>,
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing or empty file yields the defaults; absent credentials are
    /// then caught by `validate`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&content)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clubs.is_empty() {
            return Err(ConfigError::NoClubs);
        }

        if self.users.is_empty() {
            return Err(ConfigError::NoUsers);
        }

        for club in &self.clubs {
            if club.name.is_empty() {
                return Err(ConfigError::ClubField("?".into(), "name"));
            }
            if club.id.is_empty() {
                return Err(ConfigError::ClubField(club.name.clone(), "id"));
            }
            if club.access_token.is_empty() {
                return Err(ConfigError::ClubField(club.name.clone(), "accessToken"));
            }
            if club.album_id.is_empty() {
                return Err(ConfigError::ClubField(club.name.clone(), "albumID"));
            }
        }

        for user in &self.users {
            if user.name.is_empty() {
                return Err(ConfigError::UserField("?".into(), "name"));
            }
            if user.id.is_empty() {
                return Err(ConfigError::UserField(user.name.clone(), "id"));
            }
            if user.access_token.is_empty() {
                return Err(ConfigError::UserField(user.name.clone(), "accessToken"));
            }
        }

        if self.session.queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }

        if self.socks.read_size == 0 {
            return Err(ConfigError::InvalidSocksField("readSize"));
        }

        if self.socks.forward_size == 0 {
            return Err(ConfigError::InvalidSocksField("forwardSize"));
        }

        self.session.secret_key()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Verbosity in slog-style units: -4 debug, 0 info, 4 warn, 8 error.
    pub level: i32,

    /// Log file path; empty logs to stderr.
    pub output: String,

    /// Dump payload bytes as hex at debug level.
    pub payload: bool,
}

impl LogConfig {
    pub fn level_as_tracing(&self) -> tracing::Level {
        if self.level <= -4 {
            tracing::Level::DEBUG
        } else if self.level <= 0 {
            tracing::Level::INFO
        } else if self.level <= 4 {
            tracing::Level::WARN
        } else {
            tracing::Level::ERROR
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound of the per-session datagram and peer-write queues.
    #[serde(rename = "queueSize")]
    pub queue_size: usize,

    /// Idle close threshold in milliseconds; 0 disables reaping.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,

    /// Hex-encoded 32-byte pre-shared secret sealing CONNECT payloads.
    /// When empty, CONNECT payloads travel unencrypted and both peers must
    /// agree on that.
    pub secret: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_size: 500,
            timeout_ms: 30_000,
            secret: String::new(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn secret_key(&self) -> Result<Option<[u8; KEY_LEN]>, crypto::CryptoError> {
        if self.secret.is_empty() {
            return Ok(None);
        }

        crypto::hex_to_key(&self.secret).map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
    #[serde(rename = "listenHost")]
    pub listen_host: String,

    #[serde(rename = "listenPort")]
    pub listen_port: u16,

    /// Size of the read buffer handed to each peer recv.
    #[serde(rename = "readSize")]
    pub read_size: usize,

    #[serde(rename = "readTimeout")]
    pub read_timeout_ms: u64,

    #[serde(rename = "writeTimeout")]
    pub write_timeout_ms: u64,

    /// Largest FORWARD payload cut from the batch buffer.
    #[serde(rename = "forwardSize")]
    pub forward_size: usize,

    /// Batcher tick converting bursty reads into bounded carrier calls.
    #[serde(rename = "forwardInterval")]
    pub forward_interval_ms: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 1080,
            read_size: 4096,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            forward_size: 3000,
            forward_interval_ms: 300,
        }
    }
}

impl SocksConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn forward_interval(&self) -> Duration {
        Duration::from_millis(self.forward_interval_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,

    pub origin: String,

    pub version: String,

    /// Run without user tokens: disables the carrier methods that need an
    /// authorised user (QR photos, video/photo comments).
    pub unathorized: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 7_000,
            origin: "https://api.vk.com".to_string(),
            version: "5.199".to_string(),
            unathorized: false,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ClubConfig {
    pub name: String,
    pub id: String,

    #[serde(rename = "accessToken")]
    pub access_token: String,

    #[serde(rename = "albumID")]
    pub album_id: String,

    /// Target of the photo-comment carrier.
    #[serde(rename = "photoID")]
    pub photo_id: String,

    /// Target of the video-comment carrier.
    #[serde(rename = "videoID")]
    pub video_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    pub id: String,

    #[serde(rename = "accessToken")]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    #[serde(rename = "zbarPath")]
    pub zbar_path: String,

    #[serde(rename = "zbarTimeout")]
    pub zbar_timeout_ms: u64,

    /// Pixel side of a single QR tile; merged grids are multiples of it.
    #[serde(rename = "imageSize")]
    pub image_size: u32,

    /// Error-correction level 0..=3 (L, M, Q, H).
    #[serde(rename = "imageLevel")]
    pub image_level: u8,

    #[serde(rename = "saveDir")]
    pub save_dir: String,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            zbar_path: "/usr/local/bin/zbarimg".to_string(),
            zbar_timeout_ms: 5_000,
            image_size: 512,
            image_level: 1,
            save_dir: String::new(),
        }
    }
}

impl QrConfig {
    pub fn zbar_timeout(&self) -> Duration {
        Duration::from_millis(self.zbar_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Config {
        let mut cfg = Config::default();
        cfg.clubs.push(ClubConfig {
            name: "club".into(),
            id: "100".into(),
            access_token: "token".into(),
            album_id: "1".into(),
            photo_id: "2".into(),
            video_id: "3".into(),
        });
        cfg.users.push(UserConfig {
            name: "user".into(),
            id: "200".into(),
            access_token: "token".into(),
        });
        cfg
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();

        assert_eq!(cfg.session.queue_size, 500);
        assert_eq!(cfg.socks.listen_addr(), "127.0.0.1:1080");
        assert_eq!(cfg.socks.forward_interval(), Duration::from_millis(300));
        assert_eq!(cfg.api.timeout(), Duration::from_millis(7000));
        assert!(!cfg.api.unathorized);
    }

    #[test]
    fn validate_requires_credentials() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::NoClubs)
        ));

        let mut cfg = populated();
        assert!(cfg.validate().is_ok());

        cfg.clubs[0].access_token.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_secret() {
        let mut cfg = populated();
        cfg.session.secret = "not-hex".into();

        assert!(matches!(cfg.validate(), Err(ConfigError::Secret(_))));
    }

    #[test]
    fn secret_key_is_optional() {
        let cfg = populated();
        assert_eq!(cfg.session.secret_key().unwrap(), None);

        let mut cfg = populated();
        cfg.session.secret = crate::crypto::generate_secret();
        assert!(cfg.session.secret_key().unwrap().is_some());
    }

    #[test]
    fn parses_camel_case_fields() {
        let json = r#"{
            "session": {"queueSize": 10, "timeout": 1000},
            "socks": {"listenHost": "0.0.0.0", "listenPort": 1081, "forwardInterval": 500},
            "api": {"unathorized": true}
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();

        assert_eq!(cfg.session.queue_size, 10);
        assert_eq!(cfg.socks.listen_addr(), "0.0.0.0:1081");
        assert_eq!(cfg.socks.forward_interval(), Duration::from_millis(500));
        assert!(cfg.api.unathorized);
        assert_eq!(cfg.socks.read_size, 4096);
    }

    #[test]
    fn log_level_mapping() {
        let mut log = LogConfig::default();
        assert_eq!(log.level_as_tracing(), tracing::Level::INFO);

        log.level = -4;
        assert_eq!(log.level_as_tracing(), tracing::Level::DEBUG);

        log.level = 8;
        assert_eq!(log.level_as_tracing(), tracing::Level::ERROR);
    }
}
