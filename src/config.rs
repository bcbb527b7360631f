//! Room configuration.
//!
//! Options are read from a JSON file using the camelCase names end users
//! know; anything unknown is ignored. The [`DistConfig`] projection is the
//! only shape that ever reaches end-user clients.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file")]
    Parse(#[from] serde_json::Error),
}

/// Where layer snapshots go, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    None,
    Fs,
    Broker,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub title: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub layer_count: usize,
    /// Reserved; accepted for compatibility, not used.
    pub max_paint_log_count: usize,
    /// Reserved; accepted for compatibility, not used.
    pub max_chat_log_count: usize,
    pub data_dir: Option<String>,
    pub data_file_prefix: String,
    pub redis_host: Option<String>,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_key_prefix: String,
    pub client_dir: Option<String>,
    pub client_version: Option<String>,
    pub forwarded_header_type: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            title: "PaintChat".to_string(),
            canvas_width: 1920,
            canvas_height: 1080,
            layer_count: 3,
            max_paint_log_count: 2000,
            max_chat_log_count: 100,
            data_dir: None,
            data_file_prefix: String::new(),
            redis_host: None,
            redis_port: 6379,
            redis_password: None,
            redis_key_prefix: String::new(),
            client_dir: None,
            client_version: None,
            forwarded_header_type: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Broker mode wins over filesystem persistence; a missing, empty or
    /// `/dev/null` data dir disables persistence entirely.
    pub fn data_mode(&self) -> DataMode {
        if self.redis_host.is_some() {
            return DataMode::Broker;
        }
        match self.data_dir.as_deref() {
            Some("") | Some("/dev/null") | None => DataMode::None,
            Some(_) => DataMode::Fs,
        }
    }

    /// Whether `X-Forwarded-For` is trusted for remote-address logging.
    /// Only the literal `XFF` enables it.
    pub fn trusts_forwarded_for(&self) -> bool {
        self.forwarded_header_type.as_deref() == Some("XFF")
    }

    pub fn redis_url(&self) -> Option<String> {
        let host = self.redis_host.as_deref()?;
        Some(match self.redis_password.as_deref() {
            Some(pass) => format!("redis://:{}@{}:{}/", pass, host, self.redis_port),
            None => format!("redis://{}:{}/", host, self.redis_port),
        })
    }

    pub fn distributable(&self) -> DistConfig {
        DistConfig {
            title: self.title.clone(),
            canvas_width: self.canvas_width,
            canvas_height: self.canvas_height,
            layer_count: self.layer_count,
            version: VersionInfo {
                server: SERVER_VERSION.to_string(),
                client: self.client_version.clone(),
            },
        }
    }
}

/// Public projection of the room config, served at `/config` and sent in
/// the `config` socket event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistConfig {
    pub title: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub layer_count: usize,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub client: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!("PaintChat", cfg.title);
        assert_eq!((1920, 1080), (cfg.canvas_width, cfg.canvas_height));
        assert_eq!(3, cfg.layer_count);
        assert_eq!(DataMode::None, cfg.data_mode());
    }

    #[test]
    fn parse_camel_case() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "title": "doodle",
                "canvasWidth": 640,
                "canvasHeight": 480,
                "layerCount": 2,
                "dataDir": "/var/lib/reichat",
                "dataFilePrefix": "room1-",
                "forwardedHeaderType": "XFF"
            }"#,
        )
        .unwrap();
        assert_eq!("doodle", cfg.title);
        assert_eq!(640, cfg.canvas_width);
        assert_eq!(2, cfg.layer_count);
        assert_eq!(DataMode::Fs, cfg.data_mode());
        assert!(cfg.trusts_forwarded_for());
    }

    #[test]
    fn data_mode_rules() {
        let mut cfg = Config::default();
        cfg.data_dir = Some("/dev/null".to_string());
        assert_eq!(DataMode::None, cfg.data_mode());
        cfg.data_dir = Some(String::new());
        assert_eq!(DataMode::None, cfg.data_mode());
        cfg.data_dir = Some("data".to_string());
        assert_eq!(DataMode::Fs, cfg.data_mode());
        // Broker mode disables filesystem persistence.
        cfg.redis_host = Some("127.0.0.1".to_string());
        assert_eq!(DataMode::Broker, cfg.data_mode());
    }

    #[test]
    fn forwarded_header_fallback() {
        let mut cfg = Config::default();
        assert!(!cfg.trusts_forwarded_for());
        cfg.forwarded_header_type = Some("Forwarded".to_string());
        assert!(!cfg.trusts_forwarded_for());
        cfg.forwarded_header_type = Some("XFF".to_string());
        assert!(cfg.trusts_forwarded_for());
    }

    #[test]
    fn redis_url() {
        let mut cfg = Config::default();
        assert_eq!(None, cfg.redis_url());
        cfg.redis_host = Some("broker.local".to_string());
        assert_eq!(
            Some("redis://broker.local:6379/".to_string()),
            cfg.redis_url()
        );
        cfg.redis_password = Some("hunter2".to_string());
        assert_eq!(
            Some("redis://:hunter2@broker.local:6379/".to_string()),
            cfg.redis_url()
        );
    }
}
