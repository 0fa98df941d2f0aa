use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{RelayError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Declared configuration of one logical ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestCfg {
    pub name: String,
    pub url_path: String,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Bounded per-output packet queue depth. Lower it on small hosts.
    #[serde(default = "default_queue_size")]
    pub output_queue_size: usize,
    #[serde(default)]
    pub srt_settings: SrtSettings,
    #[serde(default)]
    pub inputs: Vec<IngestCfg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_rtmp_port")]
    pub rtmp_port: u16,
    #[serde(default = "default_srt_port")]
    pub srt_port: u16,
    #[serde(default = "default_whip_port")]
    pub whip_port: u16,
    #[serde(default)]
    pub api_username: String,
    #[serde(default)]
    pub api_password: String,
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_log_file() -> String {
    "xrelay.log".to_string()
}

fn default_queue_size() -> usize {
    5000
}

fn default_api_port() -> u16 {
    8080
}

fn default_rtmp_port() -> u16 {
    1935
}

fn default_srt_port() -> u16 {
    9000
}

fn default_whip_port() -> u16 {
    8081
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SrtSettings {
    /// Dial timeout, milliseconds.
    pub connect_timeout: u64,
    /// SRT latency, milliseconds.
    pub latency: u64,
    #[serde(default)]
    pub encryption: String,
    #[serde(default)]
    pub passphrase: String,
    /// Default streamid: applied to egress dials and used as the fallback
    /// ingest name for publishers that connect without one.
    #[serde(default)]
    pub streamid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            reconnect_interval: 5,
            log_to_file: false,
            log_file: "xrelay.log".to_string(),
            output_queue_size: 5000,
            srt_settings: SrtSettings::default(),
            inputs: Vec::new(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            rtmp_port: 1935,
            srt_port: 9000,
            whip_port: 8081,
            api_username: String::new(),
            api_password: String::new(),
        }
    }
}

/// Subset of the settings the control API may read and write. Server
/// ports and credentials are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub srt_settings: SrtSettings,
    pub log_to_file: bool,
    pub log_file: String,
    pub reconnect_interval: u64,
}

impl From<&Settings> for GlobalSettings {
    fn from(s: &Settings) -> Self {
        Self {
            srt_settings: s.srt_settings.clone(),
            log_to_file: s.log_to_file,
            log_file: s.log_file.clone(),
            reconnect_interval: s.reconnect_interval,
        }
    }
}

pub struct ConfigManager {
    path: PathBuf,
    settings: Settings,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let path = Self::find_config_file()?;
        let settings = Self::load_from(&path)?;
        Ok(Self { path, settings })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = Self::load_from(&path)?;
        Ok(Self { path, settings })
    }

    fn find_config_file() -> Result<PathBuf> {
        let possible_paths = [
            std::env::var("XRELAY_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from(DEFAULT_CONFIG_PATH)),
            Some(PathBuf::from("config/config.yaml")),
            Some(PathBuf::from("/etc/xrelay/config.yaml")),
        ];

        for path in possible_paths.iter().flatten() {
            if path.exists() {
                log::info!("Using config file: {}", path.display());
                return Ok(path.clone());
            }
        }

        Err(RelayError::ConfigError {
            message: "No configuration file found. Tried: config.yaml, config/config.yaml, /etc/xrelay/config.yaml"
                .to_string(),
        })
    }

    fn load_from(path: &Path) -> Result<Settings> {
        let mut builder = Config::builder();

        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(RelayError::ConfigError {
                message: format!("Config file not found: {}", path.display()),
            });
        }

        builder = builder.add_source(Environment::with_prefix("XRELAY").separator("__"));

        builder = builder
            .set_default("server.port", 8080)?
            .set_default("server.rtmp_port", 1935)?
            .set_default("server.srt_port", 9000)?
            .set_default("server.whip_port", 8081)?
            .set_default("server.api_username", "")?
            .set_default("server.api_password", "")?
            .set_default("reconnect_interval", 5)?
            .set_default("log_to_file", false)?
            .set_default("log_file", "xrelay.log")?
            .set_default("output_queue_size", 5000)?
            .set_default("srt_settings.connect_timeout", 3000)?
            .set_default("srt_settings.latency", 120)?
            .set_default("srt_settings.encryption", "")?
            .set_default("srt_settings.passphrase", "")?
            .set_default("srt_settings.streamid", "")?;

        let config = builder.build().map_err(|e| RelayError::ConfigError {
            message: format!("Failed to build config: {}", e),
        })?;

        let settings: Settings =
            config
                .try_deserialize()
                .map_err(|e| RelayError::ConfigError {
                    message: format!("Failed to deserialize config: {}", e),
                })?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&mut self) -> Result<()> {
        log::info!("Reloading configuration from {}", self.path.display());
        self.settings = Self::load_from(&self.path)?;
        Ok(())
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return config_err("server.port must be between 1 and 65535");
        }
        if self.server.rtmp_port == 0 {
            return config_err("server.rtmp_port must be between 1 and 65535");
        }
        if self.server.srt_port == 0 {
            return config_err("server.srt_port must be between 1 and 65535");
        }
        if self.server.whip_port == 0 {
            return config_err("server.whip_port must be between 1 and 65535");
        }
        if self.reconnect_interval < 1 {
            return config_err("reconnect_interval must be >= 1");
        }
        if self.output_queue_size == 0 {
            return config_err("output_queue_size must be > 0");
        }

        let mut seen_paths = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for input in &self.inputs {
            if input.name.is_empty() {
                return config_err("input name cannot be empty");
            }
            if !seen_names.insert(input.name.clone()) {
                return Err(RelayError::ConfigError {
                    message: format!("duplicate input name: {}", input.name),
                });
            }
            if !input.url_path.starts_with('/') {
                return Err(RelayError::ConfigError {
                    message: format!("invalid url_path in input {}: must start with '/'", input.name),
                });
            }
            if !seen_paths.insert(input.url_path.clone()) {
                return Err(RelayError::ConfigError {
                    message: format!("duplicate url_path: {}", input.url_path),
                });
            }
            for out in &input.outputs {
                validate_output_url(out).map_err(|e| RelayError::ConfigError {
                    message: format!("invalid output URL '{}' in input {}: {}", out, input.name, e),
                })?;
            }
        }

        Ok(())
    }
}

/// Every output must parse as a URL; rtmp:// additionally needs a host.
pub fn validate_output_url(raw: &str) -> std::result::Result<(), String> {
    let parsed = Url::parse(raw).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "rtmp" => {
            if parsed.host_str().unwrap_or("").is_empty() {
                return Err("URL must be a valid RTMP address".to_string());
            }
        }
        "srt" | "file" => {}
        other => return Err(format!("unsupported output scheme: {}", other)),
    }
    Ok(())
}

/// Rewrites the outputs lists in config.yaml from the live ingest set,
/// leaving everything else in the file untouched.
pub fn save_outputs<P: AsRef<Path>>(path: P, inputs: &[IngestCfg]) -> Result<()> {
    let data = std::fs::read_to_string(path.as_ref())?;
    let mut cfg: Settings = serde_yaml::from_str(&data).map_err(|e| RelayError::ConfigError {
        message: format!("Failed to parse {}: {}", path.as_ref().display(), e),
    })?;

    for persisted in cfg.inputs.iter_mut() {
        if let Some(live) = inputs.iter().find(|i| i.name == persisted.name) {
            persisted.outputs = live.outputs.clone();
        }
    }
    for live in inputs {
        if !cfg.inputs.iter().any(|i| i.name == live.name) {
            cfg.inputs.push(live.clone());
        }
    }

    write_yaml(path.as_ref(), &cfg)
}

/// Persists the API-writable settings subset; server ports and
/// credentials in the file are preserved as-is.
pub fn save_settings<P: AsRef<Path>>(path: P, global: &GlobalSettings) -> Result<()> {
    let data = std::fs::read_to_string(path.as_ref())?;
    let mut cfg: Settings = serde_yaml::from_str(&data).map_err(|e| RelayError::ConfigError {
        message: format!("Failed to parse {}: {}", path.as_ref().display(), e),
    })?;

    cfg.srt_settings = global.srt_settings.clone();
    cfg.log_to_file = global.log_to_file;
    cfg.log_file = global.log_file.clone();
    cfg.reconnect_interval = global.reconnect_interval;

    write_yaml(path.as_ref(), &cfg)
}

fn write_yaml(path: &Path, cfg: &Settings) -> Result<()> {
    let out = serde_yaml::to_string(cfg).map_err(|e| RelayError::ConfigError {
        message: format!("Failed to serialize config: {}", e),
    })?;
    std::fs::write(path, out)?;
    log::info!("Configuration saved to {}", path.display());
    Ok(())
}

fn config_err<T>(message: &str) -> Result<T> {
    Err(RelayError::ConfigError {
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            inputs: vec![IngestCfg {
                name: "live".to_string(),
                url_path: "/live/a".to_string(),
                outputs: vec!["rtmp://example.com/live/key".to_string()],
            }],
            ..Settings::default()
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn duplicate_url_path_rejected() {
        let mut s = base_settings();
        s.inputs.push(IngestCfg {
            name: "other".to_string(),
            url_path: "/live/a".to_string(),
            outputs: vec![],
        });
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate url_path"));
    }

    #[test]
    fn url_path_must_start_with_slash() {
        let mut s = base_settings();
        s.inputs[0].url_path = "live/a".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn reconnect_interval_floor() {
        let mut s = base_settings();
        s.reconnect_interval = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn zero_ports_rejected() {
        for field in 0..4 {
            let mut s = base_settings();
            match field {
                0 => s.server.port = 0,
                1 => s.server.rtmp_port = 0,
                2 => s.server.srt_port = 0,
                _ => s.server.whip_port = 0,
            }
            let err = s.validate().unwrap_err();
            assert!(err.to_string().contains("must be between 1 and 65535"));
        }
    }

    #[test]
    fn rtmp_output_needs_host() {
        assert!(validate_output_url("rtmp://example.com/live/key").is_ok());
        assert!(validate_output_url("rtmp://").is_err());
        assert!(validate_output_url("file:///tmp/out.flv").is_ok());
        assert!(validate_output_url("srt://example.com:9000?latency=200").is_ok());
        assert!(validate_output_url("not a url").is_err());
        assert!(validate_output_url("udp://example.com:9000").is_err());
    }
}
