use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::{fs, path::PathBuf as StdPathBuf};

/// All configuration parameters, loaded once at boot and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: String,
    #[serde(default)]
    pub custom_id: String,
    pub server: String,
    #[serde(default = "default_report_interval_min")]
    pub report_interval_min: u32,

    #[serde(default)]
    pub rtt_enabled: bool,
    #[serde(default)]
    pub throughput_enabled: bool,
    #[serde(default = "default_throughput_kb")]
    pub throughput_kb: u32,
    #[serde(default)]
    pub disk_usage_enabled: bool,
    #[serde(default = "default_disk_usage_mount_point")]
    pub disk_usage_mount_point: String,
    #[serde(default)]
    pub usb_scan_enabled: bool,
    #[serde(default)]
    pub bt_scan_enabled: bool,
    #[serde(default)]
    pub payload_command: String,

    #[serde(default = "default_true")]
    pub ssh_enabled: bool,
    #[serde(default = "default_ssh_local_host")]
    pub ssh_local_host: String,
    #[serde(default = "default_ssh_local_port")]
    pub ssh_local_port: u16,
    #[serde(default = "default_ssh_retry_gap_sec")]
    pub ssh_retry_gap_sec: u64,
    /// When set, the tunnel manager verifies the rendezvous server's host
    /// key against this file instead of accepting any key (see §9).
    #[serde(default)]
    pub ssh_known_hosts_path: Option<PathBuf>,

    #[serde(default)]
    pub update_enabled: bool,
    #[serde(default)]
    pub update_check_url: String,
    #[serde(default)]
    pub update_command: String,

    /// Command executed when the server requests a reboot. Defaults to
    /// `sudo reboot` on Unix; empty (no-op, logged) elsewhere.
    #[serde(default = "default_reboot_command")]
    pub reboot_command: String,
}

fn default_report_interval_min() -> u32 {
    3
}
fn default_throughput_kb() -> u32 {
    500
}
fn default_disk_usage_mount_point() -> String {
    "/".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ssh_local_host() -> String {
    "localhost".to_string()
}
fn default_ssh_local_port() -> u16 {
    22
}
fn default_ssh_retry_gap_sec() -> u64 {
    10
}
fn default_reboot_command() -> String {
    if cfg!(windows) {
        String::new()
    } else {
        "sudo reboot".to_string()
    }
}

pub const DEFAULT_CONFIG_PATH: &str = "kaginawa.json";

impl Config {
    /// Loads configuration from `path`, or [`DEFAULT_CONFIG_PATH`] if empty.
    ///
    /// Fails if the file is missing, malformed, or missing `api_key`/`server`.
    pub fn load(path: &str) -> Result<Self> {
        let path: StdPathBuf = if path.is_empty() {
            StdPathBuf::from(DEFAULT_CONFIG_PATH)
        } else {
            StdPathBuf::from(path)
        };

        if !path.exists() {
            return Err(anyhow!("configuration file not found: {}", path.display()));
        }

        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(anyhow!("no api key configured"));
        }
        if self.server.is_empty() {
            return Err(anyhow!("no server configured"));
        }
        Ok(())
    }

    /// SSH local host and port with a colon separator, as dialed by the
    /// tunnel manager's accept loop.
    pub fn ssh_local(&self) -> String {
        format!("{}:{}", self.ssh_local_host, self.ssh_local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_applies_defaults() {
        let file = write_config(r#"{"api_key":"K","server":"s.example"}"#);
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.report_interval_min, 3);
        assert_eq!(config.throughput_kb, 500);
        assert_eq!(config.disk_usage_mount_point, "/");
        assert!(config.ssh_enabled);
        assert_eq!(config.ssh_local_host, "localhost");
        assert_eq!(config.ssh_local_port, 22);
        assert_eq!(config.ssh_retry_gap_sec, 10);
    }

    #[test]
    fn load_rejects_missing_api_key() {
        let file = write_config(r#"{"api_key":"","server":"s.example"}"#);
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn load_rejects_missing_server() {
        let file = write_config(r#"{"api_key":"K","server":""}"#);
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(Config::load("/nonexistent/path.json").is_err());
    }

    #[test]
    fn ssh_local_formats_host_port() {
        let file = write_config(r#"{"api_key":"K","server":"s.example","ssh_local_port":2222}"#);
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ssh_local(), "localhost:2222");
    }
}
