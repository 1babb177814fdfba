//! Bounded, failure-tolerant measurements run during report assembly
//! (§4.B). RTT/throughput/payload talk to the report server directly;
//! disk/USB/BT/kernel/hostname are gathered behind [`PlatformInfo`] so
//! tests can inject fakes (§9 design note), the way
//! `original_source/platform.go` shells out to `df`/`system_profiler`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::process::Command;
use tokio::time::Duration;

use crate::report::UsbDevice;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// `GET http://<server>/measure/10240`, drained; wall time from just
/// before the request to just after the body finishes draining. Always
/// plain HTTP — this is a latency floor, not a security path (§4.B).
pub async fn measure_round_trip_time_ms(server: &str) -> Result<i64> {
    let client = reqwest::Client::new();
    let url = format!("http://{}/measure/10240", server);
    let begin = Instant::now();
    let resp = tokio::time::timeout(PROBE_TIMEOUT, client.get(&url).send())
        .await
        .context("rtt probe timed out")??;
    let status = resp.status();
    let _ = resp.bytes().await.context("failed to drain rtt body")?;
    let elapsed = begin.elapsed().as_millis() as i64;
    if !status.is_success() {
        return Err(anyhow!("HTTP {}", status.as_u16()));
    }
    Ok(elapsed)
}

/// Download leg then upload leg against `/measure/<kb>`, each timed
/// independently. Throughput in kilobits/s = `kb*8 / elapsed_seconds`
/// (§4.B, §8.9).
pub async fn measure_throughput(server: &str, kb: u32) -> Result<(i64, i64)> {
    let client = reqwest::Client::new();
    let url = format!("http://{}/measure/{}", server, kb);

    let download_begin = Instant::now();
    let resp = tokio::time::timeout(PROBE_TIMEOUT, client.get(&url).send())
        .await
        .context("download probe timed out")??;
    let status = resp.status();
    let _ = resp.bytes().await.context("failed to drain download body")?;
    let download_secs = download_begin.elapsed().as_secs_f64();
    if !status.is_success() {
        return Err(anyhow!("HTTP {}", status.as_u16()));
    }

    let body = vec![0u8; kb as usize * 1024];
    let upload_begin = Instant::now();
    let resp = tokio::time::timeout(
        PROBE_TIMEOUT,
        client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send(),
    )
    .await
    .context("upload probe timed out")??;
    let status = resp.status();
    let _ = resp.bytes().await.context("failed to drain upload body")?;
    let upload_secs = upload_begin.elapsed().as_secs_f64();
    if !status.is_success() {
        return Err(anyhow!("HTTP {}", status.as_u16()));
    }

    let down_bps = (kb as f64 * 8.0 / download_secs) as i64;
    let up_bps = (kb as f64 * 8.0 / upload_secs) as i64;
    Ok((down_bps, up_bps))
}

/// Splits `command` on single spaces, runs the first token as the
/// executable and the rest as argv, captures stdout as UTF-8. Any partial
/// stdout is attached even on failure (§4.B).
pub async fn run_payload_command(command: &str) -> Result<String> {
    let mut parts = command.split(' ');
    let program = parts.next().ok_or_else(|| anyhow!("empty payload command"))?;
    let args: Vec<&str> = parts.collect();

    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("failed to run {}", command))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            command,
            output.status,
            stdout
        ));
    }
    Ok(stdout)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub label: String,
    pub filesystem: String,
    pub mount_point: String,
    pub device: String,
}

/// Platform-specific probes that shell out to OS tools. Abstracted as a
/// trait so tests can inject a fake instead of depending on `df`,
/// `system_profiler`, `lsusb`, `hcitool`, or `uname` being present (§9).
pub trait PlatformInfo: Send + Sync {
    fn disk_usage(&self, mount_point: &str) -> Result<DiskUsage>;
    fn usb_devices(&self) -> Result<Vec<UsbDevice>>;
    fn bt_local_devices(&self) -> Result<Vec<String>>;
    fn kernel_version(&self) -> Result<String>;
    fn hostname(&self) -> Result<String>;
}

/// Default implementation, ported from `original_source/platform.go`.
pub struct SystemPlatformInfo;

impl PlatformInfo for SystemPlatformInfo {
    fn disk_usage(&self, mount_point: &str) -> Result<DiskUsage> {
        if cfg!(target_os = "macos") {
            disk_usage_macos(mount_point)
        } else if cfg!(target_os = "linux") {
            disk_usage_linux(mount_point)
        } else {
            Err(anyhow!("unsupported platform: {}", std::env::consts::OS))
        }
    }

    fn usb_devices(&self) -> Result<Vec<UsbDevice>> {
        if !cfg!(target_os = "linux") {
            return Err(anyhow!("usb scan unsupported on {}", std::env::consts::OS));
        }
        let output = std::process::Command::new("lsusb")
            .output()
            .context("failed to run lsusb")?;
        if !output.status.success() {
            return Err(anyhow!("lsusb exited with {}", output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().filter_map(parse_lsusb_line).collect())
    }

    fn bt_local_devices(&self) -> Result<Vec<String>> {
        if !cfg!(target_os = "linux") {
            return Err(anyhow!("bluetooth scan unsupported on {}", std::env::consts::OS));
        }
        let output = std::process::Command::new("hcitool")
            .arg("dev")
            .output()
            .context("failed to run hcitool")?;
        if !output.status.success() {
            return Err(anyhow!("hcitool exited with {}", output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(1).map(|s| s.to_lowercase()))
            .collect())
    }

    fn kernel_version(&self) -> Result<String> {
        let output = std::process::Command::new("uname")
            .arg("-r")
            .output()
            .context("failed to run uname")?;
        if !output.status.success() {
            return Err(anyhow!("uname exited with {}", output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn hostname(&self) -> Result<String> {
        let output = std::process::Command::new("hostname")
            .output()
            .context("failed to run hostname")?;
        if !output.status.success() {
            return Err(anyhow!("hostname exited with {}", output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn disk_usage_linux(mount_point: &str) -> Result<DiskUsage> {
    let output = std::process::Command::new("df")
        .args(["-T", mount_point])
        .output()
        .context("failed to run df")?;
    if !output.status.success() {
        return Err(anyhow!("df exited with {}", output.status));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 2 {
        return Err(anyhow!("no record: {}", text));
    }
    let tokens: Vec<&str> = lines[1].split_whitespace().collect();
    if tokens.len() < 7 {
        return Err(anyhow!("invalid record: {}", lines[1]));
    }
    let used: i64 = tokens[3]
        .parse()
        .with_context(|| format!("invalid record: {}", lines[1]))?;
    let available: i64 = tokens[4]
        .parse()
        .with_context(|| format!("invalid record: {}", lines[1]))?;
    Ok(DiskUsage {
        total_bytes: (used + available) * 1024,
        used_bytes: used * 1024,
        label: String::new(),
        filesystem: tokens[1].to_string(),
        mount_point: tokens[6].to_string(),
        device: tokens[0].to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct DarwinSystemProfile {
    #[serde(rename = "SPStorageDataType")]
    storage_data_type: Vec<DarwinStorageDataType>,
}

#[derive(Debug, Deserialize)]
struct DarwinStorageDataType {
    #[serde(rename = "_name")]
    name: String,
    bsd_name: String,
    file_system: String,
    free_space_in_bytes: i64,
    mount_point: String,
    size_in_bytes: i64,
}

fn disk_usage_macos(mount_point: &str) -> Result<DiskUsage> {
    let output = std::process::Command::new("system_profiler")
        .args(["-json", "SPStorageDataType"])
        .output()
        .context("failed to run system_profiler")?;
    if !output.status.success() {
        return Err(anyhow!("system_profiler exited with {}", output.status));
    }
    let profile: DarwinSystemProfile = serde_json::from_slice(&output.stdout)
        .context("failed to parse system_profiler output")?;
    profile
        .storage_data_type
        .into_iter()
        .find(|record| record.mount_point == mount_point)
        .map(|record| DiskUsage {
            total_bytes: record.size_in_bytes,
            used_bytes: record.size_in_bytes - record.free_space_in_bytes,
            label: record.name,
            filesystem: record.file_system,
            mount_point: record.mount_point,
            device: format!("/dev/{}", record.bsd_name),
        })
        .ok_or_else(|| anyhow!("no storage profile for {}", mount_point))
}

/// Parses a `lsusb` line like
/// `Bus 001 Device 002: ID 8087:0aa7 Intel Corp. Bluetooth`.
fn parse_lsusb_line(line: &str) -> Option<UsbDevice> {
    let id_idx = line.find("ID ")?;
    let rest = &line[id_idx + 3..];
    let mut parts = rest.splitn(2, ' ');
    let ids = parts.next()?;
    let name = parts.next().unwrap_or("").trim().to_string();
    let mut id_parts = ids.splitn(2, ':');
    let vendor_id = id_parts.next()?.to_string();
    let product_id = id_parts.next()?.to_string();
    let location = line
        .split(':')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    Some(UsbDevice {
        name,
        vendor_id,
        product_id,
        location,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A [`PlatformInfo`] fake for testing report assembly without
    /// touching real OS tools.
    pub struct FakePlatform {
        disk: Result<DiskUsage, String>,
    }

    impl FakePlatform {
        pub fn ok() -> Self {
            Self {
                disk: Ok(DiskUsage::default()),
            }
        }

        pub fn disk_fails(message: &str) -> Self {
            Self {
                disk: Err(message.to_string()),
            }
        }
    }

    impl PlatformInfo for FakePlatform {
        fn disk_usage(&self, _mount_point: &str) -> Result<DiskUsage> {
            self.disk.clone().map_err(|e| anyhow!(e))
        }
        fn usb_devices(&self) -> Result<Vec<UsbDevice>> {
            Ok(Vec::new())
        }
        fn bt_local_devices(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn kernel_version(&self) -> Result<String> {
            Ok("fake-kernel".to_string())
        }
        fn hostname(&self) -> Result<String> {
            Ok("fake-host".to_string())
        }
    }

    #[test]
    fn parses_lsusb_line() {
        let line = "Bus 001 Device 002: ID 8087:0aa7 Intel Corp. Bluetooth";
        let device = parse_lsusb_line(line).unwrap();
        assert_eq!(device.vendor_id, "8087");
        assert_eq!(device.product_id, "0aa7");
        assert_eq!(device.name, "Intel Corp. Bluetooth");
        assert_eq!(device.location, "Bus 001 Device 002");
    }

    #[test]
    fn rejects_malformed_lsusb_line() {
        assert!(parse_lsusb_line("not a usb line").is_none());
    }
}
