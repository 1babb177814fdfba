//! Report assembly (§4.C) and the wire types shared with the server
//! (§3, §6). Ported from `original_source/report.go`'s `report`/`reply`
//! structs and `genReport`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::identity::Identity;
use crate::probes::{self, PlatformInfo};
use crate::state::AgentState;

/// One upload's worth of data. Optional fields are omitted from the wire
/// format when empty/zero, matching the original's `omitempty` tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub id: String,
    pub trigger: i32,
    pub runtime: String,
    pub success: bool,
    pub seq: u32,
    pub device_time: i64,
    pub boot_time: i64,
    pub gen_ms: i64,
    pub agent_version: String,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub custom_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ssh_server_host: String,
    #[serde(skip_serializing_if = "is_zero_u16", default)]
    pub ssh_remote_port: u16,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub ssh_connect_time: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub adapter: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ip4_local: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ip6_local: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub hostname: String,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub rtt_ms: i64,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub upload_bps: i64,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub download_bps: i64,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub disk_total_bytes: i64,
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub disk_used_bytes: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub disk_label: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub disk_filesystem: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub disk_mount_point: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub disk_device: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub usb_devices: Vec<UsbDevice>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub bd_local_devices: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub kernel_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub payload: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub payload_cmd: String,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub name: String,
    pub vendor_id: String,
    pub product_id: String,
    pub location: String,
}

/// Server's reply to an uploaded report, carrying tunnel credentials and
/// directives (§3, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reply {
    #[serde(default)]
    pub reboot: bool,
    #[serde(default, rename = "ssh_host")]
    pub ssh_server_host: String,
    #[serde(default, rename = "ssh_port")]
    pub ssh_server_port: u16,
    #[serde(default, rename = "ssh_user")]
    pub ssh_server_user: String,
    #[serde(default)]
    pub ssh_key: String,
    #[serde(default)]
    pub ssh_password: String,
}

impl Reply {
    /// `host:port` form dialed by the tunnel manager.
    pub fn ssh_server(&self) -> String {
        format!("{}:{}", self.ssh_server_host, self.ssh_server_port)
    }
}

/// Probes run in this fixed order so report generation is reproducible in
/// tests; they are independent and could run concurrently (§4.C note).
pub async fn assemble(
    trigger: i32,
    config: &Config,
    identity: &Identity,
    state: &AgentState,
    platform: &dyn PlatformInfo,
    agent_version: &str,
    boot_time: DateTime<Utc>,
) -> Report {
    let seq = state.next_seq();
    let t0 = Utc::now();

    let tunnel = state.tunnel();
    let reply = state.reply();

    let mut report = Report {
        id: identity.mac.clone(),
        trigger,
        runtime: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        success: true,
        seq,
        device_time: 0,
        boot_time: boot_time.timestamp(),
        gen_ms: 0,
        agent_version: agent_version.to_string(),
        custom_id: config.custom_id.clone(),
        ssh_server_host: reply.as_ref().map(|r| r.ssh_server_host.clone()).unwrap_or_default(),
        ssh_remote_port: tunnel.remote_port,
        ssh_connect_time: tunnel.connect_time.map(|t| t.timestamp()).unwrap_or(0),
        adapter: identity.adapter_name.clone(),
        ip4_local: identity.ipv4.clone(),
        ip6_local: identity.ipv6.clone(),
        hostname: String::new(),
        rtt_ms: 0,
        upload_bps: 0,
        download_bps: 0,
        disk_total_bytes: 0,
        disk_used_bytes: 0,
        disk_label: String::new(),
        disk_filesystem: String::new(),
        disk_mount_point: String::new(),
        disk_device: String::new(),
        usb_devices: Vec::new(),
        bd_local_devices: Vec::new(),
        kernel_version: String::new(),
        errors: Vec::new(),
        payload: String::new(),
        payload_cmd: String::new(),
    };

    match platform.hostname() {
        Ok(hostname) => report.hostname = hostname,
        Err(e) => report
            .errors
            .push(format!("failed to collect hostname: {}", e)),
    }

    if config.disk_usage_enabled {
        match platform.disk_usage(&config.disk_usage_mount_point) {
            Ok(usage) => {
                report.disk_total_bytes = usage.total_bytes;
                report.disk_used_bytes = usage.used_bytes;
                report.disk_label = usage.label;
                report.disk_filesystem = usage.filesystem;
                report.disk_mount_point = usage.mount_point;
                report.disk_device = usage.device;
            }
            Err(e) => report
                .errors
                .push(format!("failed to obtain disk usage: {}", e)),
        }
    }

    if config.usb_scan_enabled {
        match platform.usb_devices() {
            Ok(devices) => report.usb_devices = devices,
            Err(e) => report.errors.push(format!("failed to scan usb: {}", e)),
        }
    }

    if config.bt_scan_enabled {
        match platform.bt_local_devices() {
            Ok(devices) => report.bd_local_devices = devices,
            Err(e) => report
                .errors
                .push(format!("failed to scan bluetooth: {}", e)),
        }
    }

    match platform.kernel_version() {
        Ok(version) => report.kernel_version = version,
        Err(e) => report
            .errors
            .push(format!("failed to collect kernel version: {}", e)),
    }

    if config.rtt_enabled {
        match probes::measure_round_trip_time_ms(&config.server).await {
            Ok(ms) => report.rtt_ms = ms,
            Err(e) => report.errors.push(format!("failed to measure rtt: {}", e)),
        }
    }

    if config.throughput_enabled {
        match probes::measure_throughput(&config.server, config.throughput_kb).await {
            Ok((down_bps, up_bps)) => {
                report.download_bps = down_bps;
                report.upload_bps = up_bps;
            }
            Err(e) => report
                .errors
                .push(format!("failed to measure throughput: {}", e)),
        }
    }

    if !config.payload_command.is_empty() {
        report.payload_cmd = config.payload_command.clone();
        match probes::run_payload_command(&config.payload_command).await {
            Ok(output) => report.payload = output,
            Err(e) => report
                .errors
                .push(format!("failed to execute payload command: {}", e)),
        }
    }

    report.success = report.errors.is_empty();
    report.device_time = Utc::now().timestamp();
    report.gen_ms = (Utc::now() - t0).num_milliseconds();

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::tests::FakePlatform;

    fn base_config() -> Config {
        Config {
            api_key: "K".to_string(),
            custom_id: "custom".to_string(),
            server: "localhost:0".to_string(),
            report_interval_min: 3,
            rtt_enabled: false,
            throughput_enabled: false,
            throughput_kb: 500,
            disk_usage_enabled: false,
            disk_usage_mount_point: "/".to_string(),
            usb_scan_enabled: false,
            bt_scan_enabled: false,
            payload_command: String::new(),
            ssh_enabled: true,
            ssh_local_host: "localhost".to_string(),
            ssh_local_port: 22,
            ssh_retry_gap_sec: 10,
            ssh_known_hosts_path: None,
            update_enabled: false,
            update_check_url: String::new(),
            update_command: String::new(),
            reboot_command: String::new(),
        }
    }

    #[tokio::test]
    async fn success_reflects_empty_errors() {
        let state = AgentState::new();
        let identity = Identity {
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            ..Default::default()
        };
        let platform = FakePlatform::ok();
        let report = assemble(
            0,
            &base_config(),
            &identity,
            &state,
            &platform,
            "v1.0.0",
            Utc::now(),
        )
        .await;
        assert!(report.success);
        assert!(report.errors.is_empty());
        assert_eq!(report.seq, 1);
        assert_eq!(report.custom_id, "custom");
    }

    #[tokio::test]
    async fn disk_failure_is_recorded_without_aborting() {
        let state = AgentState::new();
        let identity = Identity::default();
        let mut config = base_config();
        config.disk_usage_enabled = true;
        let platform = FakePlatform::disk_fails("no such mount");
        let report = assemble(1, &config, &identity, &state, &platform, "v1.0.0", Utc::now()).await;
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("no such mount"));
        // Other fields still populate normally.
        assert_eq!(report.hostname, "fake-host");
    }

    #[tokio::test]
    async fn seq_increments_across_calls() {
        let state = AgentState::new();
        let identity = Identity::default();
        let platform = FakePlatform::ok();
        let config = base_config();
        let r1 = assemble(0, &config, &identity, &state, &platform, "v1.0.0", Utc::now()).await;
        let r2 = assemble(3, &config, &identity, &state, &platform, "v1.0.0", Utc::now()).await;
        assert_eq!(r1.seq, 1);
        assert_eq!(r2.seq, 2);
        assert_eq!(r2.trigger, 3);
    }

    #[test]
    fn reply_formats_server_address() {
        let reply = Reply {
            ssh_server_host: "rp.example".to_string(),
            ssh_server_port: 2222,
            ..Default::default()
        };
        assert_eq!(reply.ssh_server(), "rp.example:2222");
    }

    #[test]
    fn optional_fields_omitted_when_empty() {
        let report = Report {
            id: "aa:bb:cc:dd:ee:ff".to_string(),
            trigger: 0,
            runtime: "linux amd64".to_string(),
            success: true,
            seq: 1,
            device_time: 0,
            boot_time: 0,
            gen_ms: 0,
            agent_version: "v1.0.0".to_string(),
            custom_id: String::new(),
            ssh_server_host: String::new(),
            ssh_remote_port: 0,
            ssh_connect_time: 0,
            adapter: String::new(),
            ip4_local: String::new(),
            ip6_local: String::new(),
            hostname: String::new(),
            rtt_ms: 0,
            upload_bps: 0,
            download_bps: 0,
            disk_total_bytes: 0,
            disk_used_bytes: 0,
            disk_label: String::new(),
            disk_filesystem: String::new(),
            disk_mount_point: String::new(),
            disk_device: String::new(),
            usb_devices: Vec::new(),
            bd_local_devices: Vec::new(),
            kernel_version: String::new(),
            errors: Vec::new(),
            payload: String::new(),
            payload_cmd: String::new(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("custom_id"));
        assert!(!json.contains("ssh_remote_port"));
        assert!(!json.contains("errors"));
    }
}
