//! Agent-level Prometheus metrics. The teacher keyed every counter by
//! tunnel id since it juggled several tunnels; this agent runs exactly one,
//! so the same shape collapses to scalars, exported the way `main.rs`'s
//! metrics server already serves `export_prometheus()`.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl TunnelStatus {
    fn as_gauge(self) -> i64 {
        match self {
            TunnelStatus::Disconnected => 0,
            TunnelStatus::Connecting => 1,
            TunnelStatus::Connected => 2,
            TunnelStatus::Error => 3,
        }
    }
}

pub struct MetricsCollector {
    start_time: Instant,
    reports_total: AtomicU64,
    upload_failures_total: AtomicU64,
    tunnel_reconnects_total: AtomicU64,
    tunnel_status: AtomicI64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reports_total: AtomicU64::new(0),
            upload_failures_total: AtomicU64::new(0),
            tunnel_reconnects_total: AtomicU64::new(0),
            tunnel_status: AtomicI64::new(TunnelStatus::Disconnected.as_gauge()),
        }
    }

    pub fn record_report(&self) {
        self.reports_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_failure(&self) {
        self.upload_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Every transition into `Connecting` is a (re)connect attempt.
    pub fn update_tunnel_status(&self, status: TunnelStatus) {
        if status == TunnelStatus::Connecting {
            self.tunnel_reconnects_total.fetch_add(1, Ordering::Relaxed);
        }
        self.tunnel_status.store(status.as_gauge(), Ordering::Relaxed);
    }

    /// Renders all counters/gauges in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP kaginawa_uptime_seconds Total agent uptime in seconds\n");
        out.push_str("# TYPE kaginawa_uptime_seconds counter\n");
        out.push_str(&format!(
            "kaginawa_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        ));

        out.push_str("# HELP kaginawa_reports_total Reports successfully uploaded\n");
        out.push_str("# TYPE kaginawa_reports_total counter\n");
        out.push_str(&format!(
            "kaginawa_reports_total {}\n",
            self.reports_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP kaginawa_upload_failures_total Report uploads that failed on every protocol\n");
        out.push_str("# TYPE kaginawa_upload_failures_total counter\n");
        out.push_str(&format!(
            "kaginawa_upload_failures_total {}\n",
            self.upload_failures_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP kaginawa_tunnel_reconnects_total Tunnel (re)connect attempts\n");
        out.push_str("# TYPE kaginawa_tunnel_reconnects_total counter\n");
        out.push_str(&format!(
            "kaginawa_tunnel_reconnects_total {}\n",
            self.tunnel_reconnects_total.load(Ordering::Relaxed)
        ));

        out.push_str(
            "# HELP kaginawa_tunnel_status Tunnel status (0=disconnected,1=connecting,2=connected,3=error)\n",
        );
        out.push_str("# TYPE kaginawa_tunnel_status gauge\n");
        out.push_str(&format!(
            "kaginawa_tunnel_status {}\n",
            self.tunnel_status.load(Ordering::Relaxed)
        ));

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_total_increments() {
        let metrics = MetricsCollector::new();
        metrics.record_report();
        metrics.record_report();
        assert!(metrics.export_prometheus().contains("kaginawa_reports_total 2"));
    }

    #[test]
    fn tunnel_status_reflects_latest_update() {
        let metrics = MetricsCollector::new();
        metrics.update_tunnel_status(TunnelStatus::Connecting);
        metrics.update_tunnel_status(TunnelStatus::Connected);
        assert!(metrics.export_prometheus().contains("kaginawa_tunnel_status 2"));
    }

    #[test]
    fn connecting_counts_as_reconnect_attempt() {
        let metrics = MetricsCollector::new();
        metrics.update_tunnel_status(TunnelStatus::Connecting);
        metrics.update_tunnel_status(TunnelStatus::Error);
        metrics.update_tunnel_status(TunnelStatus::Connecting);
        assert!(metrics
            .export_prometheus()
            .contains("kaginawa_tunnel_reconnects_total 2"));
    }
}
