//! Agent loop (§4.F). Ported from `original_source/main.go`'s `main`:
//! resolve identity, send a boot report, then tick forever at
//! `report_interval_min`. The tunnel manager is spawned lazily, the first
//! time a reply makes tunneling eligible (§4.D, §9's single-flight design);
//! its trigger=-1 report (§4.E step 5) runs as its own task so it genuinely
//! overlaps a slow in-flight interval upload instead of queuing behind it
//! (§5).

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::identity::{self, Identity};
use crate::metrics::MetricsCollector;
use crate::probes::SystemPlatformInfo;
use crate::report;
use crate::state::AgentState;
use crate::transport;
use crate::tunnel::TunnelManager;
use crate::update;

#[derive(Clone)]
pub struct Scheduler {
    config: Config,
    state: AgentState,
    metrics: Arc<MetricsCollector>,
    agent_version: &'static str,
    debug_print: bool,
    identity: Arc<Mutex<Identity>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        state: AgentState,
        metrics: Arc<MetricsCollector>,
        agent_version: &'static str,
        debug_print: bool,
    ) -> Self {
        Self {
            config,
            state,
            metrics,
            agent_version,
            debug_print,
            identity: Arc::new(Mutex::new(Identity::default())),
        }
    }

    /// Runs forever: resolves identity, optionally starts the update
    /// checker, sends a boot report, then ticks at `report_interval_min`.
    pub async fn run(self) {
        let boot_time = Utc::now();
        let resolved = Identity::resolve_with_retry().await;
        log::info!("kaginawa-agent {} on {}", self.agent_version, resolved.mac);
        *self.identity.lock() = resolved;

        if self.config.update_enabled {
            let update_config = self.config.clone();
            let version = self.agent_version;
            tokio::spawn(async move { update::run(update_config, version).await });
        }

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<i32>();

        self.emit_report(0, boot_time, &trigger_tx).await;

        let interval_secs = self.config.report_interval_min as u64 * 60;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await; // first tick fires immediately; the boot report already covered it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let trigger = self.config.report_interval_min as i32;
                    self.emit_report(trigger, boot_time, &trigger_tx).await;
                }
                Some(trigger) = trigger_rx.recv() => {
                    // Own task: a tunnel reconnect shouldn't wait behind a
                    // slow interval upload, nor block the next tick.
                    let scheduler = self.clone();
                    let trigger_tx = trigger_tx.clone();
                    tokio::spawn(async move {
                        scheduler.emit_report(trigger, boot_time, &trigger_tx).await;
                    });
                }
            }
        }
    }

    /// Re-resolves identity before every report (§3, §4.A); a failed
    /// re-resolution is logged and the previous values are kept instead of
    /// aborting the cycle.
    async fn emit_report(
        &self,
        trigger: i32,
        boot_time: chrono::DateTime<Utc>,
        trigger_tx: &mpsc::UnboundedSender<i32>,
    ) {
        let identity = match identity::resolve() {
            Ok(resolved) => {
                *self.identity.lock() = resolved.clone();
                resolved
            }
            Err(e) => {
                log::error!("failed to re-resolve identity: {}, keeping previous values", e);
                self.identity.lock().clone()
            }
        };

        let report = report::assemble(
            trigger,
            &self.config,
            &identity,
            &self.state,
            &SystemPlatformInfo,
            self.agent_version,
            boot_time,
        )
        .await;

        let tunnel_config = self.config.clone();
        let tunnel_state = self.state.clone();
        let tunnel_metrics = Arc::clone(&self.metrics);
        let tx = trigger_tx.clone();

        transport::upload_report(
            &self.config,
            &self.state,
            &self.metrics,
            &report,
            self.debug_print,
            move || {
                // Only reached when config.ssh_enabled and on the first
                // reply eligible for tunneling (state.try_start_ssh_loop()
                // gates the caller), so this spawns exactly one tunnel
                // manager for the process lifetime.
                let manager = TunnelManager::new(
                    tunnel_config.clone(),
                    tunnel_state.clone(),
                    Arc::clone(&tunnel_metrics),
                );
                let tx = tx.clone();
                manager.spawn(move || {
                    let _ = tx.send(-1);
                });
            },
        )
        .await;
    }
}
