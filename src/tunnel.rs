//! Reverse SSH tunnel manager (§4.E). Ported from
//! `original_source/ssh.go`'s `listenSSH`/`openTunnel`/`handleClient`, built
//! on the teacher's `ssh2` dependency the way its `tunnel_ssh2.rs` does,
//! but running the blocking `ssh2` calls on a dedicated thread instead of
//! inline inside an async task (§5: "parallel tasks (or threads)").

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use ssh2::{KnownHostFileKind, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::metrics::{MetricsCollector, TunnelStatus};
use crate::security::SecureKeyManager;
use crate::state::{AgentState, TunnelState};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TunnelManager {
    config: Config,
    state: AgentState,
    metrics: Arc<MetricsCollector>,
}

impl TunnelManager {
    pub fn new(config: Config, state: AgentState, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            state,
            metrics,
        }
    }

    /// Spawns the manager on a dedicated OS thread and returns immediately.
    /// `on_connected` fires once per successful listen, from that thread —
    /// the caller hops back onto the async runtime to emit the trigger=-1
    /// report (§4.E step 5, §5).
    pub fn spawn(self, on_connected: impl Fn() + Send + 'static) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(on_connected))
    }

    /// Runs forever. Never returns.
    fn run(&self, on_connected: impl Fn() + Send + 'static) {
        loop {
            if let Err(e) = self.open_tunnel(&on_connected) {
                self.state.clear_tunnel();
                self.metrics.update_tunnel_status(TunnelStatus::Error);
                log::error!("ssh connection failed: {}, restarting...", e);
                thread::sleep(Duration::from_secs(self.config.ssh_retry_gap_sec));
            }
        }
    }

    fn open_tunnel(&self, on_connected: &(impl Fn() + Send + 'static)) -> Result<()> {
        let reply = self
            .state
            .reply()
            .ok_or_else(|| anyhow!("ssh information is empty"))?;
        if reply.ssh_server_host.is_empty() {
            return Err(anyhow!("ssh information is empty"));
        }

        let (host, user) =
            SecureKeyManager::sanitize_ssh_args(&reply.ssh_server_host, &reply.ssh_server_user)
                .context("ssh configuration validation failed")?;

        self.metrics.update_tunnel_status(TunnelStatus::Connecting);

        let addr = format!("{}:{}", host, reply.ssh_server_port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}:{}", host, reply.ssh_server_port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", host, reply.ssh_server_port))?;
        let tcp = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)
            .with_context(|| format!("failed to connect remote ssh server {}", addr))?;

        let mut session = Session::new().context("failed to create ssh session")?;
        session.set_tcp_stream(tcp);
        session.handshake().context("ssh handshake failed")?;

        self.verify_host_key(&session, &host)?;

        let mut authenticated = false;
        if !reply.ssh_key.is_empty() {
            SecureKeyManager::validate_key_pem(&reply.ssh_key)?;
            session
                .userauth_pubkey_memory(&user, None, &reply.ssh_key, None)
                .context("ssh public key authentication failed")?;
            authenticated = session.authenticated();
        }
        if !authenticated && !reply.ssh_password.is_empty() {
            session
                .userauth_password(&user, &reply.ssh_password)
                .context("ssh password authentication failed")?;
            authenticated = session.authenticated();
        }
        if !authenticated {
            return Err(anyhow!("ssh authentication failed"));
        }

        let (mut listener, remote_port) = session
            .channel_forward_listen(0, Some("localhost"), None)
            .context("failed to open remote socket")?;

        self.state.set_tunnel(TunnelState {
            remote_port,
            connect_time: Some(Utc::now()),
        });
        self.metrics.update_tunnel_status(TunnelStatus::Connected);
        log::info!("ssh listener open: localhost:{}", remote_port);
        on_connected();

        loop {
            let channel = listener
                .accept()
                .context("failed to accept remote connection")?;
            let local = TcpStream::connect(self.config.ssh_local())
                .context("failed to connect local socket")?;
            handle_client(channel, local);
        }
    }

    /// When `ssh_known_hosts_path` is configured, verifies the server's
    /// host key against it. Otherwise logs the (default) weakness and
    /// accepts any key, matching the original's `InsecureIgnoreHostKey`
    /// (§9 design note).
    fn verify_host_key(&self, session: &Session, host: &str) -> Result<()> {
        let Some(path) = &self.config.ssh_known_hosts_path else {
            log::warn!(
                "ssh_known_hosts_path not set; accepting {}'s host key unconditionally",
                host
            );
            return Ok(());
        };

        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| anyhow!("server did not present a host key"))?;

        let mut known_hosts = session
            .known_hosts()
            .context("failed to load known_hosts support")?;
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .with_context(|| format!("failed to read known_hosts file {}", path.display()))?;

        use ssh2::CheckResult;
        match known_hosts.check(host, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(anyhow!("{} is not in {}", host, path.display())),
            CheckResult::Mismatch => Err(anyhow!("host key mismatch for {}", host)),
            CheckResult::Failure => Err(anyhow!("host key check failed for {}", host)),
        }
    }
}

/// Forwards data in both directions between `channel` and `local` until
/// either direction closes, then tears the pair down. The two copy
/// threads rendezvous on a single completion signal; whichever finishes
/// first triggers cleanup of both endpoints (§4.E, §9).
fn handle_client(channel: ssh2::Channel, local: TcpStream) {
    let channel = Arc::new(Mutex::new(channel));
    let shutdown_handle = match local.try_clone() {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("failed to clone local socket: {}", e);
            return;
        }
    };
    let local_write = match local.try_clone() {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("failed to clone local socket: {}", e);
            return;
        }
    };
    let local_read = local;

    let (done_tx, done_rx) = mpsc::channel::<()>();

    let remote_to_local = {
        let channel = Arc::clone(&channel);
        let done_tx = done_tx.clone();
        let mut local_write = local_write;
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let n = {
                    let mut channel = channel.lock().unwrap();
                    channel.read(&mut buf)
                };
                match n {
                    Ok(0) => break,
                    Ok(n) => {
                        if local_write.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("error while copying remote->local: {}", e);
                        break;
                    }
                }
            }
            let _ = done_tx.send(());
        })
    };

    let local_to_remote = {
        let channel = Arc::clone(&channel);
        let mut local_read = local_read;
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match local_read.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut channel = channel.lock().unwrap();
                        if channel.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("error while copying local->remote: {}", e);
                        break;
                    }
                }
            }
            let _ = done_tx.send(());
        })
    };

    let _ = done_rx.recv();
    let _ = shutdown_handle.shutdown(std::net::Shutdown::Both);
    if let Ok(mut channel) = channel.lock() {
        let _ = channel.close();
    }

    let _ = remote_to_local.join();
    let _ = local_to_remote.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Reply;

    fn base_config() -> Config {
        Config {
            api_key: "K".to_string(),
            custom_id: String::new(),
            server: "localhost:0".to_string(),
            report_interval_min: 1,
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
            ssh_retry_gap_sec: 1,
            ssh_known_hosts_path: None,
            update_enabled: false,
            update_check_url: String::new(),
            update_command: String::new(),
            reboot_command: String::new(),
        }
    }

    #[test]
    fn open_tunnel_fails_fast_without_a_reply() {
        let state = AgentState::new();
        let metrics = Arc::new(MetricsCollector::new());
        let manager = TunnelManager::new(base_config(), state, metrics);
        let err = manager.open_tunnel(&|| {}).unwrap_err();
        assert!(err.to_string().contains("ssh information is empty"));
    }

    #[test]
    fn open_tunnel_fails_fast_on_empty_ssh_host() {
        let state = AgentState::new();
        state.set_reply(Reply::default());
        let metrics = Arc::new(MetricsCollector::new());
        let manager = TunnelManager::new(base_config(), state, metrics);
        let err = manager.open_tunnel(&|| {}).unwrap_err();
        assert!(err.to_string().contains("ssh information is empty"));
    }

    #[test]
    fn sanitize_rejects_shell_metacharacters_before_dialing() {
        let state = AgentState::new();
        state.set_reply(Reply {
            ssh_server_host: "rp.example; rm -rf /".to_string(),
            ssh_server_port: 2222,
            ssh_server_user: "deploy".to_string(),
            ..Default::default()
        });
        let metrics = Arc::new(MetricsCollector::new());
        let manager = TunnelManager::new(base_config(), state, metrics);
        let err = manager.open_tunnel(&|| {}).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }
}
