//! The shared mutable core described in §9: a single `AgentState` record
//! behind locks, passed by reference to every component instead of the
//! process-wide globals the original Go agent used (`msg`, `sshRemotePort`,
//! `sshConnectTime`, `seq` package vars in `ssh.go`/`report.go`).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::report::Reply;

/// Point-in-time snapshot of the tunnel's published state (§3, §5).
#[derive(Debug, Clone, Default)]
pub struct TunnelState {
    pub remote_port: u16,
    pub connect_time: Option<DateTime<Utc>>,
}

impl TunnelState {
    pub fn is_up(&self) -> bool {
        self.remote_port != 0
    }
}

struct Inner {
    reply: Mutex<Option<Reply>>,
    tunnel: Mutex<TunnelState>,
    seq: AtomicU32,
    ssh_loop_started: AtomicBool,
}

/// Cheaply cloneable handle to the agent's shared mutable state. Every
/// field is independently synchronized; readers never observe a torn
/// `(remote_port, connect_time)` pair (§5 ordering guarantees).
#[derive(Clone)]
pub struct AgentState(Arc<Inner>);

impl AgentState {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            reply: Mutex::new(None),
            tunnel: Mutex::new(TunnelState::default()),
            seq: AtomicU32::new(0),
            ssh_loop_started: AtomicBool::new(false),
        }))
    }

    /// Strictly monotonic report sequence number, starting at 1 (§3, §8.2).
    pub fn next_seq(&self) -> u32 {
        self.0.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Installs the latest server reply, making it visible to any
    /// subsequent read by the tunnel manager (§5 ordering guarantees).
    pub fn set_reply(&self, reply: Reply) {
        *self.0.reply.lock() = Some(reply);
    }

    pub fn reply(&self) -> Option<Reply> {
        self.0.reply.lock().clone()
    }

    /// Single-flight latch: returns `true` exactly once across any number
    /// of calls, for the caller that should spawn the tunnel manager
    /// (§4.D, §5, §8.7, §9).
    pub fn try_start_ssh_loop(&self) -> bool {
        self.0
            .ssh_loop_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn tunnel(&self) -> TunnelState {
        self.0.tunnel.lock().clone()
    }

    pub fn set_tunnel(&self, state: TunnelState) {
        *self.0.tunnel.lock() = state;
    }

    pub fn clear_tunnel(&self) {
        *self.0.tunnel.lock() = TunnelState::default();
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_strictly_monotonic_from_one() {
        let state = AgentState::new();
        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
        assert_eq!(state.next_seq(), 3);
    }

    #[test]
    fn ssh_loop_starts_at_most_once() {
        let state = AgentState::new();
        assert!(state.try_start_ssh_loop());
        assert!(!state.try_start_ssh_loop());
        assert!(!state.try_start_ssh_loop());
    }

    #[test]
    fn tunnel_state_round_trips() {
        let state = AgentState::new();
        assert!(!state.tunnel().is_up());
        state.set_tunnel(TunnelState {
            remote_port: 4022,
            connect_time: Some(Utc::now()),
        });
        assert!(state.tunnel().is_up());
        state.clear_tunnel();
        assert!(!state.tunnel().is_up());
    }
}
