//! Primary adapter selection (§4.A). Ported from `original_source/id.go`'s
//! `initID`: the first "up" adapter with a hardware address and at least
//! one assigned address wins, in interface-enumeration order.

use anyhow::{anyhow, Result};
use std::time::Duration;

/// Process-wide network identity, re-resolved before every report.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub mac: String,
    pub adapter_name: String,
    pub ipv4: String,
    pub ipv6: String,
}

const BOOT_RETRY_GAP: Duration = Duration::from_secs(15);

impl Identity {
    /// Resolves the identity, retrying forever on a 15s gap. Only used at
    /// boot, where the agent cannot proceed without an ID.
    pub async fn resolve_with_retry() -> Self {
        loop {
            match resolve() {
                Ok(identity) => return identity,
                Err(e) => {
                    log::error!("failed to resolve identity: {}, retrying...", e);
                    tokio::time::sleep(BOOT_RETRY_GAP).await;
                }
            }
        }
    }
}

/// Selects the first "up" adapter with a hardware address and at least one
/// assigned IP address. Fails if none qualify.
pub fn resolve() -> Result<Identity> {
    let adapters = pnet_datalink::interfaces();

    for adapter in &adapters {
        if !adapter.is_up() || adapter.mac.is_none() {
            continue; // ignore odd or down adapters
        }
        let mac = match adapter.mac {
            Some(mac) if mac.to_string() != "00:00:00:00:00:00" => mac,
            _ => continue,
        };
        if adapter.ips.is_empty() {
            continue; // ignore unassigned adapters
        }

        let mut ipv4 = String::new();
        let mut ipv6 = String::new();
        for net in &adapter.ips {
            let text = net.ip().to_string();
            if ipv6.is_empty() && text.contains(':') {
                ipv6 = text;
            } else if ipv4.is_empty() && text.contains('.') {
                ipv4 = text;
            }
        }

        return Ok(Identity {
            mac: mac.to_string().to_lowercase(),
            adapter_name: adapter.name.clone(),
            ipv4,
            ipv6,
        });
    }

    Err(anyhow!("no adapter available"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_lowercased_on_resolve() {
        // resolve() depends on the host's live interfaces; this only
        // exercises the lowering contract on a constructed value, since
        // CI sandboxes may have zero usable adapters.
        let identity = Identity {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            ..Default::default()
        };
        assert_eq!(identity.mac.to_lowercase(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn empty_identity_has_no_adapter() {
        let identity = Identity::default();
        assert!(identity.mac.is_empty());
        assert!(identity.ipv4.is_empty());
    }
}
