//! Boot-time tunnel reconciliation
//!
//! Walks the persisted inventory against live kernel/WireGuard state and
//! recreates whatever the system lost. Runs to completion once; tunnels are
//! handled sequentially so the security script can be applied exactly once
//! at the end.

use crate::client::ApiClient;
use sixtun_common::{
    commands, BrokerConfig, NetworkController, Result, TunnelRecord, TunnelStatus, TunnelType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation run
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub inventory: usize,
    pub recreated: usize,
    pub failed: usize,
}

pub struct Reconciler {
    config: BrokerConfig,
    netctl: Arc<dyn NetworkController>,
}

impl Reconciler {
    pub fn new(config: BrokerConfig, netctl: Arc<dyn NetworkController>) -> Self {
        Self { config, netctl }
    }

    /// Full run: warm-up delay, bounded inventory fetch, reconcile
    pub async fn run(&self, client: &ApiClient) -> Result<ReconcileSummary> {
        info!("Waiting {}s for the provisioning API", self.config.recovery.warmup_secs);
        tokio::time::sleep(Duration::from_secs(self.config.recovery.warmup_secs)).await;

        let tunnels = self.fetch_inventory(client).await?;
        info!("Found {} tunnels in inventory", tunnels.len());
        self.reconcile(&tunnels).await
    }

    /// Inventory fetch with a fixed attempt budget and inter-attempt delay
    async fn fetch_inventory(&self, client: &ApiClient) -> Result<Vec<TunnelRecord>> {
        let attempts = self.config.recovery.fetch_attempts.max(1);
        let mut last_err = sixtun_common::Error::Network("no fetch attempts made".to_string());
        for attempt in 1..=attempts {
            match client.get_tunnels().await {
                Ok(tunnels) => return Ok(tunnels),
                Err(e) => {
                    warn!(
                        "Attempt {}/{}: failed to fetch tunnels: {}",
                        attempt, attempts, e
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(
                            self.config.recovery.fetch_retry_secs,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Recreate every active tunnel the live system is missing.
    ///
    /// Individual failures are logged and counted, never fatal. The security
    /// script runs once at the end iff anything was recreated.
    pub async fn reconcile(&self, tunnels: &[TunnelRecord]) -> Result<ReconcileSummary> {
        let interfaces = self.netctl.list_tunnel_interfaces().await?;
        info!("Found {} SIT/GRE tunnels in system", interfaces.len());

        let peers = self
            .netctl
            .list_wireguard_peers(&self.config.wireguard.interface)
            .await?;
        info!("Found {} WireGuard peers in system", peers.len());

        let mut summary = ReconcileSummary {
            inventory: tunnels.len(),
            ..Default::default()
        };

        for tunnel in tunnels {
            if tunnel.status != TunnelStatus::Active {
                debug!("Skipping inactive tunnel {}", tunnel.id);
                continue;
            }

            let present = match tunnel.tunnel_type {
                TunnelType::Wireguard => tunnel
                    .client_public_key
                    .as_ref()
                    .map(|key| peers.contains(key))
                    .unwrap_or(false),
                TunnelType::Sit | TunnelType::Gre => interfaces.contains(&tunnel.id),
            };
            if present {
                continue;
            }

            info!(
                "Recreating missing tunnel {} (type: {})",
                tunnel.id, tunnel.tunnel_type
            );
            let command_set = commands::create_commands(tunnel, &self.config.wireguard);
            match self.netctl.apply(&command_set.server).await {
                Ok(()) => summary.recreated += 1,
                Err(e) => {
                    warn!("Failed to recreate tunnel {}: {}", tunnel.id, e);
                    summary.failed += 1;
                }
            }
        }

        if summary.recreated > 0 {
            info!("Applying security rules");
            if let Err(e) = self
                .netctl
                .run_script(&self.config.scripts.security)
                .await
            {
                warn!("Failed to apply security rules: {}", e);
            }
        }

        info!(
            "Recovery completed: {} recreated, {} failed",
            summary.recreated, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sixtun_common::RecordingController;

    fn record(id: &str, tunnel_type: TunnelType, status: TunnelStatus) -> TunnelRecord {
        TunnelRecord {
            id: id.to_string(),
            user_id: "abcd".to_string(),
            tunnel_type,
            status,
            server_ipv4: "192.67.35.38".to_string(),
            client_ipv4: "141.11.62.211".to_string(),
            endpoint_local: "fd6b:7660:0:beef::1/64".to_string(),
            endpoint_remote: "fd6b:7660:0:beef::2/64".to_string(),
            delegated_prefix_1: "2a06:9881:100e:abcd::/64".to_string(),
            delegated_prefix_2: "2a06:9881:2003:abcd::/64".to_string(),
            delegated_prefix_3: Some("2a06:9881:5000:abcd::/64".to_string()),
            created_at: 0,
            modified_at: 0,
            server_public_key: matches!(tunnel_type, TunnelType::Wireguard)
                .then(|| "SERVERPUB=".to_string()),
            client_private_key: matches!(tunnel_type, TunnelType::Wireguard)
                .then(|| "CLIENTPRIV=".to_string()),
            client_public_key: matches!(tunnel_type, TunnelType::Wireguard)
                .then(|| "CLIENTPUB=".to_string()),
            listen_port: matches!(tunnel_type, TunnelType::Wireguard).then_some(51820),
        }
    }

    fn reconciler() -> (Reconciler, Arc<RecordingController>) {
        let netctl = Arc::new(RecordingController::new());
        let reconciler = Reconciler::new(BrokerConfig::default(), netctl.clone());
        (reconciler, netctl)
    }

    fn security_script() -> String {
        BrokerConfig::default().scripts.security.display().to_string()
    }

    #[tokio::test]
    async fn test_missing_wireguard_peer_is_recreated() {
        let (reconciler, netctl) = reconciler();
        netctl.set_wireguard_peers(vec!["OTHERPEER=".to_string()]);

        let tunnels = vec![record("tun-abcd-1", TunnelType::Wireguard, TunnelStatus::Active)];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.recreated, 1);
        assert_eq!(summary.failed, 0);

        let executed = netctl.executed();
        assert!(executed
            .iter()
            .any(|c| c.starts_with("wg set wg0 peer CLIENTPUB= allowed-ips")));
        // All three delegated-prefix routes come back.
        assert_eq!(
            executed.iter().filter(|c| c.contains("route add")).count(),
            3
        );
        // Security script applied exactly once.
        let script = security_script();
        assert_eq!(executed.iter().filter(|c| **c == script).count(), 1);
    }

    #[tokio::test]
    async fn test_present_tunnels_are_left_alone() {
        let (reconciler, netctl) = reconciler();
        netctl.set_tunnel_interfaces(vec!["tun-abcd-1".to_string()]);
        netctl.set_wireguard_peers(vec!["CLIENTPUB=".to_string()]);

        let tunnels = vec![
            record("tun-abcd-1", TunnelType::Sit, TunnelStatus::Active),
            record("tun-abcd-2", TunnelType::Wireguard, TunnelStatus::Active),
        ];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.recreated, 0);
        // No configuration commands, no security script.
        assert!(netctl.executed().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_tunnels_are_skipped() {
        let (reconciler, netctl) = reconciler();
        let tunnels = vec![record("tun-abcd-1", TunnelType::Sit, TunnelStatus::Suspended)];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.recreated, 0);
        assert!(netctl.executed().is_empty());
    }

    #[tokio::test]
    async fn test_missing_sit_interface_is_recreated() {
        let (reconciler, netctl) = reconciler();
        netctl.set_tunnel_interfaces(vec!["tun-ffff-1".to_string()]);

        let tunnels = vec![record("tun-abcd-1", TunnelType::Sit, TunnelStatus::Active)];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.recreated, 1);
        assert!(netctl
            .executed()
            .iter()
            .any(|c| c.starts_with("ip tunnel add tun-abcd-1 mode sit")));
    }

    #[tokio::test]
    async fn test_item_failure_does_not_abort_the_batch() {
        let (reconciler, netctl) = reconciler();
        netctl.fail_on("tun-abcd-1", "RTNETLINK answers: Operation not permitted");

        let tunnels = vec![
            record("tun-abcd-1", TunnelType::Sit, TunnelStatus::Active),
            record("tun-beef-1", TunnelType::Gre, TunnelStatus::Active),
        ];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recreated, 1);
        // The survivor still triggers the security script, once.
        let script = security_script();
        assert_eq!(
            netctl.executed().iter().filter(|c| **c == script).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_routes_do_not_fail_recreation() {
        let (reconciler, netctl) = reconciler();
        netctl.fail_on("route add", "RTNETLINK answers: File exists");

        let tunnels = vec![record("tun-abcd-1", TunnelType::Sit, TunnelStatus::Active)];
        let summary = reconciler.reconcile(&tunnels).await.unwrap();
        assert_eq!(summary.recreated, 1);
        assert_eq!(summary.failed, 0);
    }
}
