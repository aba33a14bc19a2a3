//! Tunnel provisioning service
//!
//! Orchestrates allocation, key generation, persistence, and command
//! execution for the tunnel lifecycle. Allocation and validation failures
//! abort before anything is persisted or executed; later failures use
//! explicit compensation since OS commands are not transactional.

use crate::tunnels::allocator::PrefixAllocator;
use crate::tunnels::store::TunnelStore;
use sixtun_common::{
    addr, commands, crypto, BrokerConfig, CommandSet, Database, Error, NetworkController, Result,
    TunnelRecord, TunnelStatus, TunnelType, TunnelWithCommands,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-user active tunnel limit; also the number of pool pairs
const TUNNEL_LIMIT: i64 = 2;

pub struct TunnelService {
    store: TunnelStore,
    allocator: PrefixAllocator,
    config: BrokerConfig,
    netctl: Arc<dyn NetworkController>,
}

impl TunnelService {
    pub fn new(db: Database, config: BrokerConfig, netctl: Arc<dyn NetworkController>) -> Self {
        Self {
            store: TunnelStore::new(db),
            allocator: PrefixAllocator::new(config.prefixes.clone()),
            config,
            netctl,
        }
    }

    /// Create a tunnel: allocate addresses, persist the record with the
    /// user's counters in one transaction, bring the server side up, and
    /// return the record with the full command set.
    pub async fn create(
        &self,
        tunnel_type: TunnelType,
        user_id: &str,
        client_ipv4: &str,
        server_ipv4: &str,
    ) -> Result<(TunnelRecord, CommandSet)> {
        let active = self.store.count_active_by_user(user_id)?;
        if active >= TUNNEL_LIMIT {
            return Err(Error::TunnelLimitReached {
                limit: TUNNEL_LIMIT as u32,
            });
        }
        let pair_number: u8 = if active == 0 { 1 } else { 2 };
        let id = format!("tun-{}-{}", user_id, pair_number);

        let allocation = self
            .allocator
            .allocate_for_tunnel(&self.store, user_id, pair_number)?;

        let now = chrono::Utc::now().timestamp();
        let mut tunnel = TunnelRecord {
            id,
            user_id: user_id.to_string(),
            tunnel_type,
            status: TunnelStatus::Active,
            server_ipv4: server_ipv4.to_string(),
            client_ipv4: client_ipv4.to_string(),
            endpoint_local: allocation.endpoint_local.clone(),
            endpoint_remote: allocation.endpoint_remote.clone(),
            delegated_prefix_1: allocation.prefix1.clone(),
            delegated_prefix_2: allocation.prefix2.clone(),
            delegated_prefix_3: Some(allocation.prefix3.clone()),
            created_at: now,
            modified_at: now,
            server_public_key: None,
            client_private_key: None,
            client_public_key: None,
            listen_port: None,
        };

        if tunnel_type == TunnelType::Wireguard {
            let keys = crypto::generate_keypair();
            tunnel.server_public_key = Some(self.config.wireguard.public_key.clone());
            tunnel.client_private_key = Some(keys.private_key);
            tunnel.client_public_key = Some(keys.public_key);
            tunnel.listen_port = Some(self.config.wireguard.listen_port);
        }

        // Final sanity check on every derived address, then persist. Either
        // failing releases the cache reservations; nothing was committed.
        let validate_and_insert = || {
            addr::validate_ipv6(&tunnel.endpoint_local)?;
            addr::validate_ipv6(&tunnel.endpoint_remote)?;
            addr::validate_ipv6(&tunnel.delegated_prefix_1)?;
            addr::validate_ipv6(&tunnel.delegated_prefix_2)?;
            addr::validate_ipv6(&allocation.prefix3)?;
            self.store.insert_tunnel(&tunnel)
        };
        if let Err(e) = validate_and_insert() {
            self.allocator.release(allocation.prefixes());
            return Err(e);
        }

        // The record is committed at this point. A command failure surfaces
        // as a server error and leaves the row for recovery to repair.
        let command_set = commands::create_commands(&tunnel, &self.config.wireguard);
        self.netctl.apply(&command_set.server).await?;

        info!("Created {} tunnel {} for user {}", tunnel_type, tunnel.id, user_id);
        Ok((tunnel, command_set))
    }

    /// Delete a tunnel. A missing interface or peer is not a failure; the
    /// row removal and counter decrement always proceed.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let tunnel = self.get_record(id)?;

        let command_set = commands::delete_commands(&tunnel, &self.config.wireguard);
        self.apply_lenient(&command_set.server).await;

        self.store.delete_tunnel(id)?;
        self.store.decrement_active_tunnels(&tunnel.user_id)?;
        self.allocator.release(
            tunnel
                .delegated_prefixes()
                .iter()
                .copied()
                .collect::<Vec<_>>(),
        );

        self.apply_security_script().await;
        info!("Deleted tunnel {}", id);
        Ok(())
    }

    /// Suspend: drop the delegated-prefix routes, keep the interface (or
    /// peer) allocated.
    pub async fn suspend(&self, id: &str) -> Result<TunnelWithCommands> {
        let tunnel = self.get_record(id)?;
        let command_set = commands::suspend_commands(&tunnel, &self.config.wireguard);
        self.apply_lenient(&command_set.server).await;
        self.store.update_status(id, TunnelStatus::Suspended)?;
        let tunnel = self.get_record(id)?;
        Ok(TunnelWithCommands { tunnel, commands: command_set })
    }

    /// Activate: restore the delegated-prefix routes
    pub async fn activate(&self, id: &str) -> Result<TunnelWithCommands> {
        let tunnel = self.get_record(id)?;
        let command_set = commands::resume_commands(&tunnel, &self.config.wireguard);
        self.netctl.apply(&command_set.server).await?;
        self.store.update_status(id, TunnelStatus::Active)?;
        let tunnel = self.get_record(id)?;
        Ok(TunnelWithCommands { tunnel, commands: command_set })
    }

    /// Persist a new client IPv4 and re-point the server side at it
    pub async fn update_client_ip(
        &self,
        id: &str,
        client_ipv4: &str,
    ) -> Result<TunnelWithCommands> {
        self.get_record(id)?;
        self.store.update_client_ipv4(id, client_ipv4)?;
        let tunnel = self.get_record(id)?;

        let command_set = commands::update_client_ip_commands(&tunnel, &self.config.wireguard);
        self.netctl.apply(&command_set.server).await?;
        Ok(TunnelWithCommands { tunnel, commands: command_set })
    }

    pub fn get(&self, id: &str) -> Result<TunnelWithCommands> {
        let tunnel = self.get_record(id)?;
        let commands = commands::create_commands(&tunnel, &self.config.wireguard);
        Ok(TunnelWithCommands { tunnel, commands })
    }

    /// All tunnels, or one user's, each with its regenerated command set
    pub fn list(&self, user_id: Option<&str>) -> Result<Vec<TunnelWithCommands>> {
        let tunnels = self.store.list_tunnels(user_id)?;
        Ok(tunnels
            .into_iter()
            .map(|tunnel| {
                let commands = commands::create_commands(&tunnel, &self.config.wireguard);
                TunnelWithCommands { tunnel, commands }
            })
            .collect())
    }

    /// Make sure the shared WireGuard interface exists, carries the server
    /// key and listen port, and is up. Runs once at startup.
    pub async fn ensure_wireguard_interface(&self) -> Result<()> {
        let wg = &self.config.wireguard;
        if wg.interface.is_empty() {
            return Ok(());
        }

        let probe = self.netctl.run(&format!("ip link show {}", wg.interface)).await?;
        if !probe.success() {
            self.netctl
                .apply(&[format!("ip link add dev {} type wireguard", wg.interface)])
                .await?;
        }
        self.netctl
            .apply(&[
                format!(
                    "wg set {} listen-port {} private-key {}",
                    wg.interface,
                    wg.listen_port,
                    wg.private_key_file.display()
                ),
                format!("ip link set {} up", wg.interface),
            ])
            .await?;
        Ok(())
    }

    fn get_record(&self, id: &str) -> Result<TunnelRecord> {
        self.store.get_tunnel(id)?.ok_or_else(|| Error::NotFound {
            kind: "tunnel".to_string(),
            id: id.to_string(),
        })
    }

    /// Run commands where "already gone" is acceptable: log, keep going
    async fn apply_lenient(&self, commands: &[String]) {
        for command in commands {
            if command.starts_with('#') {
                continue;
            }
            match self.netctl.run(command).await {
                Ok(output) if !output.success() => {
                    warn!("Command failed (continuing): {} ({})", command, output.stderr.trim());
                }
                Err(e) => warn!("Command failed (continuing): {} ({})", command, e),
                Ok(_) => {}
            }
        }
    }

    async fn apply_security_script(&self) {
        if let Err(e) = self.netctl.run_script(&self.config.scripts.security).await {
            warn!("Security script failed: {}", e);
        }
    }
}
