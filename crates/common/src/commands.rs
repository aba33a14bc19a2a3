//! Tunnel command generation
//!
//! Pure mapping from a tunnel record plus the global WireGuard configuration
//! to the ordered server- and client-side OS command lists. Regenerable at
//! any time; nothing here touches the system or the database.

use crate::addr::strip_mask;
use crate::config::WireGuardConfig;
use crate::types::{CommandSet, TunnelRecord, TunnelType};

/// Commands that bring a tunnel up on both ends
pub fn create_commands(tunnel: &TunnelRecord, wg: &WireGuardConfig) -> CommandSet {
    match tunnel.tunnel_type {
        TunnelType::Sit | TunnelType::Gre => ip_tunnel_create(tunnel),
        TunnelType::Wireguard => wireguard_create(tunnel, wg),
    }
}

/// Commands that tear a tunnel down on both ends.
///
/// For SIT/GRE deleting the interface drops its addresses and routes with
/// it. Removing a WireGuard peer does not remove routes added on the shared
/// interface, so those are deleted explicitly.
pub fn delete_commands(tunnel: &TunnelRecord, wg: &WireGuardConfig) -> CommandSet {
    match tunnel.tunnel_type {
        TunnelType::Sit | TunnelType::Gre => CommandSet {
            server: vec![format!("ip tunnel del {}", tunnel.id)],
            client: vec![format!("ip tunnel del {}", tunnel.id)],
        },
        TunnelType::Wireguard => {
            let mut server = vec![format!(
                "wg set {} peer {} remove",
                wg.interface,
                tunnel.client_public_key.as_deref().unwrap_or_default()
            )];
            for prefix in tunnel.delegated_prefixes() {
                server.push(format!("ip -6 route del {} dev {}", prefix, wg.interface));
            }
            CommandSet {
                server,
                client: vec![format!("ip link del dev {}", tunnel.id)],
            }
        }
    }
}

/// Commands reflecting a client IPv4 change.
///
/// WireGuard peers re-discover the new endpoint on the next handshake, so
/// the server side is a no-op and the client list carries one informational
/// line.
pub fn update_client_ip_commands(tunnel: &TunnelRecord, _wg: &WireGuardConfig) -> CommandSet {
    match tunnel.tunnel_type {
        TunnelType::Sit | TunnelType::Gre => CommandSet {
            server: vec![format!(
                "ip tunnel change {} mode {} remote {} ttl 255",
                tunnel.id, tunnel.tunnel_type, tunnel.client_ipv4
            )],
            client: vec![format!(
                "ip tunnel change {} mode {} local {} remote {} ttl 255",
                tunnel.id, tunnel.tunnel_type, tunnel.client_ipv4, tunnel.server_ipv4
            )],
        },
        TunnelType::Wireguard => CommandSet {
            server: Vec::new(),
            client: vec![format!(
                "# endpoint change to {} is picked up by the server on the next handshake",
                tunnel.client_ipv4
            )],
        },
    }
}

/// Suspension removes only the delegated-prefix routes; the interface (or
/// peer entry) stays allocated.
pub fn suspend_commands(tunnel: &TunnelRecord, wg: &WireGuardConfig) -> CommandSet {
    CommandSet {
        server: route_commands(tunnel, wg, "del"),
        client: Vec::new(),
    }
}

/// Resumption restores the delegated-prefix routes removed by suspension
pub fn resume_commands(tunnel: &TunnelRecord, wg: &WireGuardConfig) -> CommandSet {
    CommandSet {
        server: route_commands(tunnel, wg, "add"),
        client: Vec::new(),
    }
}

fn route_commands(tunnel: &TunnelRecord, wg: &WireGuardConfig, op: &str) -> Vec<String> {
    // SIT/GRE routes ride the tunnel interface; WireGuard routes the shared
    // interface, with the peer entry left untouched.
    let dev = match tunnel.tunnel_type {
        TunnelType::Sit | TunnelType::Gre => tunnel.id.as_str(),
        TunnelType::Wireguard => wg.interface.as_str(),
    };
    tunnel
        .delegated_prefixes()
        .iter()
        .map(|prefix| format!("ip -6 route {} {} dev {}", op, prefix, dev))
        .collect()
}

fn ip_tunnel_create(tunnel: &TunnelRecord) -> CommandSet {
    let mode = tunnel.tunnel_type.to_string();

    let mut server = vec![
        format!(
            "ip tunnel add {} mode {} local {} remote {} ttl 255",
            tunnel.id, mode, tunnel.server_ipv4, tunnel.client_ipv4
        ),
        format!("ip link set {} up", tunnel.id),
        format!("ip -6 addr add {} dev {}", tunnel.endpoint_local, tunnel.id),
    ];
    for prefix in tunnel.delegated_prefixes() {
        server.push(format!("ip -6 route add {} dev {}", prefix, tunnel.id));
    }

    let mut client = vec![
        format!(
            "ip tunnel add {} mode {} local {} remote {} ttl 255",
            tunnel.id, mode, tunnel.client_ipv4, tunnel.server_ipv4
        ),
        format!("ip link set {} up", tunnel.id),
        format!("ip -6 addr add {} dev {}", tunnel.endpoint_remote, tunnel.id),
    ];
    for prefix in tunnel.delegated_prefixes() {
        client.push(format!(
            "ip -6 addr add {}1/64 dev {}",
            strip_mask(prefix),
            tunnel.id
        ));
    }
    client.push(format!(
        "ip -6 route add ::/0 via {} dev {}",
        strip_mask(&tunnel.endpoint_local),
        tunnel.id
    ));

    CommandSet { server, client }
}

fn wireguard_create(tunnel: &TunnelRecord, wg: &WireGuardConfig) -> CommandSet {
    let client_public = tunnel.client_public_key.as_deref().unwrap_or_default();
    let client_private = tunnel.client_private_key.as_deref().unwrap_or_default();
    let server_public = tunnel
        .server_public_key
        .as_deref()
        .unwrap_or(wg.public_key.as_str());
    let listen_port = tunnel.listen_port.unwrap_or(wg.listen_port);

    // allowed-ips covers the remote endpoint plus every delegated prefix
    let mut allowed = vec![tunnel.endpoint_remote.clone()];
    allowed.extend(tunnel.delegated_prefixes().iter().map(|p| p.to_string()));

    let mut server = vec![format!(
        "wg set {} peer {} allowed-ips {}",
        wg.interface,
        client_public,
        allowed.join(",")
    )];
    for prefix in tunnel.delegated_prefixes() {
        server.push(format!("ip -6 route add {} dev {}", prefix, wg.interface));
    }

    let key_file = format!("/etc/wireguard/{}_private.key", tunnel.id);
    let mut client = vec![
        format!("ip link add dev {} type wireguard", tunnel.id),
        format!("ip -6 addr add {} dev {}", tunnel.endpoint_remote, tunnel.id),
    ];
    for prefix in tunnel.delegated_prefixes() {
        client.push(format!(
            "ip -6 addr add {}1/64 dev {}",
            strip_mask(prefix),
            tunnel.id
        ));
    }
    client.push(format!(
        "echo '{}' > {} && chmod 600 {}",
        client_private, key_file, key_file
    ));
    client.push(format!(
        "wg set {} private-key {} peer {} endpoint {}:{} allowed-ips ::/0",
        tunnel.id, key_file, server_public, tunnel.server_ipv4, listen_port
    ));
    client.push(format!("ip link set {} up", tunnel.id));
    client.push(format!("ip -6 route add ::/0 dev {}", tunnel.id));

    CommandSet { server, client }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TunnelStatus;

    fn record(tunnel_type: TunnelType, third: bool) -> TunnelRecord {
        TunnelRecord {
            id: "tun-abcd-1".to_string(),
            user_id: "abcd".to_string(),
            tunnel_type,
            status: TunnelStatus::Active,
            server_ipv4: "192.67.35.38".to_string(),
            client_ipv4: "141.11.62.211".to_string(),
            endpoint_local: "fd6b:7660:0:beef::1/64".to_string(),
            endpoint_remote: "fd6b:7660:0:beef::2/64".to_string(),
            delegated_prefix_1: "2a06:9881:100e:abcd::/64".to_string(),
            delegated_prefix_2: "2a06:9881:2003:abcd::/64".to_string(),
            delegated_prefix_3: third.then(|| "2a06:9881:5000:abcd::/64".to_string()),
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

    fn wg_config() -> WireGuardConfig {
        WireGuardConfig::default()
    }

    #[test]
    fn test_generation_is_pure() {
        let tunnel = record(TunnelType::Wireguard, true);
        let wg = wg_config();
        assert_eq!(create_commands(&tunnel, &wg), create_commands(&tunnel, &wg));
        assert_eq!(delete_commands(&tunnel, &wg), delete_commands(&tunnel, &wg));
    }

    #[test]
    fn test_sit_create_shape() {
        let set = create_commands(&record(TunnelType::Sit, true), &wg_config());
        assert_eq!(
            set.server[0],
            "ip tunnel add tun-abcd-1 mode sit local 192.67.35.38 remote 141.11.62.211 ttl 255"
        );
        assert_eq!(set.server[1], "ip link set tun-abcd-1 up");
        assert_eq!(
            set.server[2],
            "ip -6 addr add fd6b:7660:0:beef::1/64 dev tun-abcd-1"
        );
        assert_eq!(set.server.len(), 6);
        assert_eq!(
            set.server[5],
            "ip -6 route add 2a06:9881:5000:abcd::/64 dev tun-abcd-1"
        );

        // Client mirrors local/remote, assigns prefixes as addresses, and
        // routes everything back through the server endpoint.
        assert_eq!(
            set.client[0],
            "ip tunnel add tun-abcd-1 mode sit local 141.11.62.211 remote 192.67.35.38 ttl 255"
        );
        assert_eq!(
            set.client[3],
            "ip -6 addr add 2a06:9881:100e:abcd::1/64 dev tun-abcd-1"
        );
        assert_eq!(
            set.client.last().unwrap(),
            "ip -6 route add ::/0 via fd6b:7660:0:beef::1 dev tun-abcd-1"
        );
    }

    #[test]
    fn test_gre_uses_gre_mode() {
        let set = create_commands(&record(TunnelType::Gre, false), &wg_config());
        assert!(set.server[0].contains("mode gre"));
        assert!(set.client[0].contains("mode gre"));
    }

    #[test]
    fn test_third_prefix_only_extends_the_tail() {
        for tunnel_type in [TunnelType::Sit, TunnelType::Gre, TunnelType::Wireguard] {
            let without = create_commands(&record(tunnel_type, false), &wg_config());
            let with = create_commands(&record(tunnel_type, true), &wg_config());

            // Server: strictly appended.
            if tunnel_type == TunnelType::Wireguard {
                // The allowed-ips line differs; routes after it are appended.
                assert_eq!(without.server[1..], with.server[1..without.server.len()]);
            } else {
                assert_eq!(without.server[..], with.server[..without.server.len()]);
            }
            assert_eq!(with.server.len(), without.server.len() + 1);

            // Client: every shared entry keeps its order; only new address
            // lines appear.
            let mut with_iter = with.client.iter();
            for entry in &without.client {
                assert!(
                    with_iter.any(|e| e == entry),
                    "{:?} lost or reordered entry {}",
                    tunnel_type,
                    entry
                );
            }
        }
    }

    #[test]
    fn test_wireguard_allowed_ips_composition() {
        let set = create_commands(&record(TunnelType::Wireguard, true), &wg_config());
        assert_eq!(
            set.server[0],
            "wg set wg0 peer CLIENTPUB= allowed-ips fd6b:7660:0:beef::2/64,\
2a06:9881:100e:abcd::/64,2a06:9881:2003:abcd::/64,2a06:9881:5000:abcd::/64"
        );
        // No interface creation on the server: wg0 is provisioned at startup.
        assert!(!set.server.iter().any(|c| c.contains("ip link add")));
        assert_eq!(set.server.len(), 4);
    }

    #[test]
    fn test_wireguard_client_commands() {
        let set = create_commands(&record(TunnelType::Wireguard, false), &wg_config());
        assert_eq!(set.client[0], "ip link add dev tun-abcd-1 type wireguard");
        assert!(set
            .client
            .iter()
            .any(|c| c == "echo 'CLIENTPRIV=' > /etc/wireguard/tun-abcd-1_private.key \
&& chmod 600 /etc/wireguard/tun-abcd-1_private.key"));
        assert!(set.client.iter().any(|c| c
            == "wg set tun-abcd-1 private-key /etc/wireguard/tun-abcd-1_private.key \
peer SERVERPUB= endpoint 192.67.35.38:51820 allowed-ips ::/0"));
        assert_eq!(set.client.last().unwrap(), "ip -6 route add ::/0 dev tun-abcd-1");
    }

    #[test]
    fn test_create_delete_round_trip_cancels() {
        let wg = wg_config();

        let tunnel = record(TunnelType::Sit, true);
        let up = create_commands(&tunnel, &wg);
        let down = delete_commands(&tunnel, &wg);
        assert!(up.server[0].starts_with("ip tunnel add tun-abcd-1"));
        assert_eq!(down.server, vec!["ip tunnel del tun-abcd-1"]);

        let tunnel = record(TunnelType::Wireguard, true);
        let up = create_commands(&tunnel, &wg);
        let down = delete_commands(&tunnel, &wg);
        assert!(up.server[0].starts_with("wg set wg0 peer CLIENTPUB= allowed-ips"));
        assert_eq!(down.server[0], "wg set wg0 peer CLIENTPUB= remove");
        // Every route added on the shared interface is deleted explicitly.
        for added in &up.server[1..] {
            let deleted = added.replace("route add", "route del");
            assert!(down.server.contains(&deleted), "missing {}", deleted);
        }
    }

    #[test]
    fn test_update_client_ip() {
        let wg = wg_config();

        let set = update_client_ip_commands(&record(TunnelType::Gre, true), &wg);
        assert_eq!(
            set.server,
            vec!["ip tunnel change tun-abcd-1 mode gre remote 141.11.62.211 ttl 255"]
        );

        let set = update_client_ip_commands(&record(TunnelType::Wireguard, true), &wg);
        assert!(set.server.is_empty());
        assert_eq!(set.client.len(), 1);
        assert!(set.client[0].starts_with('#'));
    }

    #[test]
    fn test_suspend_resume_touch_routes_only() {
        let wg = wg_config();

        let suspend = suspend_commands(&record(TunnelType::Sit, true), &wg);
        assert_eq!(suspend.server.len(), 3);
        assert!(suspend.server.iter().all(|c| c.starts_with("ip -6 route del")));
        assert!(suspend.server.iter().all(|c| c.ends_with("dev tun-abcd-1")));

        // WireGuard toggles routes on the shared interface, never the peer.
        let suspend = suspend_commands(&record(TunnelType::Wireguard, true), &wg);
        assert!(suspend.server.iter().all(|c| c.ends_with("dev wg0")));
        assert!(!suspend.server.iter().any(|c| c.contains("peer")));

        let resume = resume_commands(&record(TunnelType::Sit, true), &wg);
        assert!(resume.server.iter().all(|c| c.starts_with("ip -6 route add")));
    }
}
