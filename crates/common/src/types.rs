//! Core types for sixtun

use serde::{Deserialize, Serialize};

/// Tunnel transport type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Sit,
    Gre,
    #[serde(rename = "wg")]
    Wireguard,
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelType::Sit => write!(f, "sit"),
            TunnelType::Gre => write!(f, "gre"),
            TunnelType::Wireguard => write!(f, "wg"),
        }
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sit" => Ok(Self::Sit),
            "gre" => Ok(Self::Gre),
            "wg" => Ok(Self::Wireguard),
            _ => Err(format!("unknown tunnel type: {}", s)),
        }
    }
}

/// Tunnel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Active,
    Suspended,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Active => write!(f, "active"),
            TunnelStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for TunnelStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            _ => Err(format!("unknown tunnel status: {}", s)),
        }
    }
}

/// A provisioned tunnel record
///
/// The id encodes the owning user and the pair number (`tun-<user>-<pair>`),
/// which selects the pool pair that supplied the delegated prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub status: TunnelStatus,
    pub server_ipv4: String,
    pub client_ipv4: String,
    pub endpoint_local: String,
    pub endpoint_remote: String,
    pub delegated_prefix_1: String,
    pub delegated_prefix_2: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_prefix_3: Option<String>,
    pub created_at: i64,
    pub modified_at: i64,

    // WireGuard fields; the server keypair is global, only client keys are
    // per tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl TunnelRecord {
    /// All delegated prefixes in order, third included when present.
    pub fn delegated_prefixes(&self) -> Vec<&str> {
        let mut prefixes = vec![self.delegated_prefix_1.as_str(), self.delegated_prefix_2.as_str()];
        if let Some(p3) = &self.delegated_prefix_3 {
            prefixes.push(p3.as_str());
        }
        prefixes
    }
}

/// A broker user with tunnel counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub created_tunnels: i64,
    pub active_tunnels: i64,
}

/// Ordered server- and client-side configuration commands for a tunnel.
///
/// Derived from a TunnelRecord on demand and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    pub server: Vec<String>,
    pub client: Vec<String>,
}

/// A tunnel paired with its regenerated command set, as served by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelWithCommands {
    pub tunnel: TunnelRecord,
    pub commands: CommandSet,
}

/// Parse a 4-character hex user identifier into its 16-bit value
pub fn parse_user_id(user_id: &str) -> crate::Result<u16> {
    if user_id.len() != 4 || !user_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidUserId(user_id.to_string()));
    }
    u16::from_str_radix(user_id, 16).map_err(|_| crate::Error::InvalidUserId(user_id.to_string()))
}
