//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Top-level broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Prefix pools
    pub prefixes: PrefixesConfig,

    /// Server endpoint handed out to clients
    pub server: ServerConfig,

    /// Provisioning API settings
    pub api: ApiConfig,

    /// Database settings
    pub database: DatabaseConfig,

    /// Shared WireGuard interface settings
    pub wireguard: WireGuardConfig,

    /// External script hooks
    pub scripts: ScriptsConfig,

    /// Boot-time recovery settings
    pub recovery: RecoveryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefixes: PrefixesConfig::default(),
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            wireguard: WireGuardConfig::default(),
            scripts: ScriptsConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// A pool pair backing one tunnel slot: the first delegated prefix comes from
/// `primary`, the second from `secondary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixPair {
    pub primary: String,
    pub secondary: String,
}

/// Fixed pool topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixesConfig {
    /// Pools backing a user's first tunnel
    pub para1: PrefixPair,

    /// Pools backing a user's second tunnel
    pub para2: PrefixPair,

    /// ULA base for point-to-point endpoint pairs
    pub ula: String,

    /// Primary /48 pool for the optional third prefix
    pub third: String,

    /// Alternate /48 pool for the third prefix
    #[serde(default)]
    pub alt_third: Option<String>,
}

impl Default for PrefixesConfig {
    fn default() -> Self {
        Self {
            para1: PrefixPair {
                primary: "2a06:9881:1000::/44".to_string(),
                secondary: "2a06:9881:2000::/44".to_string(),
            },
            para2: PrefixPair {
                primary: "2a06:9881:3000::/44".to_string(),
                secondary: "2a06:9881:4000::/44".to_string(),
            },
            ula: "fd6b:7660::/48".to_string(),
            third: "2a06:9881:5000::/48".to_string(),
            alt_third: None,
        }
    }
}

impl PrefixesConfig {
    /// The pool pair backing a tunnel slot
    pub fn pair(&self, pair_number: u8) -> &PrefixPair {
        if pair_number == 1 {
            &self.para1
        } else {
            &self.para2
        }
    }
}

/// Server endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public IPv4 of the broker host, used as the tunnel remote
    pub ipv4: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ipv4: "192.0.2.1".to_string(),
        }
    }
}

/// Provisioning API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address
    pub listen: String,

    /// Pre-shared API key required on every request
    pub key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8070".to_string(),
            key: String::new(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sixtun/state.db"),
        }
    }
}

/// Shared WireGuard interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    /// Shared interface name
    pub interface: String,

    /// Listen port, copied onto WireGuard tunnel records
    pub listen_port: u16,

    /// Server private key file
    pub private_key_file: PathBuf,

    /// Server public key (base64); derived from the key file when empty
    #[serde(default)]
    pub public_key: String,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            listen_port: 51820,
            private_key_file: PathBuf::from("/etc/sixtun/wireguard/server.key"),
            public_key: String::new(),
        }
    }
}

/// External script hooks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Idempotent firewall/security script, re-applied after tunnel changes
    pub security: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            security: PathBuf::from("/etc/sixtun/scripts/tunnel-security.sh"),
        }
    }
}

/// Boot-time recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Delay before the first inventory fetch, giving the API time to start
    pub warmup_secs: u64,

    /// Bounded attempts for the inventory fetch
    pub fetch_attempts: u32,

    /// Fixed delay between fetch attempts
    pub fetch_retry_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 5,
            fetch_attempts: 3,
            fetch_retry_secs: 2,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.load_wireguard_public_key();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.database.path.clone()
    }

    /// Fill in the WireGuard public key from the private-key file.
    ///
    /// WireGuard may simply not be configured yet, so a missing or unreadable
    /// key file is a warning, not a failure.
    fn load_wireguard_public_key(&mut self) {
        if !self.wireguard.public_key.is_empty() {
            return;
        }
        match std::fs::read_to_string(&self.wireguard.private_key_file) {
            Ok(private) => match crate::crypto::public_key_from_private(&private) {
                Ok(public) => self.wireguard.public_key = public,
                Err(e) => warn!("Could not derive WireGuard public key: {}", e),
            },
            Err(e) => warn!(
                "Could not read WireGuard private key file {:?}: {}",
                self.wireguard.private_key_file, e
            ),
        }
    }
}
