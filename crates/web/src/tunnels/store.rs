//! Tunnel inventory persistence
//!
//! Repository over the shared SQLite database. Tunnel insertion and the
//! user-counter bump are composed in one transaction so a creation never
//! half-commits.

use crate::tunnels::allocator::UniquenessOracle;
use rusqlite::{params, OptionalExtension, Row};
use sixtun_common::{Database, Result, TunnelRecord, TunnelStatus, TunnelType, User};

/// Tunnel store over the shared database
#[derive(Clone)]
pub struct TunnelStore {
    db: Database,
}

fn row_to_tunnel(row: &Row<'_>) -> rusqlite::Result<TunnelRecord> {
    Ok(TunnelRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tunnel_type: row.get::<_, String>(2)?.parse::<TunnelType>().unwrap(),
        status: row.get::<_, String>(3)?.parse::<TunnelStatus>().unwrap(),
        server_ipv4: row.get(4)?,
        client_ipv4: row.get(5)?,
        endpoint_local: row.get(6)?,
        endpoint_remote: row.get(7)?,
        delegated_prefix_1: row.get(8)?,
        delegated_prefix_2: row.get(9)?,
        delegated_prefix_3: row.get(10)?,
        server_public_key: row.get(11)?,
        client_private_key: row.get(12)?,
        client_public_key: row.get(13)?,
        listen_port: row.get(14)?,
        created_at: row.get(15)?,
        modified_at: row.get(16)?,
    })
}

const TUNNEL_COLUMNS: &str = "id, user_id, type, status, server_ipv4, client_ipv4, \
endpoint_local, endpoint_remote, delegated_prefix_1, delegated_prefix_2, delegated_prefix_3, \
server_public_key, client_private_key, client_public_key, listen_port, created_at, modified_at";

impl TunnelStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a tunnel and bump the owner's counters in one transaction.
    ///
    /// The user row is created on first use.
    pub fn insert_tunnel(&self, tunnel: &TunnelRecord) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO users (id) VALUES (?1)",
            params![tunnel.user_id],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO tunnels ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                TUNNEL_COLUMNS
            ),
            params![
                tunnel.id,
                tunnel.user_id,
                tunnel.tunnel_type.to_string(),
                tunnel.status.to_string(),
                tunnel.server_ipv4,
                tunnel.client_ipv4,
                tunnel.endpoint_local,
                tunnel.endpoint_remote,
                tunnel.delegated_prefix_1,
                tunnel.delegated_prefix_2,
                tunnel.delegated_prefix_3,
                tunnel.server_public_key,
                tunnel.client_private_key,
                tunnel.client_public_key,
                tunnel.listen_port,
                tunnel.created_at,
                tunnel.modified_at,
            ],
        )?;
        tx.execute(
            "UPDATE users SET created_tunnels = created_tunnels + 1, \
             active_tunnels = active_tunnels + 1 WHERE id = ?1",
            params![tunnel.user_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn count_active_by_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM tunnels WHERE user_id = ?1 AND status = 'active'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_tunnel(&self, id: &str) -> Result<Option<TunnelRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let tunnel = conn
            .query_row(
                &format!("SELECT {} FROM tunnels WHERE id = ?1", TUNNEL_COLUMNS),
                params![id],
                row_to_tunnel,
            )
            .optional()?;
        Ok(tunnel)
    }

    /// All tunnels, or one user's, newest first
    pub fn list_tunnels(&self, user_id: Option<&str>) -> Result<Vec<TunnelRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut tunnels = Vec::new();
        match user_id {
            Some(user_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tunnels WHERE user_id = ?1 ORDER BY created_at DESC",
                    TUNNEL_COLUMNS
                ))?;
                let rows = stmt.query_map(params![user_id], row_to_tunnel)?;
                for row in rows {
                    tunnels.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tunnels ORDER BY created_at DESC",
                    TUNNEL_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_tunnel)?;
                for row in rows {
                    tunnels.push(row?);
                }
            }
        }
        Ok(tunnels)
    }

    pub fn update_client_ipv4(&self, id: &str, client_ipv4: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE tunnels SET client_ipv4 = ?1, modified_at = ?2 WHERE id = ?3",
            params![client_ipv4, chrono::Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: TunnelStatus) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE tunnels SET status = ?1, modified_at = ?2 WHERE id = ?3",
            params![status.to_string(), chrono::Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    /// Remove the row; this is what actually frees prefix uniqueness
    pub fn delete_tunnel(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("DELETE FROM tunnels WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn decrement_active_tunnels(&self, user_id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET active_tunnels = active_tunnels - 1 WHERE id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let user = conn
            .query_row(
                "SELECT id, created_tunnels, active_tunnels FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        created_tunnels: row.get(1)?,
                        active_tunnels: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

impl UniquenessOracle for TunnelStore {
    /// A prefix is in use when any tunnel holds it in any of its three
    /// delegated-prefix columns.
    fn is_prefix_in_use(&self, prefix: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tunnels WHERE delegated_prefix_1 = ?1 \
             OR delegated_prefix_2 = ?1 OR delegated_prefix_3 = ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> TunnelStore {
        TunnelStore::new(Database::open_memory().unwrap())
    }

    fn sample(id: &str, user_id: &str, status: TunnelStatus) -> TunnelRecord {
        TunnelRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            tunnel_type: TunnelType::Sit,
            status,
            server_ipv4: "192.67.35.38".to_string(),
            client_ipv4: "141.11.62.211".to_string(),
            endpoint_local: "fd6b:7660:0:1::1/64".to_string(),
            endpoint_remote: "fd6b:7660:0:1::2/64".to_string(),
            delegated_prefix_1: format!("2a06:9881:1001:{}::/64", user_id),
            delegated_prefix_2: format!("2a06:9881:2001:{}::/64", user_id),
            delegated_prefix_3: Some(format!("2a06:9881:5000:{}::/64", user_id)),
            created_at: 1_700_000_000,
            modified_at: 1_700_000_000,
            server_public_key: None,
            client_private_key: None,
            client_public_key: None,
            listen_port: None,
        }
    }

    #[test]
    fn test_insert_creates_user_and_bumps_counters() {
        let store = test_store();
        store.insert_tunnel(&sample("tun-abcd-1", "abcd", TunnelStatus::Active)).unwrap();

        let user = store.get_user("abcd").unwrap().unwrap();
        assert_eq!(user.created_tunnels, 1);
        assert_eq!(user.active_tunnels, 1);
        assert_eq!(store.count_active_by_user("abcd").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_id_rolls_back_counters() {
        let store = test_store();
        let tunnel = sample("tun-abcd-1", "abcd", TunnelStatus::Active);
        store.insert_tunnel(&tunnel).unwrap();
        assert!(store.insert_tunnel(&tunnel).is_err());

        // The failed transaction must not have touched the counters.
        let user = store.get_user("abcd").unwrap().unwrap();
        assert_eq!(user.created_tunnels, 1);
        assert_eq!(user.active_tunnels, 1);
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let store = test_store();
        let mut tunnel = sample("tun-abcd-1", "abcd", TunnelStatus::Active);
        tunnel.tunnel_type = TunnelType::Wireguard;
        tunnel.client_public_key = Some("CLIENTPUB=".to_string());
        tunnel.listen_port = Some(51820);
        store.insert_tunnel(&tunnel).unwrap();

        let loaded = store.get_tunnel("tun-abcd-1").unwrap().unwrap();
        assert_eq!(loaded.tunnel_type, TunnelType::Wireguard);
        assert_eq!(loaded.client_public_key.as_deref(), Some("CLIENTPUB="));
        assert_eq!(loaded.listen_port, Some(51820));
        assert_eq!(loaded.delegated_prefix_3, tunnel.delegated_prefix_3);
    }

    #[test]
    fn test_prefix_uniqueness_covers_all_three_columns() {
        let store = test_store();
        let tunnel = sample("tun-abcd-1", "abcd", TunnelStatus::Active);
        store.insert_tunnel(&tunnel).unwrap();

        assert!(store.is_prefix_in_use(&tunnel.delegated_prefix_1).unwrap());
        assert!(store.is_prefix_in_use(&tunnel.delegated_prefix_2).unwrap());
        assert!(store
            .is_prefix_in_use(tunnel.delegated_prefix_3.as_deref().unwrap())
            .unwrap());
        assert!(!store.is_prefix_in_use("2a06:9881:1001:ffff::/64").unwrap());
    }

    #[test]
    fn test_count_ignores_suspended() {
        let store = test_store();
        store.insert_tunnel(&sample("tun-abcd-1", "abcd", TunnelStatus::Active)).unwrap();
        store.insert_tunnel(&sample("tun-abcd-2", "abcd", TunnelStatus::Active)).unwrap();
        store.update_status("tun-abcd-1", TunnelStatus::Suspended).unwrap();
        assert_eq!(store.count_active_by_user("abcd").unwrap(), 1);
    }

    #[test]
    fn test_delete_and_decrement() {
        let store = test_store();
        store.insert_tunnel(&sample("tun-abcd-1", "abcd", TunnelStatus::Active)).unwrap();
        store.delete_tunnel("tun-abcd-1").unwrap();
        store.decrement_active_tunnels("abcd").unwrap();

        assert!(store.get_tunnel("tun-abcd-1").unwrap().is_none());
        let user = store.get_user("abcd").unwrap().unwrap();
        assert_eq!(user.active_tunnels, 0);
        assert_eq!(user.created_tunnels, 1);
    }

    #[test]
    fn test_list_filters_by_user() {
        let store = test_store();
        store.insert_tunnel(&sample("tun-abcd-1", "abcd", TunnelStatus::Active)).unwrap();
        store.insert_tunnel(&sample("tun-beef-1", "beef", TunnelStatus::Active)).unwrap();

        assert_eq!(store.list_tunnels(None).unwrap().len(), 2);
        let mine = store.list_tunnels(Some("abcd")).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "tun-abcd-1");
    }
}
