//! Prefix allocation
//!
//! Turns (pool, user) into unique delegated /64s. The in-memory reservation
//! set is a best-effort fast path shared by concurrent requests; the
//! datastore uniqueness check is the source of truth and happens under the
//! same lock, so two racing allocations cannot both pass.

use parking_lot::Mutex;
use rand::Rng;
use sixtun_common::addr;
use sixtun_common::config::PrefixesConfig;
use sixtun_common::{parse_user_id, Error, Result};
use std::collections::HashSet;
use tracing::debug;

/// Authoritative "is this prefix already assigned" predicate, backed by the
/// tunnel inventory
pub trait UniquenessOracle: Send + Sync {
    fn is_prefix_in_use(&self, prefix: &str) -> Result<bool>;
}

/// Bounded attempts for randomized delegated-prefix allocation
const MAX_ATTEMPTS: u32 = 10;

/// Everything a new tunnel needs from the address plan
#[derive(Debug, Clone)]
pub struct Allocation {
    pub endpoint_local: String,
    pub endpoint_remote: String,
    pub prefix1: String,
    pub prefix2: String,
    pub prefix3: String,
}

impl Allocation {
    pub fn prefixes(&self) -> [&str; 3] {
        [&self.prefix1, &self.prefix2, &self.prefix3]
    }
}

/// Stateful prefix allocator over the fixed pool topology
pub struct PrefixAllocator {
    prefixes: PrefixesConfig,
    reserved: Mutex<HashSet<String>>,
}

impl PrefixAllocator {
    pub fn new(prefixes: PrefixesConfig) -> Self {
        Self {
            prefixes,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the full address plan for one tunnel.
    ///
    /// Any failure releases every reservation taken so far; a half-successful
    /// allocation never holds a phantom reservation.
    pub fn allocate_for_tunnel(
        &self,
        oracle: &dyn UniquenessOracle,
        user_id: &str,
        pair_number: u8,
    ) -> Result<Allocation> {
        let user = parse_user_id(user_id)?;
        let pair = self.prefixes.pair(pair_number);

        let prefix1 = self.allocate_delegated(oracle, &pair.primary, user)?;
        let prefix2 = match self.allocate_delegated(oracle, &pair.secondary, user) {
            Ok(prefix) => prefix,
            Err(e) => {
                self.release([prefix1.as_str()]);
                return Err(e);
            }
        };
        let prefix3 = match self.allocate_third(oracle, user, pair_number) {
            Ok(prefix) => prefix,
            Err(e) => {
                self.release([prefix1.as_str(), prefix2.as_str()]);
                return Err(e);
            }
        };
        let (endpoint_local, endpoint_remote) = match self.allocate_endpoint_pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.release([prefix1.as_str(), prefix2.as_str(), prefix3.as_str()]);
                return Err(e);
            }
        };

        Ok(Allocation {
            endpoint_local,
            endpoint_remote,
            prefix1,
            prefix2,
            prefix3,
        })
    }

    /// Allocate one delegated /64 from a /44 pool with a fresh entropy nibble
    /// per attempt
    pub fn allocate_delegated(
        &self,
        oracle: &dyn UniquenessOracle,
        base: &str,
        user: u16,
    ) -> Result<String> {
        for _ in 0..MAX_ATTEMPTS {
            let nibble: u8 = rand::thread_rng().gen_range(0..16);
            let candidate = addr::delegated_from_pool(base, nibble, user)?;

            let mut reserved = self.reserved.lock();
            if reserved.contains(&candidate) {
                continue;
            }
            if oracle.is_prefix_in_use(&candidate)? {
                debug!("Prefix {} already assigned, retrying", candidate);
                continue;
            }
            reserved.insert(candidate.clone());
            return Ok(candidate);
        }
        Err(Error::AllocationExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Allocate the deterministic third /64.
    ///
    /// Pool precedence: the primary /48 is tried only for a user's first
    /// tunnel; the alternate pool (when configured) is preferred next; the
    /// primary is retried last only for second tunnels or when no alternate
    /// exists.
    pub fn allocate_third(
        &self,
        oracle: &dyn UniquenessOracle,
        user: u16,
        pair_number: u8,
    ) -> Result<String> {
        let alt = self.prefixes.alt_third.as_deref();

        if pair_number == 1 {
            if let Some(prefix) = self.try_third(oracle, &self.prefixes.third, user)? {
                return Ok(prefix);
            }
        }
        if let Some(alt) = alt {
            if let Some(prefix) = self.try_third(oracle, alt, user)? {
                return Ok(prefix);
            }
        }
        if pair_number != 1 || alt.is_none() {
            if let Some(prefix) = self.try_third(oracle, &self.prefixes.third, user)? {
                return Ok(prefix);
            }
        }

        Err(Error::AllocationExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    fn try_third(
        &self,
        oracle: &dyn UniquenessOracle,
        base: &str,
        user: u16,
    ) -> Result<Option<String>> {
        let candidate = addr::third_from_pool(base, user)?;

        let mut reserved = self.reserved.lock();
        if reserved.contains(&candidate) {
            return Ok(None);
        }
        if oracle.is_prefix_in_use(&candidate)? {
            return Ok(None);
        }
        reserved.insert(candidate.clone());
        Ok(Some(candidate))
    }

    /// Derive the ULA point-to-point pair from a random 16-bit sequence.
    ///
    /// No uniqueness check against other tunnels: the collision probability
    /// over the 16-bit space is an accepted limitation.
    pub fn allocate_endpoint_pair(&self) -> Result<(String, String)> {
        let seq: u16 = rand::thread_rng().gen();
        addr::endpoint_pair(&self.prefixes.ula, seq)
    }

    /// Drop cache reservations. Row deletion is what frees authoritative
    /// uniqueness; this only clears the fast path.
    pub fn release<'a>(&self, prefixes: impl IntoIterator<Item = &'a str>) {
        let mut reserved = self.reserved.lock();
        for prefix in prefixes {
            reserved.remove(prefix);
        }
    }
}
