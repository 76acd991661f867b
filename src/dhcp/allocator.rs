use crate::database::models::{canonical_mac, Lease, LeaseState, NewLease};
use crate::dhcp::subnet::{Pool, Subnet};
use crate::error::{Error, Result};
use crate::store::cache::LeaseCache;
use crate::store::{allocation_lock_key, LeaseStore};
use chrono::{Duration, Utc};
use mac_address::MacAddress;
use rand::seq::SliceRandom;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many LRU candidates to fetch per pool before falling back to a
/// randomized walk of the whole range.
const LRU_CANDIDATES: i64 = 10;

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub mac: MacAddress,
    pub hostname: Option<String>,
    pub lease_duration: u32,
    pub client_id: Option<String>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
}

/// Chooses an IP for a (MAC, subnet) request. Every decision is made against
/// the store; the cache only ever absorbs confirmed results.
pub struct Allocator {
    store: Arc<LeaseStore>,
    cache: Option<Arc<LeaseCache>>,
    server_id: String,
}

impl Allocator {
    pub fn new(store: Arc<LeaseStore>, cache: Option<Arc<LeaseCache>>, server_id: String) -> Self {
        Self {
            store,
            cache,
            server_id,
        }
    }

    /// The allocation priority ladder: existing active lease, then static
    /// reservation, then pool allocation (LRU candidates first, randomized
    /// probing second).
    pub async fn allocate(&self, subnet: &Subnet, req: &AllocationRequest) -> Result<Lease> {
        let mac_str = canonical_mac(&req.mac);

        if let Some(lease) = self.store.get_lease_by_mac(&req.mac, &subnet.cidr).await? {
            debug!("existing active lease for {}: {}", mac_str, lease.ip);
            return Ok(lease);
        }

        if let Some(reservation) = self.store.get_reservation_by_mac(&req.mac).await? {
            if reservation.subnet == subnet.cidr {
                debug!("reservation for {}: {}", mac_str, reservation.ip);
                let lease = self.claim_locked(subnet, req, reservation.ip, true).await?;
                self.cache_put(&lease);
                return Ok(lease);
            }
            debug!(
                "reservation for {} is in {}, not {}; ignoring",
                mac_str, reservation.subnet, subnet.cidr
            );
        }

        for pool in &subnet.pools {
            match self.allocate_from_pool(subnet, req, pool).await? {
                Some(lease) => {
                    self.cache_put(&lease);
                    return Ok(lease);
                }
                None => continue,
            }
        }

        Err(Error::PoolExhausted {
            subnet: subnet.cidr_string(),
        })
    }

    async fn allocate_from_pool(
        &self,
        subnet: &Subnet,
        req: &AllocationRequest,
        pool: &Pool,
    ) -> Result<Option<Lease>> {
        // Least-recently-expired rows are the cheapest reuse: the longer an
        // address has been idle, the less likely a stale client still sits
        // on it.
        let candidates = self
            .store
            .get_expired_leases(&subnet.cidr, pool.range_start, pool.range_end, LRU_CANDIDATES)
            .await?;
        for candidate in candidates {
            match self.claim_locked(subnet, req, candidate.ip, false).await {
                Ok(lease) => return Ok(Some(lease)),
                Err(Error::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }

        // Randomized probing over the whole range. The shuffle is what keeps
        // concurrently racing servers off the same address.
        let network = subnet.network.network();
        let broadcast = subnet.broadcast();
        let mut addresses: Vec<Ipv4Addr> = pool
            .addresses()
            .filter(|ip| *ip != network && *ip != broadcast)
            .collect();
        addresses.shuffle(&mut rand::thread_rng());

        for ip in addresses {
            match self.claim_locked(subnet, req, ip, false).await {
                Ok(lease) => return Ok(Some(lease)),
                Err(Error::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Claim `ip` under its per-IP advisory lock: re-verify the row state
    /// authoritatively, then update the existing row or insert a fresh one.
    async fn claim_locked(
        &self,
        subnet: &Subnet,
        req: &AllocationRequest,
        ip: Ipv4Addr,
        reservation_claim: bool,
    ) -> Result<Lease> {
        let key = allocation_lock_key(&subnet.cidr, ip);
        self.store
            .with_advisory_lock(key, || self.claim_ip(subnet, req, ip, reservation_claim))
            .await
    }

    async fn claim_ip(
        &self,
        subnet: &Subnet,
        req: &AllocationRequest,
        ip: Ipv4Addr,
        reservation_claim: bool,
    ) -> Result<Lease> {
        if !reservation_claim {
            if let Some(other) = self.store.get_reservation_by_ip(ip, &subnet.cidr).await? {
                if other.mac != req.mac {
                    return Err(Error::Conflict);
                }
            }
        }

        let now = Utc::now();
        let expires_at = now + Duration::seconds(req.lease_duration as i64);

        match self.store.get_lease_by_ip(ip, &subnet.cidr).await? {
            Some(row) => {
                if row.state == LeaseState::Active && row.mac != req.mac {
                    if !reservation_claim {
                        return Err(Error::Conflict);
                    }
                    // The reservation is authoritative for this address.
                    warn!(
                        "reservation claim for {} evicts active lease held by {}",
                        ip,
                        row.mac_string()
                    );
                }
                let mut lease = row;
                lease.mac = req.mac;
                lease.hostname = req.hostname.clone();
                lease.issued_at = now;
                lease.expires_at = expires_at;
                lease.last_seen = now;
                lease.state = LeaseState::Active;
                lease.client_id = req.client_id.clone();
                lease.vendor_class = req.vendor_class.clone();
                lease.user_class = req.user_class.clone();
                lease.allocated_by = self.allocated_by();
                self.store.update_lease(&lease).await
            }
            None => {
                self.store
                    .create_lease(&NewLease {
                        ip,
                        mac: req.mac,
                        hostname: req.hostname.clone(),
                        subnet: subnet.cidr,
                        issued_at: now,
                        expires_at,
                        client_id: req.client_id.clone(),
                        vendor_class: req.vendor_class.clone(),
                        user_class: req.user_class.clone(),
                        allocated_by: self.allocated_by(),
                    })
                    .await
            }
        }
    }

    /// Extend an existing lease. The caller resolved the row beforehand; the
    /// ownership check is repeated under the per-IP lock so a raced takeover
    /// cannot slip through.
    pub async fn renew(
        &self,
        mac: &MacAddress,
        ip: Ipv4Addr,
        subnet: &Subnet,
        duration: u32,
    ) -> Result<Lease> {
        let key = allocation_lock_key(&subnet.cidr, ip);
        let requester = canonical_mac(mac);
        let lease = self
            .store
            .with_advisory_lock(key, || async {
                let row = self.store.get_lease_by_ip(ip, &subnet.cidr).await?;
                let row = match row {
                    Some(row) => row,
                    None => {
                        return Err(Error::MacMismatch {
                            ip,
                            owner: "nobody".into(),
                            requester: requester.clone(),
                        })
                    }
                };
                if row.mac != *mac {
                    return Err(Error::MacMismatch {
                        ip,
                        owner: row.mac_string(),
                        requester: requester.clone(),
                    });
                }
                let new_expiry = Utc::now() + Duration::seconds(duration as i64);
                self.store.renew_lease(row.id, new_expiry).await
            })
            .await?;

        self.cache_put(&lease);
        Ok(lease)
    }

    pub async fn release(&self, ip: Ipv4Addr, subnet: &Subnet) -> Result<bool> {
        let released = self.store.release_lease(ip, &subnet.cidr).await?;
        self.cache_evict(ip);
        Ok(released)
    }

    pub async fn decline(&self, ip: Ipv4Addr, subnet: &Subnet) -> Result<bool> {
        let declined = self.store.decline_lease(ip, &subnet.cidr).await?;
        self.cache_evict(ip);
        Ok(declined)
    }

    fn allocated_by(&self) -> Option<String> {
        if self.server_id.is_empty() {
            None
        } else {
            Some(self.server_id.clone())
        }
    }

    fn cache_put(&self, lease: &Lease) {
        if let Some(cache) = &self.cache {
            cache.put(lease.clone());
        }
    }

    fn cache_evict(&self, ip: Ipv4Addr) {
        if let Some(cache) = &self.cache {
            cache.remove_by_ip(ip);
        }
    }
}

/// Wire-derived strings (hostname, client identifier, vendor class, user
/// class) may hold arbitrary bytes. Anything that is not clean UTF-8, or
/// that carries control characters other than tab, LF and CR, is stored as
/// `hex:<lowercase hex>` so it survives any storage encoding.
pub fn sanitize_field(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) if s.chars().all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r')) => {
            s.to_string()
        }
        _ => {
            let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
            format!("hex:{hex}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_clean_utf8() {
        assert_eq!(sanitize_field(b"workstation-42"), "workstation-42");
        assert_eq!(sanitize_field("café".as_bytes()), "café");
        assert_eq!(sanitize_field(b"line1\nline2\ttab"), "line1\nline2\ttab");
    }

    #[test]
    fn sanitize_hex_encodes_embedded_nul() {
        assert_eq!(sanitize_field(b"host\x00name"), "hex:686f7374006e616d65");
    }

    #[test]
    fn sanitize_hex_encodes_invalid_utf8() {
        assert_eq!(sanitize_field(&[0xff, 0xfe]), "hex:fffe");
    }

    #[test]
    fn sanitize_hex_encodes_escape_sequences() {
        // ANSI escapes must not reach log pipelines or the database raw
        assert!(sanitize_field(b"\x1b[31mred").starts_with("hex:"));
    }

    #[test]
    fn sanitize_is_stable() {
        let raw = b"host\x00name";
        assert_eq!(sanitize_field(raw), sanitize_field(raw));
    }
}
