pub mod cache;
pub mod queries;

use crate::database::models::{
    ActiveConfig, GitSyncLog, Lease, NewLease, NewReservation, Reservation, SyncStatus,
    SyncTrigger,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use sqlx::{Connection, PgPool};
use std::future::Future;
use std::net::Ipv4Addr;
use tracing::warn;
use uuid::Uuid;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Lock key for a specific (IP, subnet): FNV-1a 64 over the CIDR text
/// followed by the four address octets, reinterpreted as a signed 64-bit
/// integer. Every writer that touches the same address must derive the same
/// key; the lock is cooperative.
pub fn allocation_lock_key(subnet: &IpNetwork, ip: Ipv4Addr) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in subnet.to_string().bytes().chain(ip.octets()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// Durable state for leases, reservations and the sync audit trail. All
/// cross-node serialization goes through `with_advisory_lock`.
#[derive(Clone)]
pub struct LeaseStore {
    pool: PgPool,
}

impl LeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `f` while a Postgres advisory lock on `key` is held by a
    /// dedicated connection. The lock is released on every exit path; if the
    /// unlock statement itself fails the connection is closed, which drops
    /// the session-scoped lock with it.
    pub async fn with_advisory_lock<T, F, Fut>(&self, key: i64, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(Error::from)?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await?;

        let result = f().await;

        let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlock {
            warn!("advisory unlock for key {} failed, closing connection: {}", key, e);
            let _ = conn.detach().close().await;
        }

        result
    }

    pub async fn get_lease_by_mac(
        &self,
        mac: &MacAddress,
        subnet: &IpNetwork,
    ) -> Result<Option<Lease>> {
        queries::get_lease_by_mac(&self.pool, mac, subnet).await
    }

    pub async fn get_lease_by_ip(&self, ip: Ipv4Addr, subnet: &IpNetwork) -> Result<Option<Lease>> {
        queries::get_lease_by_ip(&self.pool, ip, subnet).await
    }

    pub async fn create_lease(&self, new: &NewLease) -> Result<Lease> {
        queries::create_lease(&self.pool, new).await
    }

    pub async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        queries::update_lease(&self.pool, lease).await
    }

    pub async fn renew_lease(&self, id: Uuid, new_expiry: DateTime<Utc>) -> Result<Lease> {
        queries::renew_lease(&self.pool, id, new_expiry).await
    }

    pub async fn release_lease(&self, ip: Ipv4Addr, subnet: &IpNetwork) -> Result<bool> {
        queries::release_lease(&self.pool, ip, subnet).await
    }

    pub async fn decline_lease(&self, ip: Ipv4Addr, subnet: &IpNetwork) -> Result<bool> {
        queries::decline_lease(&self.pool, ip, subnet).await
    }

    pub async fn get_expired_leases(
        &self,
        subnet: &IpNetwork,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        limit: i64,
    ) -> Result<Vec<Lease>> {
        queries::get_expired_leases(&self.pool, subnet, range_start, range_end, limit).await
    }

    pub async fn expire_old(&self) -> Result<u64> {
        queries::expire_old(&self.pool).await
    }

    pub async fn delete_old(&self, older_than: Duration) -> Result<u64> {
        queries::delete_old(&self.pool, Utc::now() - older_than).await
    }

    pub async fn count_active_leases(&self) -> Result<i64> {
        queries::count_active_leases(&self.pool).await
    }

    pub async fn get_reservation_by_mac(&self, mac: &MacAddress) -> Result<Option<Reservation>> {
        queries::get_reservation_by_mac(&self.pool, mac).await
    }

    pub async fn get_reservation_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: &IpNetwork,
    ) -> Result<Option<Reservation>> {
        queries::get_reservation_by_ip(&self.pool, ip, subnet).await
    }

    pub async fn list_reservations(&self) -> Result<Vec<Reservation>> {
        queries::list_reservations(&self.pool).await
    }

    pub async fn create_reservation(&self, new: &NewReservation) -> Result<Reservation> {
        queries::create_reservation(&self.pool, new).await
    }

    pub async fn update_reservation(&self, new: &NewReservation) -> Result<Reservation> {
        queries::update_reservation(&self.pool, new).await
    }

    pub async fn delete_reservation(&self, mac: &MacAddress) -> Result<bool> {
        queries::delete_reservation(&self.pool, mac).await
    }

    pub async fn create_sync_log(
        &self,
        trigger: SyncTrigger,
        triggered_by: Option<&str>,
    ) -> Result<GitSyncLog> {
        queries::create_sync_log(&self.pool, trigger, triggered_by).await
    }

    pub async fn set_sync_commit(
        &self,
        id: Uuid,
        hash: &str,
        message: &str,
        author: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        queries::set_sync_commit(&self.pool, id, hash, message, author, timestamp).await
    }

    pub async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: SyncStatus,
        error_message: Option<&str>,
        changes_applied: Option<&serde_json::Value>,
    ) -> Result<()> {
        queries::finalize_sync_log(&self.pool, id, status, error_message, changes_applied).await
    }

    pub async fn get_active_config(&self) -> Result<Option<ActiveConfig>> {
        queries::get_active_config(&self.pool).await
    }

    pub async fn set_active_config(&self, commit_hash: &str, config_text: &str) -> Result<()> {
        queries::set_active_config(&self.pool, commit_hash, config_text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn lock_key_is_deterministic() {
        let subnet = net("192.168.1.0/24");
        let ip = Ipv4Addr::new(192, 168, 1, 100);
        assert_eq!(
            allocation_lock_key(&subnet, ip),
            allocation_lock_key(&subnet, ip)
        );
    }

    #[test]
    fn lock_key_differs_per_ip_and_subnet() {
        let subnet = net("192.168.1.0/24");
        let a = allocation_lock_key(&subnet, Ipv4Addr::new(192, 168, 1, 100));
        let b = allocation_lock_key(&subnet, Ipv4Addr::new(192, 168, 1, 101));
        assert_ne!(a, b);

        let other = net("10.0.0.0/24");
        let c = allocation_lock_key(&other, Ipv4Addr::new(192, 168, 1, 100));
        assert_ne!(a, c);
    }

    #[test]
    fn lock_key_matches_fnv_reference() {
        // FNV-1a of the empty input is the offset basis; one zero byte folds
        // the basis once. Guards the constants against typos.
        let mut hash = FNV_OFFSET_BASIS;
        hash ^= 0u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        assert_eq!(hash, 0xaf63_bd4c_8601_b7df);
    }
}
