// SQL for the lease store. Runtime queries, not compile-time checked macros,
// so the crate builds without a live database.

use crate::database::models::{
    ActiveConfig, GitSyncLog, Lease, LeaseState, NewLease, NewReservation, Reservation,
    SyncStatus, SyncTrigger,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

fn ipv4_col(row: &PgRow, col: &str) -> Result<Ipv4Addr> {
    match row.get::<IpAddr, _>(col) {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(Error::StorageUnavailable(sqlx::Error::Decode(
            format!("column {col} holds IPv6 address {ip}").into(),
        ))),
    }
}

fn lease_from_row(row: &PgRow) -> Result<Lease> {
    let state: String = row.get("state");
    let state = LeaseState::parse(&state).ok_or_else(|| {
        Error::StorageUnavailable(sqlx::Error::Decode(
            format!("unknown lease state {state:?}").into(),
        ))
    })?;

    Ok(Lease {
        id: row.get("id"),
        ip: ipv4_col(row, "ip")?,
        mac: row.get("mac"),
        hostname: row.get("hostname"),
        subnet: row.get("subnet"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        last_seen: row.get("last_seen"),
        state,
        client_id: row.get("client_id"),
        vendor_class: row.get("vendor_class"),
        user_class: row.get("user_class"),
        allocated_by: row.get("allocated_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    Ok(Reservation {
        id: row.get("id"),
        mac: row.get("mac"),
        ip: ipv4_col(row, "ip")?,
        hostname: row.get("hostname"),
        subnet: row.get("subnet"),
        description: row.get("description"),
        tftp_server: row.get("tftp_server"),
        boot_filename: row.get("boot_filename"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<GitSyncLog> {
    let status: String = row.get("status");
    let status = SyncStatus::parse(&status).ok_or_else(|| {
        Error::StorageUnavailable(sqlx::Error::Decode(
            format!("unknown sync status {status:?}").into(),
        ))
    })?;
    let trigger: String = row.get("trigger");
    let trigger = SyncTrigger::parse(&trigger).ok_or_else(|| {
        Error::StorageUnavailable(sqlx::Error::Decode(
            format!("unknown sync trigger {trigger:?}").into(),
        ))
    })?;

    Ok(GitSyncLog {
        id: row.get("id"),
        sync_started_at: row.get("sync_started_at"),
        sync_completed_at: row.get("sync_completed_at"),
        status,
        commit_hash: row.get("commit_hash"),
        commit_message: row.get("commit_message"),
        commit_author: row.get("commit_author"),
        commit_timestamp: row.get("commit_timestamp"),
        error_message: row.get("error_message"),
        changes_applied: row.get("changes_applied"),
        trigger,
        triggered_by: row.get("triggered_by"),
    })
}

pub async fn get_lease_by_mac(
    pool: &PgPool,
    mac: &MacAddress,
    subnet: &IpNetwork,
) -> Result<Option<Lease>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM leases
        WHERE mac = $1 AND subnet = $2 AND state = 'active'
        ORDER BY issued_at DESC
        LIMIT 1
        "#,
    )
    .bind(mac)
    .bind(subnet)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(lease_from_row).transpose()
}

pub async fn get_lease_by_ip(
    pool: &PgPool,
    ip: Ipv4Addr,
    subnet: &IpNetwork,
) -> Result<Option<Lease>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM leases
        WHERE ip = $1 AND subnet = $2
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .bind(IpAddr::V4(ip))
    .bind(subnet)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(lease_from_row).transpose()
}

pub async fn create_lease(pool: &PgPool, new: &NewLease) -> Result<Lease> {
    let row = sqlx::query(
        r#"
        INSERT INTO leases (
            id, ip, mac, hostname, subnet,
            issued_at, expires_at, last_seen, state,
            client_id, vendor_class, user_class, allocated_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), 'active', $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(IpAddr::V4(new.ip))
    .bind(new.mac)
    .bind(&new.hostname)
    .bind(new.subnet)
    .bind(new.issued_at)
    .bind(new.expires_at)
    .bind(&new.client_id)
    .bind(&new.vendor_class)
    .bind(&new.user_class)
    .bind(&new.allocated_by)
    .fetch_one(pool)
    .await?;

    lease_from_row(&row)
}

pub async fn update_lease(pool: &PgPool, lease: &Lease) -> Result<Lease> {
    let row = sqlx::query(
        r#"
        UPDATE leases SET
            mac = $2,
            hostname = $3,
            issued_at = $4,
            expires_at = $5,
            last_seen = $6,
            state = $7,
            client_id = $8,
            vendor_class = $9,
            user_class = $10,
            allocated_by = $11,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(lease.id)
    .bind(lease.mac)
    .bind(&lease.hostname)
    .bind(lease.issued_at)
    .bind(lease.expires_at)
    .bind(lease.last_seen)
    .bind(lease.state.as_str())
    .bind(&lease.client_id)
    .bind(&lease.vendor_class)
    .bind(&lease.user_class)
    .bind(&lease.allocated_by)
    .fetch_one(pool)
    .await?;

    lease_from_row(&row)
}

pub async fn renew_lease(pool: &PgPool, id: Uuid, new_expiry: DateTime<Utc>) -> Result<Lease> {
    let row = sqlx::query(
        r#"
        UPDATE leases SET
            state = 'active',
            expires_at = $2,
            last_seen = NOW(),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(new_expiry)
    .fetch_one(pool)
    .await?;

    lease_from_row(&row)
}

async fn transition_lease(
    pool: &PgPool,
    ip: Ipv4Addr,
    subnet: &IpNetwork,
    to_state: LeaseState,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE leases SET state = $3, updated_at = NOW()
        WHERE ip = $1 AND subnet = $2 AND state = 'active'
        "#,
    )
    .bind(IpAddr::V4(ip))
    .bind(subnet)
    .bind(to_state.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn release_lease(pool: &PgPool, ip: Ipv4Addr, subnet: &IpNetwork) -> Result<bool> {
    transition_lease(pool, ip, subnet, LeaseState::Released).await
}

pub async fn decline_lease(pool: &PgPool, ip: Ipv4Addr, subnet: &IpNetwork) -> Result<bool> {
    transition_lease(pool, ip, subnet, LeaseState::Declined).await
}

/// LRU candidates: terminated rows inside the range, least-recently-expired
/// first. Declined rows are deliberately not part of this set.
pub async fn get_expired_leases(
    pool: &PgPool,
    subnet: &IpNetwork,
    range_start: Ipv4Addr,
    range_end: Ipv4Addr,
    limit: i64,
) -> Result<Vec<Lease>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM leases
        WHERE subnet = $1
            AND ip >= $2 AND ip <= $3
            AND state IN ('expired', 'released')
        ORDER BY expires_at ASC
        LIMIT $4
        "#,
    )
    .bind(subnet)
    .bind(IpAddr::V4(range_start))
    .bind(IpAddr::V4(range_end))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(lease_from_row).collect()
}

pub async fn expire_old(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE leases SET state = 'expired', updated_at = NOW()
        WHERE state = 'active' AND expires_at < NOW()
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_old(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM leases
        WHERE state IN ('expired', 'released') AND updated_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn count_active_leases(pool: &PgPool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM leases WHERE state = 'active'")
        .fetch_one(pool)
        .await?;
    Ok(row.get("count"))
}

pub async fn get_reservation_by_mac(
    pool: &PgPool,
    mac: &MacAddress,
) -> Result<Option<Reservation>> {
    let row = sqlx::query("SELECT * FROM reservations WHERE mac = $1")
        .bind(mac)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(reservation_from_row).transpose()
}

pub async fn get_reservation_by_ip(
    pool: &PgPool,
    ip: Ipv4Addr,
    subnet: &IpNetwork,
) -> Result<Option<Reservation>> {
    let row = sqlx::query("SELECT * FROM reservations WHERE ip = $1 AND subnet = $2")
        .bind(IpAddr::V4(ip))
        .bind(subnet)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(reservation_from_row).transpose()
}

pub async fn list_reservations(pool: &PgPool) -> Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations ORDER BY mac")
        .fetch_all(pool)
        .await?;

    rows.iter().map(reservation_from_row).collect()
}

pub async fn create_reservation(pool: &PgPool, new: &NewReservation) -> Result<Reservation> {
    let row = sqlx::query(
        r#"
        INSERT INTO reservations (
            id, mac, ip, hostname, subnet, description, tftp_server, boot_filename
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.mac)
    .bind(IpAddr::V4(new.ip))
    .bind(&new.hostname)
    .bind(new.subnet)
    .bind(&new.description)
    .bind(&new.tftp_server)
    .bind(&new.boot_filename)
    .fetch_one(pool)
    .await?;

    reservation_from_row(&row)
}

pub async fn update_reservation(pool: &PgPool, new: &NewReservation) -> Result<Reservation> {
    let row = sqlx::query(
        r#"
        UPDATE reservations SET
            ip = $2,
            hostname = $3,
            subnet = $4,
            description = $5,
            tftp_server = $6,
            boot_filename = $7,
            updated_at = NOW()
        WHERE mac = $1
        RETURNING *
        "#,
    )
    .bind(new.mac)
    .bind(IpAddr::V4(new.ip))
    .bind(&new.hostname)
    .bind(new.subnet)
    .bind(&new.description)
    .bind(&new.tftp_server)
    .bind(&new.boot_filename)
    .fetch_one(pool)
    .await?;

    reservation_from_row(&row)
}

pub async fn delete_reservation(pool: &PgPool, mac: &MacAddress) -> Result<bool> {
    let result = sqlx::query("DELETE FROM reservations WHERE mac = $1")
        .bind(mac)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn create_sync_log(
    pool: &PgPool,
    trigger: SyncTrigger,
    triggered_by: Option<&str>,
) -> Result<GitSyncLog> {
    let row = sqlx::query(
        r#"
        INSERT INTO git_sync_log (id, sync_started_at, status, trigger, triggered_by)
        VALUES ($1, NOW(), 'in_progress', $2, $3)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(trigger.as_str())
    .bind(triggered_by)
    .fetch_one(pool)
    .await?;

    sync_log_from_row(&row)
}

pub async fn set_sync_commit(
    pool: &PgPool,
    id: Uuid,
    hash: &str,
    message: &str,
    author: &str,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE git_sync_log SET
            commit_hash = $2,
            commit_message = $3,
            commit_author = $4,
            commit_timestamp = $5
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(hash)
    .bind(message)
    .bind(author)
    .bind(timestamp)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn finalize_sync_log(
    pool: &PgPool,
    id: Uuid,
    status: SyncStatus,
    error_message: Option<&str>,
    changes_applied: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE git_sync_log SET
            status = $2,
            sync_completed_at = NOW(),
            error_message = $3,
            changes_applied = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(error_message)
    .bind(changes_applied)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_active_config(pool: &PgPool) -> Result<Option<ActiveConfig>> {
    let row = sqlx::query("SELECT commit_hash, applied_at, config_text FROM active_config WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| ActiveConfig {
        commit_hash: row.get("commit_hash"),
        applied_at: row.get("applied_at"),
        config_text: row.get("config_text"),
    }))
}

pub async fn set_active_config(pool: &PgPool, commit_hash: &str, config_text: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO active_config (id, commit_hash, applied_at, config_text)
        VALUES (1, $1, NOW(), $2)
        ON CONFLICT (id)
        DO UPDATE SET commit_hash = $1, applied_at = NOW(), config_text = $2
        "#,
    )
    .bind(commit_hash)
    .bind(config_text)
    .execute(pool)
    .await?;

    Ok(())
}
