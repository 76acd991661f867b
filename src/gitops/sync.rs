use crate::config::Settings;
use crate::database::models::{GitSyncLog, NewReservation, Reservation, SyncStatus, SyncTrigger};
use crate::dhcp::subnet::SubnetTable;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::gitops::repo::GitRepository;
use crate::metrics;
use crate::store::LeaseStore;
use futures::future::BoxFuture;
use ipnetwork::{IpNetwork, Ipv4Network};
use mac_address::MacAddress;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Callback invoked with the new runtime subnets once a pulled configuration
/// has been validated and applied. Must be safe to call from concurrent
/// syncs.
pub type ReloadFn = Arc<dyn Fn(SubnetTable) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Reservation deltas between the store and a desired configuration.
#[derive(Debug, Default)]
pub struct ReservationChanges {
    pub added: Vec<NewReservation>,
    pub updated: Vec<NewReservation>,
    pub deleted: Vec<MacAddress>,
}

/// Pulls the repository, validates the configuration it carries, applies
/// reservation changes and reloads the server, with one audit row per
/// attempt.
pub struct SyncService {
    store: Arc<LeaseStore>,
    repo: GitRepository,
    config_path: String,
    sync_timeout: Duration,
    validate_before_sync: bool,
    reload: ReloadFn,
    events: Arc<EventBus>,
    current_commit: Mutex<Option<String>>,
}

impl SyncService {
    pub fn new(
        store: Arc<LeaseStore>,
        repo: GitRepository,
        config_path: String,
        sync_timeout: Duration,
        validate_before_sync: bool,
        reload: ReloadFn,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            repo,
            config_path,
            sync_timeout,
            validate_before_sync,
            reload,
            events,
            current_commit: Mutex::new(None),
        }
    }

    /// One sync attempt. The audit row is always finalized, success or not.
    pub async fn sync(&self, trigger: SyncTrigger, user: Option<&str>) -> Result<()> {
        let log = self.store.create_sync_log(trigger, user).await?;
        info!("config sync started ({})", trigger.as_str());

        match self.run_sync(&log).await {
            Ok(Some(changes)) => {
                self.finalize(&log, SyncStatus::Success, None, Some(&changes)).await;
                info!("config sync applied: {}", changes);
                Ok(())
            }
            Ok(None) => {
                self.finalize(&log, SyncStatus::Success, None, Some(&json!({}))).await;
                info!("config sync: no changes");
                Ok(())
            }
            Err(e) => {
                warn!("config sync failed: {}", e);
                self.finalize(&log, SyncStatus::Failed, Some(&e.to_string()), None).await;
                Err(e)
            }
        }
    }

    async fn run_sync(&self, log: &GitSyncLog) -> Result<Option<serde_json::Value>> {
        let repo = self.repo.clone();
        let pulled = tokio::time::timeout(
            self.sync_timeout,
            tokio::task::spawn_blocking(move || repo.pull()),
        )
        .await;

        let (commit, has_changes) = match pulled {
            Err(_) => return Err(Error::Git(git2::Error::from_str("pull timed out"))),
            Ok(Err(join_err)) => {
                return Err(Error::Git(git2::Error::from_str(&join_err.to_string())))
            }
            Ok(Ok(result)) => result?,
        };

        self.store
            .set_sync_commit(
                log.id,
                &commit.hash,
                &commit.message,
                &commit.author,
                commit.timestamp,
            )
            .await?;

        // The last applied commit survives restarts in active_config; the
        // in-memory copy just saves a query on the steady-state path.
        let mut last_known = self.current_commit.lock().await.clone();
        if last_known.is_none() {
            last_known = self
                .store
                .get_active_config()
                .await?
                .map(|c| c.commit_hash);
        }
        if !has_changes && last_known.as_deref() == Some(commit.hash.as_str()) {
            return Ok(None);
        }

        let config_file = self.repo.file_path(&self.config_path);
        let config_text = tokio::fs::read_to_string(&config_file).await.map_err(|e| {
            Error::ValidationFailed(format!("cannot read {}: {e}", config_file.display()))
        })?;
        let settings = Settings::from_toml_str(&config_text)?;
        if self.validate_before_sync {
            settings.validate()?;
        }

        let desired = desired_reservations(&settings)?;
        let current = self.store.list_reservations().await?;
        let changes = diff_reservations(&current, &desired);
        let (added, updated, deleted) = (
            changes.added.len(),
            changes.updated.len(),
            changes.deleted.len(),
        );

        for reservation in &changes.added {
            self.store.create_reservation(reservation).await?;
        }
        for reservation in &changes.updated {
            self.store.update_reservation(reservation).await?;
        }
        for mac in &changes.deleted {
            self.store.delete_reservation(mac).await?;
        }

        // Reservation writes above are already committed; a reload failure
        // leaves them in place and the next successful sync re-converges.
        let table = SubnetTable::from_settings(&settings)?;
        let total_subnets = table.len();
        (self.reload)(table)
            .await
            .map_err(|e| Error::ReloadFailed(e.to_string()))?;

        self.store
            .set_active_config(&commit.hash, &config_text)
            .await?;
        *self.current_commit.lock().await = Some(commit.hash.clone());

        Ok(Some(json!({
            "reservations_added": added,
            "reservations_updated": updated,
            "reservations_deleted": deleted,
            "total_subnets": total_subnets,
            "config_reloaded": true,
        })))
    }

    async fn finalize(
        &self,
        log: &GitSyncLog,
        status: SyncStatus,
        error_message: Option<&str>,
        changes: Option<&serde_json::Value>,
    ) {
        metrics::GIT_SYNCS
            .with_label_values(&[status.as_str()])
            .inc();
        self.events.publish(
            EventType::GitSync,
            format!("config sync {}", status.as_str()),
            json!({
                "status": status.as_str(),
                "trigger": log.trigger.as_str(),
                "error": error_message,
                "changes": changes,
            }),
        );
        if let Err(e) = self
            .store
            .finalize_sync_log(log.id, status, error_message, changes)
            .await
        {
            error!("could not finalize sync audit row {}: {}", log.id, e);
        }
    }
}

/// Flatten the configured reservations into store rows.
pub fn desired_reservations(settings: &Settings) -> Result<Vec<NewReservation>> {
    let mut out = Vec::new();
    for subnet in &settings.subnets {
        let network: ipnet::Ipv4Net = subnet
            .network
            .parse()
            .map_err(|e| Error::ValidationFailed(format!("subnet {}: {e}", subnet.network)))?;
        let cidr = IpNetwork::V4(
            Ipv4Network::new(network.network(), network.prefix_len())
                .map_err(|e| Error::ValidationFailed(format!("subnet {}: {e}", subnet.network)))?,
        );

        for reservation in &subnet.reservations {
            let mac: MacAddress = reservation.mac.parse().map_err(|_| {
                Error::ValidationFailed(format!("invalid reservation MAC {}", reservation.mac))
            })?;
            out.push(NewReservation {
                mac,
                ip: reservation.ip,
                hostname: reservation.hostname.clone(),
                subnet: cidr,
                description: reservation.description.clone(),
                tftp_server: reservation.boot.as_ref().and_then(|b| b.tftp_server.clone()),
                boot_filename: reservation.boot.as_ref().and_then(|b| b.filename.clone()),
            });
        }
    }
    Ok(out)
}

/// Diff by MAC: create what is missing, rewrite rows whose fields changed,
/// delete what the configuration no longer names.
pub fn diff_reservations(current: &[Reservation], desired: &[NewReservation]) -> ReservationChanges {
    let mut changes = ReservationChanges::default();
    let current_by_mac: HashMap<[u8; 6], &Reservation> =
        current.iter().map(|r| (r.mac.bytes(), r)).collect();
    let desired_macs: HashMap<[u8; 6], ()> =
        desired.iter().map(|r| (r.mac.bytes(), ())).collect();

    for want in desired {
        match current_by_mac.get(&want.mac.bytes()) {
            None => changes.added.push(want.clone()),
            Some(have) => {
                let same = have.ip == want.ip
                    && have.hostname == want.hostname
                    && have.subnet == want.subnet
                    && have.description == want.description
                    && have.tftp_server == want.tftp_server
                    && have.boot_filename == want.boot_filename;
                if !same {
                    changes.updated.push(want.clone());
                }
            }
        }
    }

    for have in current {
        if !desired_macs.contains_key(&have.mac.bytes()) {
            changes.deleted.push(have.mac);
        }
    }

    changes
}

/// Startup reconciliation for deployments without GitOps: the local
/// configuration is the source of truth for reservations, nothing else.
pub async fn apply_local_reservations(store: &LeaseStore, settings: &Settings) -> Result<()> {
    let desired = desired_reservations(settings)?;
    let current = store.list_reservations().await?;
    let changes = diff_reservations(&current, &desired);
    let summary = format!(
        "{} added, {} updated, {} deleted",
        changes.added.len(),
        changes.updated.len(),
        changes.deleted.len()
    );

    for reservation in &changes.added {
        store.create_reservation(reservation).await?;
    }
    for reservation in &changes.updated {
        store.update_reservation(reservation).await?;
    }
    for mac in &changes.deleted {
        store.delete_reservation(mac).await?;
    }

    info!("local reservation sync: {}", summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn cidr() -> IpNetwork {
        "192.168.1.0/24".parse().unwrap()
    }

    fn existing(mac: [u8; 6], ip: Ipv4Addr, hostname: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            mac: MacAddress::new(mac),
            ip,
            hostname: hostname.into(),
            subnet: cidr(),
            description: None,
            tftp_server: None,
            boot_filename: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn wanted(mac: [u8; 6], ip: Ipv4Addr, hostname: &str) -> NewReservation {
        NewReservation {
            mac: MacAddress::new(mac),
            ip,
            hostname: hostname.into(),
            subnet: cidr(),
            description: None,
            tftp_server: None,
            boot_filename: None,
        }
    }

    #[test]
    fn diff_detects_add_update_delete() {
        // store: {R1, R2}; config: {R1 with changed hostname, R3}
        let current = vec![
            existing([0xAA, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 1, 10), "r1"),
            existing([0xAA, 0, 0, 0, 0, 2], Ipv4Addr::new(192, 168, 1, 11), "r2"),
        ];
        let desired = vec![
            wanted([0xAA, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 1, 10), "r1-renamed"),
            wanted([0xAA, 0, 0, 0, 0, 3], Ipv4Addr::new(192, 168, 1, 12), "r3"),
        ];

        let changes = diff_reservations(&current, &desired);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].hostname, "r3");
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].hostname, "r1-renamed");
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].bytes(), [0xAA, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let current = vec![existing(
            [0xAA, 0, 0, 0, 0, 1],
            Ipv4Addr::new(192, 168, 1, 10),
            "r1",
        )];
        let desired = vec![wanted(
            [0xAA, 0, 0, 0, 0, 1],
            Ipv4Addr::new(192, 168, 1, 10),
            "r1",
        )];

        let changes = diff_reservations(&current, &desired);
        assert!(changes.added.is_empty());
        assert!(changes.updated.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn diff_sees_boot_field_change() {
        let current = vec![existing(
            [0xAA, 0, 0, 0, 0, 1],
            Ipv4Addr::new(192, 168, 1, 10),
            "r1",
        )];
        let mut want = wanted([0xAA, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 1, 10), "r1");
        want.tftp_server = Some("10.0.0.5".into());

        let changes = diff_reservations(&current, &[want]);
        assert_eq!(changes.updated.len(), 1);
    }

    #[test]
    fn removing_then_restoring_a_reservation_round_trips() {
        let r1 = wanted([0xAA, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 1, 10), "r1");

        // apply {r1} onto empty
        let first = diff_reservations(&[], std::slice::from_ref(&r1));
        assert_eq!(first.added.len(), 1);

        // apply {} onto {r1}
        let now_current = vec![existing(
            [0xAA, 0, 0, 0, 0, 1],
            Ipv4Addr::new(192, 168, 1, 10),
            "r1",
        )];
        let second = diff_reservations(&now_current, &[]);
        assert_eq!(second.deleted.len(), 1);

        // apply {r1} again onto empty
        let third = diff_reservations(&[], &[r1]);
        assert_eq!(third.added.len(), 1);
    }

    #[test]
    fn desired_reservations_flatten_config() {
        let toml = r#"
            [server]
            server_id = "dhcp-1"
            [database]
            connection = "postgres://x"

            [[subnets]]
            network = "192.168.1.0/24"
            gateway = "192.168.1.1"

            [[subnets.reservations]]
            mac = "aa:bb:cc:dd:ee:02"
            ip = "192.168.1.50"
            hostname = "pxe-node"
            [subnets.reservations.boot]
            tftp_server = "10.0.0.5"
            filename = "pxe.0"
        "#;
        let settings = Settings::from_toml_str(toml).unwrap();
        let desired = desired_reservations(&settings).unwrap();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(desired[0].subnet, cidr());
        assert_eq!(desired[0].tftp_server.as_deref(), Some("10.0.0.5"));
        assert_eq!(desired[0].boot_filename.as_deref(), Some("pxe.0"));
    }

    #[test]
    fn desired_reservations_reject_bad_mac() {
        let toml = r#"
            [server]
            server_id = "dhcp-1"
            [database]
            connection = "postgres://x"

            [[subnets]]
            network = "192.168.1.0/24"
            gateway = "192.168.1.1"

            [[subnets.reservations]]
            mac = "zz:zz"
            ip = "192.168.1.50"
        "#;
        let settings = Settings::from_toml_str(toml).unwrap();
        assert!(desired_reservations(&settings).is_err());
    }
}
