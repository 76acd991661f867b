use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Lifecycle state of a lease row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Expired,
    Released,
    Declined,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Active => "active",
            LeaseState::Expired => "expired",
            LeaseState::Released => "released",
            LeaseState::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LeaseState::Active),
            "expired" => Some(LeaseState::Expired),
            "released" => Some(LeaseState::Released),
            "declined" => Some(LeaseState::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    pub hostname: Option<String>,
    pub subnet: IpNetwork,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: LeaseState,
    pub client_id: Option<String>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
    pub allocated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column values for a lease the allocator is about to write. The store
/// fills in the surrogate id and row timestamps.
#[derive(Debug, Clone)]
pub struct NewLease {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    pub hostname: Option<String>,
    pub subnet: IpNetwork,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_id: Option<String>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
    pub allocated_by: Option<String>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active && !self.is_expired()
    }

    pub fn mac_string(&self) -> String {
        canonical_mac(&self.mac)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub subnet: IpNetwork,
    pub description: Option<String>,
    pub tftp_server: Option<String>,
    pub boot_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn mac_string(&self) -> String {
        canonical_mac(&self.mac)
    }
}

/// Column values for a reservation about to be written by the sync pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReservation {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub subnet: IpNetwork,
    pub description: Option<String>,
    pub tftp_server: Option<String>,
    pub boot_filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SyncStatus::InProgress),
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Poll,
    Manual,
    Startup,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Poll => "poll",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Startup => "startup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poll" => Some(SyncTrigger::Poll),
            "manual" => Some(SyncTrigger::Manual),
            "startup" => Some(SyncTrigger::Startup),
            _ => None,
        }
    }
}

/// One row per sync attempt, created before the pull and finalized with the
/// outcome and a change summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSyncLog {
    pub id: Uuid,
    pub sync_started_at: DateTime<Utc>,
    pub sync_completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub changes_applied: Option<serde_json::Value>,
    pub trigger: SyncTrigger,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConfig {
    pub commit_hash: String,
    pub applied_at: DateTime<Utc>,
    pub config_text: String,
}

/// Canonical lowercase colon form, e.g. `aa:bb:cc:00:11:22`. All MAC
/// comparisons and log lines go through this form.
pub fn canonical_mac(mac: &MacAddress) -> String {
    mac.bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn mac_from_wire(chaddr: &[u8]) -> MacAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&chaddr[..6]);
    MacAddress::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_mac_is_lowercase_colon() {
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]);
        assert_eq!(canonical_mac(&mac), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn mac_from_wire_takes_first_six_bytes() {
        let chaddr = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0xFF, 0xFF];
        assert_eq!(canonical_mac(&mac_from_wire(&chaddr)), "de:ad:be:ef:00:01");
    }

    #[test]
    fn state_round_trip() {
        for state in [
            LeaseState::Active,
            LeaseState::Expired,
            LeaseState::Released,
            LeaseState::Declined,
        ] {
            assert_eq!(LeaseState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LeaseState::parse("bogus"), None);
    }

    #[test]
    fn trigger_round_trip() {
        for trigger in [SyncTrigger::Poll, SyncTrigger::Manual, SyncTrigger::Startup] {
            assert_eq!(SyncTrigger::parse(trigger.as_str()), Some(trigger));
        }
    }
}
