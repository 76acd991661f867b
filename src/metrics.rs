//! Server statistics. Counters and gauges are registered with the default
//! prometheus registry; exposing them over HTTP is a collaborator's job.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    pub static ref PACKETS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "dhcp_packets_received_total",
        "DHCP packets received, by message type",
        &["message_type"]
    )
    .unwrap();
    pub static ref REPLIES_SENT: IntCounterVec = register_int_counter_vec!(
        "dhcp_replies_sent_total",
        "DHCP replies sent, by message type",
        &["message_type"]
    )
    .unwrap();
    pub static ref ALLOCATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "dhcp_allocation_errors_total",
        "Failed allocation attempts, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref NAKS_SENT: IntCounter = register_int_counter!(
        "dhcp_nak_total",
        "NAK replies sent"
    )
    .unwrap();
    pub static ref LEASES_EXPIRED: IntCounter = register_int_counter!(
        "lease_expired_total",
        "Leases transitioned to expired by the sweeper"
    )
    .unwrap();
    pub static ref GIT_SYNCS: IntCounterVec = register_int_counter_vec!(
        "git_sync_total",
        "Configuration sync attempts, by outcome",
        &["status"]
    )
    .unwrap();
    pub static ref ACTIVE_LEASES: IntGauge = register_int_gauge!(
        "active_leases",
        "Active leases currently in the store"
    )
    .unwrap();
}

pub const REASON_POOL_EXHAUSTED: &str = "pool_exhausted";
pub const REASON_STORAGE: &str = "storage";
pub const REASON_CONFLICT: &str = "conflict";
