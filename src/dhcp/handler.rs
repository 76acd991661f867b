use crate::database::models::{canonical_mac, mac_from_wire, Lease, Reservation};
use crate::dhcp::allocator::{sanitize_field, AllocationRequest, Allocator};
use crate::dhcp::options::DhcpOptionsBuilder;
use crate::dhcp::packet::{DhcpPacket, MessageType};
use crate::dhcp::subnet::Subnet;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::metrics;
use crate::store::cache::LeaseCache;
use crate::store::LeaseStore;
use mac_address::MacAddress;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NAK_NO_IP_REQUESTED: &str = "No IP address requested";
pub const NAK_FOREIGN_OWNER: &str = "IP already allocated to another client";
pub const NAK_WRONG_SUBNET: &str = "Requested IP outside subnet";

/// Message-type state machine. The handler itself is stateless and
/// re-entrant; per-client state lives in the lease store only.
pub struct Handler {
    store: Arc<LeaseStore>,
    allocator: Allocator,
    cache: Option<Arc<LeaseCache>>,
    events: Arc<EventBus>,
}

impl Handler {
    pub fn new(
        store: Arc<LeaseStore>,
        allocator: Allocator,
        cache: Option<Arc<LeaseCache>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            allocator,
            cache,
            events,
        }
    }

    /// Dispatch one packet. `Ok(None)` means "no reply"; DHCP clients
    /// tolerate drops, so most failures end here rather than in an error.
    pub async fn handle(&self, packet: &DhcpPacket, subnet: &Subnet) -> Result<Option<DhcpPacket>> {
        let msg_type = match packet.message_type() {
            Some(t) => t,
            None => {
                debug!("packet without message type option, dropping");
                return Ok(None);
            }
        };
        metrics::PACKETS_RECEIVED
            .with_label_values(&[msg_type.as_str()])
            .inc();

        match msg_type {
            MessageType::Discover => self.handle_discover(packet, subnet).await,
            MessageType::Request => self.handle_request(packet, subnet).await,
            MessageType::Release => self.handle_release(packet, subnet).await,
            MessageType::Decline => self.handle_decline(packet, subnet).await,
            MessageType::Inform => self.handle_inform(packet, subnet).await,
            other => {
                debug!("ignoring DHCP message type {:?}", other);
                Ok(None)
            }
        }
    }

    async fn handle_discover(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
    ) -> Result<Option<DhcpPacket>> {
        let mac = mac_from_wire(&packet.chaddr);
        let mac_str = canonical_mac(&mac);
        info!("DISCOVER from {}", mac_str);
        self.publish_dhcp(EventType::DhcpDiscover, &mac_str, None, subnet);

        let req = allocation_request(packet, subnet);
        let lease = match self.allocator.allocate(subnet, &req).await {
            Ok(lease) => lease,
            Err(Error::PoolExhausted { subnet: s }) => {
                warn!("no address available for {} in {}", mac_str, s);
                metrics::ALLOCATION_ERRORS
                    .with_label_values(&[metrics::REASON_POOL_EXHAUSTED])
                    .inc();
                return Ok(None);
            }
            Err(e) if e.is_transient() => {
                warn!("storage unavailable during DISCOVER from {}: {}", mac_str, e);
                metrics::ALLOCATION_ERRORS
                    .with_label_values(&[metrics::REASON_STORAGE])
                    .inc();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let reservation = self.reservation_for(packet, subnet).await;
        let mut reply = packet.build_reply(MessageType::Offer, subnet.gateway);
        reply.yiaddr = lease.ip;
        add_dhcp_options(&mut reply, subnet, reservation.as_ref(), subnet.lease_duration);

        info!("OFFER {} to {}", lease.ip, mac_str);
        self.publish_dhcp(EventType::DhcpOffer, &mac_str, Some(lease.ip), subnet);
        Ok(Some(reply))
    }

    async fn handle_request(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
    ) -> Result<Option<DhcpPacket>> {
        let mac = mac_from_wire(&packet.chaddr);
        let mac_str = canonical_mac(&mac);
        self.publish_dhcp(EventType::DhcpRequest, &mac_str, None, subnet);

        let requested = match requested_ip(packet) {
            Some(ip) => ip,
            None => {
                warn!("REQUEST from {} names no IP", mac_str);
                return Ok(Some(self.nak(packet, subnet, &mac_str, NAK_NO_IP_REQUESTED)));
            }
        };
        info!("REQUEST from {} for {}", mac_str, requested);

        if !subnet.contains(requested) {
            warn!(
                "REQUEST from {} for {} outside subnet {}",
                mac_str,
                requested,
                subnet.cidr_string()
            );
            return Ok(Some(self.nak(packet, subnet, &mac_str, NAK_WRONG_SUBNET)));
        }

        // Cache fast path: an apparent renewal skips the store read. The
        // probe is never authoritative; `renew` re-checks the owner against
        // the store under the per-IP lock, and any failure falls back to
        // the store path below.
        if self.cached_renewal(&mac, requested).is_some() {
            match self
                .allocator
                .renew(&mac, requested, subnet, subnet.lease_duration)
                .await
            {
                Ok(lease) => return self.ack(packet, subnet, &mac_str, lease.ip).await,
                Err(e) => {
                    debug!("renewal fast path for {} fell back to store: {}", requested, e)
                }
            }
        }

        let row = match self.store.get_lease_by_ip(requested, &subnet.cidr).await {
            Ok(row) => row,
            Err(e) if e.is_transient() => {
                warn!("storage unavailable during REQUEST from {}: {}", mac_str, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let lease = match row {
            Some(row) if row.mac == mac => {
                match self
                    .allocator
                    .renew(&mac, requested, subnet, subnet.lease_duration)
                    .await
                {
                    Ok(lease) => lease,
                    Err(Error::MacMismatch { owner, .. }) => {
                        warn!("{} raced away from {} (now {})", requested, mac_str, owner);
                        return Ok(Some(self.nak(packet, subnet, &mac_str, NAK_FOREIGN_OWNER)));
                    }
                    Err(e) if e.is_transient() => {
                        warn!("storage unavailable renewing {}: {}", requested, e);
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(row) => {
                warn!(
                    "REQUEST from {} for {} held by {}",
                    mac_str,
                    requested,
                    row.mac_string()
                );
                return Ok(Some(self.nak(packet, subnet, &mac_str, NAK_FOREIGN_OWNER)));
            }
            None => {
                let req = allocation_request(packet, subnet);
                match self.allocator.allocate(subnet, &req).await {
                    Ok(lease) => {
                        if lease.ip != requested {
                            // Kept as a warning only; the client gets what
                            // the ladder produced.
                            warn!(
                                "REQUEST from {} asked {} but allocator returned {}",
                                mac_str, requested, lease.ip
                            );
                        }
                        lease
                    }
                    Err(Error::PoolExhausted { subnet: s }) => {
                        warn!("no address available for {} in {}", mac_str, s);
                        metrics::ALLOCATION_ERRORS
                            .with_label_values(&[metrics::REASON_POOL_EXHAUSTED])
                            .inc();
                        return Ok(None);
                    }
                    Err(e) if e.is_transient() => {
                        warn!("storage unavailable during REQUEST from {}: {}", mac_str, e);
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.ack(packet, subnet, &mac_str, lease.ip).await
    }

    async fn ack(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
        mac_str: &str,
        ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let reservation = self.reservation_for(packet, subnet).await;
        let mut reply = packet.build_reply(MessageType::Ack, subnet.gateway);
        reply.yiaddr = ip;
        add_dhcp_options(&mut reply, subnet, reservation.as_ref(), subnet.lease_duration);

        info!("ACK {} to {}", ip, mac_str);
        self.publish_dhcp(EventType::DhcpAck, mac_str, Some(ip), subnet);
        Ok(Some(reply))
    }

    /// Dual-keyed cache probe for the renewal fast path. A hit only routes
    /// the request into `renew`; ownership is always re-asserted against
    /// the store.
    fn cached_renewal(&self, mac: &MacAddress, requested: Ipv4Addr) -> Option<Lease> {
        let cache = self.cache.as_ref()?;
        cache
            .get_by_ip(requested)
            .or_else(|| cache.get_by_mac(mac))
            .filter(|l| l.mac == *mac && l.ip == requested && l.is_active())
    }

    async fn handle_release(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
    ) -> Result<Option<DhcpPacket>> {
        let mac_str = canonical_mac(&mac_from_wire(&packet.chaddr));
        let ip = packet.ciaddr;
        if ip.is_unspecified() {
            warn!("RELEASE from {} without an address", mac_str);
            return Ok(None);
        }

        info!("RELEASE of {} from {}", ip, mac_str);
        match self.allocator.release(ip, subnet).await {
            Ok(true) => self.publish_dhcp(EventType::DhcpRelease, &mac_str, Some(ip), subnet),
            Ok(false) => debug!("RELEASE of {} matched no active lease", ip),
            Err(e) => warn!("release of {} failed: {}", ip, e),
        }
        Ok(None)
    }

    async fn handle_decline(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
    ) -> Result<Option<DhcpPacket>> {
        let mac_str = canonical_mac(&mac_from_wire(&packet.chaddr));
        let ip = match packet.requested_ip() {
            Some(ip) => ip,
            None => {
                warn!("DECLINE from {} without a requested IP", mac_str);
                return Ok(None);
            }
        };

        // A declined address stays out of the expired/released pool the LRU
        // scan draws from, so it is not re-offered immediately.
        warn!("DECLINE of {} from {}", ip, mac_str);
        match self.allocator.decline(ip, subnet).await {
            Ok(_) => self.publish_dhcp(EventType::DhcpDecline, &mac_str, Some(ip), subnet),
            Err(e) => warn!("decline of {} failed: {}", ip, e),
        }
        Ok(None)
    }

    async fn handle_inform(
        &self,
        packet: &DhcpPacket,
        subnet: &Subnet,
    ) -> Result<Option<DhcpPacket>> {
        let mac_str = canonical_mac(&mac_from_wire(&packet.chaddr));
        info!("INFORM from {}", mac_str);

        let reservation = self.reservation_for(packet, subnet).await;
        let mut reply = packet.build_reply(MessageType::Ack, subnet.gateway);
        reply.yiaddr = Ipv4Addr::UNSPECIFIED;
        add_dhcp_options(&mut reply, subnet, reservation.as_ref(), subnet.lease_duration);

        self.publish_dhcp(EventType::DhcpAck, &mac_str, None, subnet);
        Ok(Some(reply))
    }

    fn nak(&self, packet: &DhcpPacket, subnet: &Subnet, mac_str: &str, message: &str) -> DhcpPacket {
        let mut reply = packet.build_reply(MessageType::Nak, subnet.gateway);
        for option in DhcpOptionsBuilder::new()
            .server_id(subnet.gateway)
            .message(message)
            .build()
        {
            reply.set_option(option.code, option.data);
        }
        metrics::NAKS_SENT.inc();
        self.publish_dhcp(EventType::DhcpNak, mac_str, None, subnet);
        reply
    }

    /// Reservation for the packet's MAC when one exists in this subnet;
    /// lookup failures degrade to "no reservation" since only PXE overrides
    /// hang off it.
    async fn reservation_for(&self, packet: &DhcpPacket, subnet: &Subnet) -> Option<Reservation> {
        let mac = mac_from_wire(&packet.chaddr);
        match self.store.get_reservation_by_mac(&mac).await {
            Ok(Some(r)) if r.subnet == subnet.cidr => Some(r),
            Ok(_) => None,
            Err(e) => {
                warn!("reservation lookup for {} failed: {}", canonical_mac(&mac), e);
                None
            }
        }
    }

    fn publish_dhcp(&self, event_type: EventType, mac: &str, ip: Option<Ipv4Addr>, subnet: &Subnet) {
        let message = match ip {
            Some(ip) => format!("{mac} {ip}"),
            None => mac.to_string(),
        };
        self.events.publish(
            event_type,
            message,
            json!({
                "mac": mac,
                "ip": ip.map(|ip| ip.to_string()),
                "subnet": subnet.cidr_string(),
            }),
        );
        if let Some(reply_type) = match event_type {
            EventType::DhcpOffer => Some("offer"),
            EventType::DhcpAck => Some("ack"),
            EventType::DhcpNak => Some("nak"),
            _ => None,
        } {
            metrics::REPLIES_SENT.with_label_values(&[reply_type]).inc();
        }
    }
}

/// Requested address: option 50 when present, else a non-zero `ciaddr`.
pub fn requested_ip(packet: &DhcpPacket) -> Option<Ipv4Addr> {
    packet
        .requested_ip()
        .or_else(|| (!packet.ciaddr.is_unspecified()).then_some(packet.ciaddr))
}

fn allocation_request(packet: &DhcpPacket, subnet: &Subnet) -> AllocationRequest {
    AllocationRequest {
        mac: mac_from_wire(&packet.chaddr),
        hostname: packet.hostname_raw().map(sanitize_field),
        lease_duration: subnet.lease_duration,
        client_id: packet.client_id_raw().map(sanitize_field),
        vendor_class: packet.vendor_class_raw().map(sanitize_field),
        user_class: packet.user_class_raw().map(sanitize_field),
    }
}

/// The standard reply option set. TFTP server and bootfile come from the
/// subnet's boot block, overridden per-field by the client's reservation.
pub fn add_dhcp_options(
    reply: &mut DhcpPacket,
    subnet: &Subnet,
    reservation: Option<&Reservation>,
    lease_secs: u32,
) {
    let mut builder = DhcpOptionsBuilder::new()
        .lease_time(lease_secs)
        .renewal_time(lease_secs / 2)
        .rebind_time(lease_secs * 7 / 8)
        .subnet_mask(subnet.subnet_mask())
        .server_id(subnet.gateway);

    if !subnet.gateway.is_unspecified() {
        builder = builder.router(subnet.gateway);
    }
    if !subnet.dns_servers.is_empty() {
        builder = builder.dns_servers(&subnet.dns_servers);
    }
    if let Some(domain) = subnet.options.get("domain_name") {
        builder = builder.domain_name(domain);
    }

    let subnet_boot = subnet.boot.as_ref();
    let tftp = reservation
        .and_then(|r| r.tftp_server.clone())
        .or_else(|| subnet_boot.and_then(|b| b.tftp_server.clone()));
    let bootfile = reservation
        .and_then(|r| r.boot_filename.clone())
        .or_else(|| subnet_boot.and_then(|b| b.filename.clone()));
    if let Some(tftp) = &tftp {
        builder = builder.tftp_server(tftp);
    }
    if let Some(bootfile) = &bootfile {
        builder = builder.bootfile(bootfile);
    }

    for option in builder.build() {
        reply.set_option(option.code, option.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::options;
    use crate::dhcp::subnet::{BootInfo, Pool};
    use chrono::Utc;
    use ipnet::Ipv4Net;
    use ipnetwork::{IpNetwork, Ipv4Network};
    use mac_address::MacAddress;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_subnet() -> Subnet {
        let network: Ipv4Net = "192.168.1.0/24".parse().unwrap();
        Subnet {
            network,
            cidr: IpNetwork::V4(
                Ipv4Network::new(network.network(), network.prefix_len()).unwrap(),
            ),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            lease_duration: 3600,
            max_lease_duration: 86_400,
            options: HashMap::from([("domain_name".to_string(), "lab.example".to_string())]),
            boot: Some(BootInfo {
                tftp_server: Some("10.0.0.1".into()),
                filename: Some("default.0".into()),
            }),
            pools: vec![Pool {
                range_start: Ipv4Addr::new(192, 168, 1, 100),
                range_end: Ipv4Addr::new(192, 168, 1, 110),
            }],
        }
    }

    fn test_reservation(subnet: &Subnet) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            mac: MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]),
            ip: Ipv4Addr::new(192, 168, 1, 50),
            hostname: "pxe-node".into(),
            subnet: subnet.cidr,
            description: None,
            tftp_server: Some("10.0.0.5".into()),
            boot_filename: Some("pxe.0".into()),
            created_at: now,
            updated_at: now,
        }
    }

    fn option_str(reply: &DhcpPacket, code: u8) -> Option<String> {
        reply
            .get_option(code)
            .map(|o| String::from_utf8_lossy(&o.data).into_owned())
    }

    #[test]
    fn requested_ip_prefers_option_fifty() {
        let mut packet = DhcpPacket::new();
        packet.ciaddr = Ipv4Addr::new(192, 168, 1, 9);
        packet.set_option(options::OPTION_REQUESTED_IP, vec![192, 168, 1, 100]);
        assert_eq!(requested_ip(&packet), Some(Ipv4Addr::new(192, 168, 1, 100)));
    }

    #[test]
    fn requested_ip_falls_back_to_ciaddr() {
        let mut packet = DhcpPacket::new();
        packet.ciaddr = Ipv4Addr::new(192, 168, 1, 9);
        assert_eq!(requested_ip(&packet), Some(Ipv4Addr::new(192, 168, 1, 9)));
    }

    #[test]
    fn requested_ip_absent_when_neither_set() {
        let packet = DhcpPacket::new();
        assert_eq!(requested_ip(&packet), None);
    }

    #[test]
    fn standard_options_present() {
        let subnet = test_subnet();
        let mut reply = DhcpPacket::new();
        add_dhcp_options(&mut reply, &subnet, None, 3600);

        assert_eq!(
            reply.get_option(options::OPTION_LEASE_TIME).unwrap().data,
            3600u32.to_be_bytes().to_vec()
        );
        assert_eq!(
            reply.get_option(options::OPTION_SUBNET_MASK).unwrap().data,
            vec![255, 255, 255, 0]
        );
        assert_eq!(
            reply.get_option(options::OPTION_SERVER_ID).unwrap().data,
            vec![192, 168, 1, 1]
        );
        assert_eq!(
            reply.get_option(options::OPTION_ROUTER).unwrap().data,
            vec![192, 168, 1, 1]
        );
        assert_eq!(
            reply.get_option(options::OPTION_DNS_SERVERS).unwrap().data,
            vec![8, 8, 8, 8]
        );
        assert_eq!(option_str(&reply, options::OPTION_DOMAIN_NAME).unwrap(), "lab.example");
    }

    #[test]
    fn subnet_boot_used_without_reservation() {
        let subnet = test_subnet();
        let mut reply = DhcpPacket::new();
        add_dhcp_options(&mut reply, &subnet, None, 3600);

        assert_eq!(option_str(&reply, options::OPTION_TFTP_SERVER).unwrap(), "10.0.0.1");
        assert_eq!(option_str(&reply, options::OPTION_BOOTFILE).unwrap(), "default.0");
    }

    #[test]
    fn reservation_overrides_boot_per_field() {
        let subnet = test_subnet();
        let reservation = test_reservation(&subnet);
        let mut reply = DhcpPacket::new();
        add_dhcp_options(&mut reply, &subnet, Some(&reservation), 3600);

        assert_eq!(option_str(&reply, options::OPTION_TFTP_SERVER).unwrap(), "10.0.0.5");
        assert_eq!(option_str(&reply, options::OPTION_BOOTFILE).unwrap(), "pxe.0");
    }

    #[test]
    fn reservation_with_only_tftp_keeps_subnet_bootfile() {
        let subnet = test_subnet();
        let mut reservation = test_reservation(&subnet);
        reservation.boot_filename = None;
        let mut reply = DhcpPacket::new();
        add_dhcp_options(&mut reply, &subnet, Some(&reservation), 3600);

        assert_eq!(option_str(&reply, options::OPTION_TFTP_SERVER).unwrap(), "10.0.0.5");
        assert_eq!(option_str(&reply, options::OPTION_BOOTFILE).unwrap(), "default.0");
    }

    #[test]
    fn no_dns_option_when_list_empty() {
        let mut subnet = test_subnet();
        subnet.dns_servers.clear();
        let mut reply = DhcpPacket::new();
        add_dhcp_options(&mut reply, &subnet, None, 3600);
        assert!(reply.get_option(options::OPTION_DNS_SERVERS).is_none());
    }
}
