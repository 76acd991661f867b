use crate::config::{SubnetConfig, Settings};
use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use ipnetwork::{IpNetwork, Ipv4Network};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Inclusive IPv4 range inside a subnet from which dynamic leases are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

impl Pool {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.range_start && ip <= self.range_end
    }

    /// Every address in the range, in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);
        (start..=end).map(Ipv4Addr::from)
    }

    pub fn len(&self) -> usize {
        (u32::from(self.range_end) - u32::from(self.range_start)) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false // range ends are inclusive; a pool always holds at least one IP
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootInfo {
    pub tftp_server: Option<String>,
    pub filename: Option<String>,
}

/// Runtime view of a configured subnet. Built from validated configuration;
/// not persisted.
#[derive(Debug, Clone)]
pub struct Subnet {
    pub network: Ipv4Net,
    /// The same network, in the DB-bindable representation.
    pub cidr: IpNetwork,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration: u32,
    pub max_lease_duration: u32,
    pub options: HashMap<String, String>,
    pub boot: Option<BootInfo>,
    pub pools: Vec<Pool>,
}

impl Subnet {
    pub fn from_config(cfg: &SubnetConfig) -> Result<Self> {
        let network: Ipv4Net = cfg
            .network
            .parse()
            .map_err(|e| Error::ValidationFailed(format!("subnet {}: {e}", cfg.network)))?;
        let cidr = IpNetwork::V4(
            Ipv4Network::new(network.network(), network.prefix_len())
                .map_err(|e| Error::ValidationFailed(format!("subnet {}: {e}", cfg.network)))?,
        );

        Ok(Subnet {
            network,
            cidr,
            gateway: cfg.gateway,
            dns_servers: cfg.dns_servers.clone(),
            lease_duration: cfg.lease_duration,
            max_lease_duration: cfg.max_lease_duration,
            options: cfg.options.clone(),
            boot: cfg.boot.as_ref().map(|b| BootInfo {
                tftp_server: b.tftp_server.clone(),
                filename: b.filename.clone(),
            }),
            pools: cfg
                .pools
                .iter()
                .map(|p| Pool {
                    range_start: p.range_start,
                    range_end: p.range_end,
                })
                .collect(),
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.network.broadcast()
    }

    pub fn cidr_string(&self) -> String {
        self.network.to_string()
    }
}

/// The configured subnets, swapped wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct SubnetTable {
    subnets: Vec<Subnet>,
}

impl SubnetTable {
    pub fn new(subnets: Vec<Subnet>) -> Self {
        Self { subnets }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let subnets = settings
            .subnets
            .iter()
            .map(Subnet::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { subnets })
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter()
    }

    fn containing(&self, ip: Ipv4Addr) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.contains(ip))
    }

    /// Subnet resolution for an incoming packet: relay agent address first,
    /// then the client's own address, then the sole configured subnet.
    pub fn resolve(&self, giaddr: Ipv4Addr, ciaddr: Ipv4Addr) -> Result<&Subnet> {
        if !giaddr.is_unspecified() {
            return self.containing(giaddr).ok_or(Error::SubnetUnresolved);
        }
        if !ciaddr.is_unspecified() {
            return self.containing(ciaddr).ok_or(Error::SubnetUnresolved);
        }
        if self.subnets.len() == 1 {
            return Ok(&self.subnets[0]);
        }
        Err(Error::SubnetUnresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(network: &str, gateway: Ipv4Addr) -> Subnet {
        let network: Ipv4Net = network.parse().unwrap();
        Subnet {
            network,
            cidr: IpNetwork::V4(
                Ipv4Network::new(network.network(), network.prefix_len()).unwrap(),
            ),
            gateway,
            dns_servers: vec![],
            lease_duration: 3600,
            max_lease_duration: 86_400,
            options: HashMap::new(),
            boot: None,
            pools: vec![Pool {
                range_start: Ipv4Addr::new(192, 168, 1, 100),
                range_end: Ipv4Addr::new(192, 168, 1, 110),
            }],
        }
    }

    #[test]
    fn giaddr_wins_over_ciaddr() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", Ipv4Addr::new(192, 168, 1, 1)),
            subnet("10.0.0.0/24", Ipv4Addr::new(10, 0, 0, 1)),
        ]);
        let resolved = table
            .resolve(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(192, 168, 1, 5))
            .unwrap();
        assert_eq!(resolved.gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn ciaddr_used_when_no_relay() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", Ipv4Addr::new(192, 168, 1, 1)),
            subnet("10.0.0.0/24", Ipv4Addr::new(10, 0, 0, 1)),
        ]);
        let resolved = table
            .resolve(Ipv4Addr::UNSPECIFIED, Ipv4Addr::new(192, 168, 1, 5))
            .unwrap();
        assert_eq!(resolved.gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn single_subnet_is_fallback() {
        let table = SubnetTable::new(vec![subnet("192.168.1.0/24", Ipv4Addr::new(192, 168, 1, 1))]);
        let resolved = table
            .resolve(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
            .unwrap();
        assert_eq!(resolved.gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn multiple_subnets_without_hint_unresolved() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", Ipv4Addr::new(192, 168, 1, 1)),
            subnet("10.0.0.0/24", Ipv4Addr::new(10, 0, 0, 1)),
        ]);
        assert!(table
            .resolve(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
            .is_err());
    }

    #[test]
    fn relay_outside_every_subnet_unresolved() {
        let table = SubnetTable::new(vec![subnet("192.168.1.0/24", Ipv4Addr::new(192, 168, 1, 1))]);
        assert!(table
            .resolve(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::UNSPECIFIED)
            .is_err());
    }

    #[test]
    fn single_ip_pool_has_one_address() {
        let pool = Pool {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 100),
        };
        let all: Vec<_> = pool.addresses().collect();
        assert_eq!(all, vec![Ipv4Addr::new(192, 168, 1, 100)]);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(!pool.contains(Ipv4Addr::new(192, 168, 1, 101)));
    }

    #[test]
    fn pool_addresses_stay_in_range() {
        let pool = Pool {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 110),
        };
        let all: Vec<_> = pool.addresses().collect();
        assert_eq!(all.len(), 11);
        assert!(all.iter().all(|ip| pool.contains(*ip)));
    }
}
