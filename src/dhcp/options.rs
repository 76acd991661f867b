use std::net::Ipv4Addr;

pub const OPTION_PAD: u8 = 0;
pub const OPTION_SUBNET_MASK: u8 = 1;
pub const OPTION_ROUTER: u8 = 3;
pub const OPTION_DNS_SERVERS: u8 = 6;
pub const OPTION_HOSTNAME: u8 = 12;
pub const OPTION_DOMAIN_NAME: u8 = 15;
pub const OPTION_BROADCAST: u8 = 28;
pub const OPTION_REQUESTED_IP: u8 = 50;
pub const OPTION_LEASE_TIME: u8 = 51;
pub const OPTION_MESSAGE_TYPE: u8 = 53;
pub const OPTION_SERVER_ID: u8 = 54;
pub const OPTION_PARAMETER_LIST: u8 = 55;
pub const OPTION_MESSAGE: u8 = 56;
pub const OPTION_RENEWAL_TIME: u8 = 58;
pub const OPTION_REBIND_TIME: u8 = 59;
pub const OPTION_VENDOR_CLASS: u8 = 60;
pub const OPTION_CLIENT_ID: u8 = 61;
pub const OPTION_TFTP_SERVER: u8 = 66;
pub const OPTION_BOOTFILE: u8 = 67;
pub const OPTION_USER_CLASS: u8 = 77;
pub const OPTION_END: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

pub struct DhcpOptionsBuilder {
    options: Vec<DhcpOption>,
}

impl DhcpOptionsBuilder {
    pub fn new() -> Self {
        Self { options: Vec::new() }
    }

    pub fn subnet_mask(mut self, mask: Ipv4Addr) -> Self {
        self.push(OPTION_SUBNET_MASK, mask.octets().to_vec());
        self
    }

    pub fn router(mut self, router: Ipv4Addr) -> Self {
        self.push(OPTION_ROUTER, router.octets().to_vec());
        self
    }

    pub fn dns_servers(mut self, servers: &[Ipv4Addr]) -> Self {
        let mut data = Vec::with_capacity(servers.len() * 4);
        for server in servers {
            data.extend_from_slice(&server.octets());
        }
        self.push(OPTION_DNS_SERVERS, data);
        self
    }

    pub fn domain_name(mut self, domain: &str) -> Self {
        self.push(OPTION_DOMAIN_NAME, domain.as_bytes().to_vec());
        self
    }

    pub fn broadcast(mut self, broadcast: Ipv4Addr) -> Self {
        self.push(OPTION_BROADCAST, broadcast.octets().to_vec());
        self
    }

    pub fn lease_time(mut self, seconds: u32) -> Self {
        self.push(OPTION_LEASE_TIME, seconds.to_be_bytes().to_vec());
        self
    }

    pub fn renewal_time(mut self, seconds: u32) -> Self {
        self.push(OPTION_RENEWAL_TIME, seconds.to_be_bytes().to_vec());
        self
    }

    pub fn rebind_time(mut self, seconds: u32) -> Self {
        self.push(OPTION_REBIND_TIME, seconds.to_be_bytes().to_vec());
        self
    }

    pub fn server_id(mut self, ip: Ipv4Addr) -> Self {
        self.push(OPTION_SERVER_ID, ip.octets().to_vec());
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.push(OPTION_MESSAGE, message.as_bytes().to_vec());
        self
    }

    pub fn tftp_server(mut self, name: &str) -> Self {
        self.push(OPTION_TFTP_SERVER, name.as_bytes().to_vec());
        self
    }

    pub fn bootfile(mut self, name: &str) -> Self {
        self.push(OPTION_BOOTFILE, name.as_bytes().to_vec());
        self
    }

    fn push(&mut self, code: u8, data: Vec<u8>) {
        self.options.push(DhcpOption { code, data });
    }

    pub fn build(self) -> Vec<DhcpOption> {
        self.options
    }
}

impl Default for DhcpOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_emits_wire_bytes() {
        let opts = DhcpOptionsBuilder::new()
            .subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
            .router(Ipv4Addr::new(192, 168, 1, 1))
            .dns_servers(&[Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)])
            .lease_time(3600)
            .build();

        assert_eq!(opts[0].code, OPTION_SUBNET_MASK);
        assert_eq!(opts[0].data, vec![255, 255, 255, 0]);
        assert_eq!(opts[1].code, OPTION_ROUTER);
        assert_eq!(opts[1].data, vec![192, 168, 1, 1]);
        assert_eq!(opts[2].code, OPTION_DNS_SERVERS);
        assert_eq!(opts[2].data, vec![8, 8, 8, 8, 1, 1, 1, 1]);
        assert_eq!(opts[3].code, OPTION_LEASE_TIME);
        assert_eq!(opts[3].data, 3600u32.to_be_bytes().to_vec());
    }

    #[test]
    fn boot_options() {
        let opts = DhcpOptionsBuilder::new()
            .tftp_server("10.0.0.5")
            .bootfile("pxe.0")
            .build();
        assert_eq!(opts[0].code, OPTION_TFTP_SERVER);
        assert_eq!(opts[0].data, b"10.0.0.5".to_vec());
        assert_eq!(opts[1].code, OPTION_BOOTFILE);
        assert_eq!(opts[1].data, b"pxe.0".to_vec());
    }

    #[test]
    fn message_option() {
        let opts = DhcpOptionsBuilder::new()
            .message("No IP address requested")
            .build();
        assert_eq!(opts[0].code, OPTION_MESSAGE);
        assert_eq!(opts[0].data, b"No IP address requested".to_vec());
    }
}
