use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use crate::{FlowStatsError, Result};

const PRIVATE_SUBNETS: [&str; 3] = ["192.168.0.0/16", "172.16.0.0/12", "10.0.0.0/8"];
const CAMPUS_SUBNETS: [&str; 1] = ["149.171.0.0/16"];

/// An IPv4 CIDR block, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(FlowStatsError::Parse(format!(
                "invalid prefix length /{}", prefix_len
            )));
        }
        let mask = Self::mask(prefix_len);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len as u32)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix_len) == self.network
    }
}

impl FromStr for Ipv4Cidr {
    type Err = FlowStatsError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| FlowStatsError::Parse(format!("missing prefix length in {}", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| FlowStatsError::Parse(format!("invalid network address in {}", s)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| FlowStatsError::Parse(format!("invalid prefix length in {}", s)))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

/// Decides whether an address sits on the capturing side of the network.
#[derive(Debug, Clone)]
pub struct SubnetClassifier {
    blocks: Vec<Ipv4Cidr>,
}

impl SubnetClassifier {
    pub fn new(blocks: Vec<Ipv4Cidr>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(FlowStatsError::Config(
                "at least one local subnet is required".to_string(),
            ));
        }
        Ok(Self { blocks })
    }

    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Result<Self> {
        let blocks = cidrs
            .iter()
            .map(|cidr| cidr.as_ref().parse())
            .collect::<Result<Vec<Ipv4Cidr>>>()
            .map_err(|e| FlowStatsError::Config(e.to_string()))?;
        Self::new(blocks)
    }

    pub fn is_local(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(ipv4) => self.is_local_v4(*ipv4),
            IpAddr::V6(_) => false,
        }
    }

    pub fn is_local_v4(&self, ip: Ipv4Addr) -> bool {
        self.blocks.iter().any(|block| block.contains(ip))
    }

    pub fn blocks(&self) -> &[Ipv4Cidr] {
        &self.blocks
    }
}

impl Default for SubnetClassifier {
    fn default() -> Self {
        let blocks = PRIVATE_SUBNETS
            .iter()
            .chain(CAMPUS_SUBNETS.iter())
            .filter_map(|cidr| cidr.parse().ok())
            .collect();
        Self { blocks }
    }
}
