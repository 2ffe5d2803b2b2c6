use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr},
};

use crate::{
    error::Error,
    wg::{Cidr, config::ParseError},
};

const LAST_HOST: u32 = 254;

/// Host addresses `[start, 254]` of an IPv4 subnet, handed out lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    subnet: Cidr,
    network: Ipv4Addr,
    start: u32,
    last: u32,
}

impl AddressPool {
    pub fn new(subnet: Cidr, start: u8) -> Result<Self, ParseError> {
        let IpAddr::V4(ip) = subnet.ip else {
            return Err(ParseError::NotIpv4(subnet));
        };

        if subnet.mask > 30 {
            return Err(ParseError::SubnetTooSmall(subnet));
        }

        let size = 1u64 << (32 - subnet.mask);
        let last = LAST_HOST.min((size - 2) as u32);
        let start = u32::from(start);
        if start == 0 || start > last {
            return Err(ParseError::InvalidStart(start as u8));
        }

        let mask = u32::MAX.checked_shl(32 - u32::from(subnet.mask)).unwrap_or(0);
        let network = Ipv4Addr::from(u32::from(ip) & mask);

        Ok(Self {
            subnet: Cidr {
                ip: network.into(),
                mask: subnet.mask,
            },
            network,
            start,
            last,
        })
    }

    pub fn subnet(&self) -> Cidr {
        self.subnet
    }

    pub fn capacity(&self) -> usize {
        (self.last - self.start + 1) as usize
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let base = u32::from(self.network);
        let addr = u32::from(addr);
        addr >= base + self.start && addr <= base + self.last
    }

    /// Lowest pool address not in `existing`.
    pub fn allocate(&self, existing: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, Error> {
        let base = u32::from(self.network);

        (self.start..=self.last)
            .map(|offset| Ipv4Addr::from(base + offset))
            .find(|addr| !existing.contains(addr))
            .ok_or_else(|| Error::AllocationExhausted(self.subnet.to_string()))
    }
}
