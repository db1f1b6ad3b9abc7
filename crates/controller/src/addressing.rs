//! Tunnel addressing for VPN servers and their clients.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Highest VXLAN network identifier (24 bits).
pub const VNI_MAX: i64 = 16_777_215;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressingError {
    #[error("invalid subnet \"{0}\", expected an IPv4 network such as 10.8.0.0/24")]
    InvalidSubnet(String),
    #[error("invalid ip address \"{0}\"")]
    InvalidAddress(String),
    #[error("ip address {address} is not within the vpn subnet {subnet}")]
    OutsideSubnet { address: Ipv4Addr, subnet: Subnet },
    #[error("vpn subnet {0} has no free addresses left")]
    Exhausted(Subnet),
    #[error("no vxlan network identifier left")]
    VniExhausted,
}

/// IPv4 network; host bits of the parsed address are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.mask() == u32::from(self.network)
    }

    /// Usable host addresses in ascending order. Networks wider than /31
    /// leave out the network and broadcast addresses.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network);
        let last = first | !self.mask();
        let (start, end) = if self.prefix_len >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        };
        (start..=end).map(Ipv4Addr::from)
    }

    /// Lowest host address not in `used`.
    pub fn next_free(&self, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AddressingError> {
        self.hosts()
            .find(|address| !used.contains(address))
            .ok_or(AddressingError::Exhausted(*self))
    }

    /// Parse `raw` and make sure it lies within this network.
    pub fn member(&self, raw: &str) -> Result<Ipv4Addr, AddressingError> {
        let address = Ipv4Addr::from_str(raw.trim())
            .map_err(|_| AddressingError::InvalidAddress(raw.to_string()))?;
        if !self.contains(address) {
            return Err(AddressingError::OutsideSubnet {
                address,
                subnet: *self,
            });
        }
        Ok(address)
    }
}

impl FromStr for Subnet {
    type Err = AddressingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressingError::InvalidSubnet(s.to_string());
        let (address, prefix_len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address = Ipv4Addr::from_str(address).map_err(|_| invalid())?;
        let prefix_len: u8 = prefix_len.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        let mut subnet = Subnet {
            network: address,
            prefix_len,
        };
        subnet.network = Ipv4Addr::from(u32::from(address) & subnet.mask());
        Ok(subnet)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Identifier following the highest one in use, starting from 1.
pub fn next_vni(highest: Option<i64>) -> Result<i64, AddressingError> {
    let next = highest.unwrap_or(0).max(0) + 1;
    if next > VNI_MAX {
        return Err(AddressingError::VniExhausted);
    }
    Ok(next)
}
