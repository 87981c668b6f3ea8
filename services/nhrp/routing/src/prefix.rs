//! IP prefixes

use nhrp_wire::Afi;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::RoutingError;

/// Network prefix with host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    /// Create a prefix, masking off host bits
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, RoutingError> {
        let max = Afi::of(&addr).host_prefix_len();
        if len > max {
            return Err(RoutingError::PrefixLength { len, max });
        }
        Ok(Self {
            addr: mask(addr, len),
            len,
        })
    }

    /// Host prefix covering exactly `addr`
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            len: Afi::of(&addr).host_prefix_len(),
        }
    }

    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits
    pub fn len(&self) -> u8 {
        self.len
    }

    /// Whether this is the default route
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address family
    pub fn afi(&self) -> Afi {
        Afi::of(&self.addr)
    }

    /// Whether this prefix covers a single host
    pub fn is_host(&self) -> bool {
        self.len == self.afi().host_prefix_len()
    }

    /// Whether `addr` falls inside this prefix
    pub fn contains(&self, addr: &IpAddr) -> bool {
        Afi::of(addr) == self.afi() && mask(*addr, self.len) == self.addr
    }

    /// Whether `other` lies entirely inside this prefix
    pub fn contains_prefix(&self, other: &Prefix) -> bool {
        other.len >= self.len && self.contains(&other.addr)
    }
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - len as u32).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Prefix {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr = addr
                    .parse::<IpAddr>()
                    .map_err(|e| RoutingError::Parse(format!("{s}: {e}")))?;
                let len = len
                    .parse::<u8>()
                    .map_err(|e| RoutingError::Parse(format!("{s}: {e}")))?;
                Prefix::new(addr, len)
            }
            None => s
                .parse::<IpAddr>()
                .map(Prefix::host)
                .map_err(|e| RoutingError::Parse(format!("{s}: {e}"))),
        }
    }
}

impl TryFrom<String> for Prefix {
    type Error = RoutingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_masks_host_bits() {
        let p = Prefix::new("10.1.2.3".parse().unwrap(), 16).unwrap();
        assert_eq!(p.to_string(), "10.1.0.0/16");
        let p = Prefix::new("fd00::1234".parse().unwrap(), 64).unwrap();
        assert_eq!(p.to_string(), "fd00::/64");
        let p = Prefix::new("10.1.2.3".parse().unwrap(), 0).unwrap();
        assert_eq!(p.to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_prefix_length_bounds() {
        assert_eq!(
            Prefix::new("10.0.0.1".parse().unwrap(), 33),
            Err(RoutingError::PrefixLength { len: 33, max: 32 })
        );
        assert!(Prefix::new("fd00::1".parse().unwrap(), 128).unwrap().is_host());
    }

    #[test]
    fn test_contains() {
        let p: Prefix = "192.168.0.0/24".parse().unwrap();
        assert!(p.contains(&"192.168.0.77".parse().unwrap()));
        assert!(!p.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!p.contains(&"::ffff:192.168.0.1".parse().unwrap()));
        assert!(p.contains_prefix(&"192.168.0.128/25".parse().unwrap()));
        assert!(!p.contains_prefix(&"192.168.0.0/23".parse().unwrap()));
    }

    #[test]
    fn test_parse() {
        let p: Prefix = "10.0.0.1".parse().unwrap();
        assert!(p.is_host());
        assert!("10.0.0.0/x".parse::<Prefix>().is_err());
        assert!("nonsense/8".parse::<Prefix>().is_err());
    }
}
