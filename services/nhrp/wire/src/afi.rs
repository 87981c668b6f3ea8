//! Address family tags and address field encoding.
//!
//! NBMA addresses are tagged with an IANA address family number
//! (`ar$afn`), protocol addresses with an ethertype (`ar$pro.type`).
//! Address length fields are either 0 (address absent) or exactly the
//! length implied by the tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::WireError;

/// IANA address family number for IPv4
pub const AFNUM_IPV4: u16 = 1;
/// IANA address family number for IPv6
pub const AFNUM_IPV6: u16 = 2;
/// Ethertype for IPv4 protocol addresses
pub const ETH_P_IP: u16 = 0x0800;
/// Ethertype for IPv6 protocol addresses
pub const ETH_P_IPV6: u16 = 0x86DD;

/// Supported address families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Afi {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl Afi {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Afi::Ipv4,
            IpAddr::V6(_) => Afi::Ipv6,
        }
    }

    /// Address length in bytes
    pub fn addr_len(self) -> u8 {
        match self {
            Afi::Ipv4 => 4,
            Afi::Ipv6 => 16,
        }
    }

    /// Prefix length of a host route in this family
    pub fn host_prefix_len(self) -> u8 {
        self.addr_len() * 8
    }

    /// IANA address family number used for NBMA addresses
    pub fn afnum(self) -> u16 {
        match self {
            Afi::Ipv4 => AFNUM_IPV4,
            Afi::Ipv6 => AFNUM_IPV6,
        }
    }

    /// Ethertype used for protocol addresses
    pub fn protocol_type(self) -> u16 {
        match self {
            Afi::Ipv4 => ETH_P_IP,
            Afi::Ipv6 => ETH_P_IPV6,
        }
    }

    /// Decode an NBMA address family number
    pub fn from_afnum(afnum: u16) -> Result<Self, WireError> {
        match afnum {
            AFNUM_IPV4 => Ok(Afi::Ipv4),
            AFNUM_IPV6 => Ok(Afi::Ipv6),
            _ => Err(WireError::AddressFamily(afnum)),
        }
    }

    /// Decode a protocol type
    pub fn from_protocol_type(protocol_type: u16) -> Result<Self, WireError> {
        match protocol_type {
            ETH_P_IP => Ok(Afi::Ipv4),
            ETH_P_IPV6 => Ok(Afi::Ipv6),
            _ => Err(WireError::ProtocolType(protocol_type)),
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            Afi::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Afi::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Afi::Ipv4 => "ipv4",
            Afi::Ipv6 => "ipv6",
        }
    }
}

/// Encoded length of an optional address
pub fn addr_len(addr: Option<&IpAddr>) -> u8 {
    addr.map(|a| Afi::of(a).addr_len()).unwrap_or(0)
}

/// Append an address in network byte order
pub fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

/// Check a length field against the family it is tagged with
pub fn check_len(afi: Afi, len: u8) -> Result<(), WireError> {
    if len != 0 && len != afi.addr_len() {
        return Err(WireError::AddressLength {
            len,
            family: afi.name(),
        });
    }
    Ok(())
}

/// Take an address of `len` bytes from the front of `buf`
///
/// `len` must already be validated with [`check_len`].
pub fn get_addr(buf: &mut Bytes, afi: Afi, len: u8) -> Result<Option<IpAddr>, WireError> {
    check_len(afi, len)?;
    if len == 0 {
        return Ok(None);
    }
    if buf.remaining() < len as usize {
        return Err(WireError::Truncated {
            need: len as usize,
            have: buf.remaining(),
        });
    }
    let addr = match afi {
        Afi::Ipv4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        Afi::Ipv6 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_tags() {
        assert_eq!(Afi::from_afnum(1).unwrap(), Afi::Ipv4);
        assert_eq!(Afi::from_afnum(2).unwrap(), Afi::Ipv6);
        assert_eq!(Afi::from_afnum(3), Err(WireError::AddressFamily(3)));
        assert_eq!(Afi::from_protocol_type(0x86DD).unwrap(), Afi::Ipv6);
        assert!(Afi::from_protocol_type(0x0806).is_err());
    }

    #[test]
    fn test_length_must_match_family() {
        assert!(check_len(Afi::Ipv4, 0).is_ok());
        assert!(check_len(Afi::Ipv4, 4).is_ok());
        assert!(check_len(Afi::Ipv4, 16).is_err());
        assert!(check_len(Afi::Ipv6, 4).is_err());
    }

    #[test]
    fn test_get_addr_does_not_overrun() {
        let mut buf = Bytes::from_static(&[10, 0, 0]);
        let err = get_addr(&mut buf, Afi::Ipv4, 4).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 4, have: 3 });
        assert_eq!(buf.len(), 3);
    }
}
