//! Client information entries.
//!
//! A CIE pairs a client NBMA address with a client protocol address and
//! carries the binding parameters (holding time, MTU, prefix length).
//! CIEs make up the payload of resolution, registration and purge packets
//! and appear inside several extensions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::afi::{self, Afi};
use crate::WireError;

/// CIE header size in bytes, addresses excluded
pub const CIE_HEADER_SIZE: usize = 12;

/// Prefix length value meaning "host route of the address family"
pub const CIE_PREFIX_HOST: u8 = 0xff;

/// CIE result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CieCode(pub u8);

impl CieCode {
    /// Success
    pub const SUCCESS: CieCode = CieCode(0);
    /// Administratively prohibited
    pub const ADMINISTRATIVELY_PROHIBITED: CieCode = CieCode(4);
    /// Insufficient resources
    pub const INSUFFICIENT_RESOURCES: CieCode = CieCode(5);
    /// No binding exists
    pub const NO_BINDING_EXISTS: CieCode = CieCode(11);
    /// Binding exists but is not unique
    pub const BINDING_NON_UNIQUE: CieCode = CieCode(13);
    /// Unique internetworking layer address already registered
    pub const UNIQUE_ADDRESS_REGISTERED: CieCode = CieCode(14);
}

/// Client information entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cie {
    /// Result code
    pub code: CieCode,
    /// Prefix length of the protocol address, [`CIE_PREFIX_HOST`] for host
    pub prefix_length: u8,
    /// Maximum transmission unit, 0 if unspecified
    pub mtu: u16,
    /// Holding time in seconds
    pub holding_time: u16,
    /// Preference
    pub preference: u8,
    /// Client NBMA address
    pub nbma: Option<IpAddr>,
    /// Client protocol address
    pub protocol: Option<IpAddr>,
}

impl Cie {
    /// Entry with the given code and addresses and zeroed parameters
    pub fn new(code: CieCode, nbma: Option<IpAddr>, protocol: Option<IpAddr>) -> Self {
        Self {
            code,
            prefix_length: 0,
            mtu: 0,
            holding_time: 0,
            preference: 0,
            nbma,
            protocol,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        CIE_HEADER_SIZE
            + afi::addr_len(self.nbma.as_ref()) as usize
            + afi::addr_len(self.protocol.as_ref()) as usize
    }

    /// Prefix length resolved against the protocol family
    ///
    /// Returns `None` when the value exceeds the family's address width.
    pub fn prefix_len_for(&self, family: Afi) -> Option<u8> {
        match self.prefix_length {
            CIE_PREFIX_HOST => Some(family.host_prefix_len()),
            len if len <= family.host_prefix_len() => Some(len),
            _ => None,
        }
    }

    /// Append the entry to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code.0);
        buf.put_u8(self.prefix_length);
        buf.put_u16(0);
        buf.put_u16(self.mtu);
        buf.put_u16(self.holding_time);
        buf.put_u8(afi::addr_len(self.nbma.as_ref()));
        buf.put_u8(0);
        buf.put_u8(afi::addr_len(self.protocol.as_ref()));
        buf.put_u8(self.preference);
        if let Some(nbma) = &self.nbma {
            afi::put_addr(buf, nbma);
        }
        if let Some(protocol) = &self.protocol {
            afi::put_addr(buf, protocol);
        }
    }
}

/// Take one CIE from the front of `buf`
///
/// Address lengths are checked against the families of the enclosing
/// packet. Returns `Ok(None)` when `buf` is exhausted.
pub fn pull_cie(buf: &mut Bytes, nbma_afi: Afi, proto_afi: Afi) -> Result<Option<Cie>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < CIE_HEADER_SIZE {
        return Err(WireError::Truncated {
            need: CIE_HEADER_SIZE,
            have: buf.len(),
        });
    }

    let nbma_len = buf[8];
    let nbma_sublen = buf[9];
    let proto_len = buf[10];
    afi::check_len(nbma_afi, nbma_len)?;
    afi::check_len(proto_afi, proto_len)?;
    if nbma_sublen != 0 {
        return Err(WireError::Subaddress(nbma_sublen));
    }
    let total = CIE_HEADER_SIZE + nbma_len as usize + proto_len as usize;
    if total > buf.len() {
        return Err(WireError::Length {
            declared: total,
            available: buf.len(),
        });
    }

    let code = CieCode(buf.get_u8());
    let prefix_length = buf.get_u8();
    let _reserved = buf.get_u16();
    let mtu = buf.get_u16();
    let holding_time = buf.get_u16();
    buf.advance(3);
    let preference = buf.get_u8();
    let nbma = afi::get_addr(buf, nbma_afi, nbma_len)?;
    let protocol = afi::get_addr(buf, proto_afi, proto_len)?;

    Ok(Some(Cie {
        code,
        prefix_length,
        mtu,
        holding_time,
        preference,
        nbma,
        protocol,
    }))
}

/// Decode every CIE in `buf`
pub fn pull_all(mut buf: Bytes, nbma_afi: Afi, proto_afi: Afi) -> Result<Vec<Cie>, WireError> {
    let mut out = Vec::new();
    while let Some(cie) = pull_cie(&mut buf, nbma_afi, proto_afi)? {
        out.push(cie);
    }
    Ok(out)
}
