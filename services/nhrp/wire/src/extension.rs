//! Extension blocks.
//!
//! Extensions follow the payload and are terminated by an END extension.
//! Each one is a 4-byte header (type with the compulsory bit, payload
//! length) followed by the payload, which for most standard types is a
//! list of CIEs.

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::afi::Afi;
use crate::cie::{self, Cie};
use crate::WireError;

/// Extension header size in bytes
pub const EXTENSION_HEADER_SIZE: usize = 4;

/// Compulsory bit of the extension type field
pub const EXTENSION_FLAG_COMPULSORY: u16 = 0x8000;

/// Extension type, compulsory bit excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionType(pub u16);

impl ExtensionType {
    /// End of extensions
    pub const END: ExtensionType = ExtensionType(0);
    /// Responder address
    pub const RESPONDER_ADDRESS: ExtensionType = ExtensionType(3);
    /// Forward transit NHS record
    pub const FORWARD_TRANSIT_NHS: ExtensionType = ExtensionType(4);
    /// Reverse transit NHS record
    pub const REVERSE_TRANSIT_NHS: ExtensionType = ExtensionType(5);
    /// Authentication
    pub const AUTHENTICATION: ExtensionType = ExtensionType(7);
    /// Vendor private
    pub const VENDOR: ExtensionType = ExtensionType(8);
    /// NAT address (Cisco)
    pub const NAT_ADDRESS: ExtensionType = ExtensionType(9);
}

impl fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ExtensionType::END => "end",
            ExtensionType::RESPONDER_ADDRESS => "responder-address",
            ExtensionType::FORWARD_TRANSIT_NHS => "forward-transit-nhs",
            ExtensionType::REVERSE_TRANSIT_NHS => "reverse-transit-nhs",
            ExtensionType::AUTHENTICATION => "authentication",
            ExtensionType::VENDOR => "vendor",
            ExtensionType::NAT_ADDRESS => "nat-address",
            ExtensionType(other) => return write!(f, "unknown({other})"),
        };
        f.write_str(name)
    }
}

/// Decoded extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Type
    pub ext_type: ExtensionType,
    /// Whether the receiver must understand this extension
    pub compulsory: bool,
    /// Raw payload
    pub payload: Bytes,
}

impl Extension {
    /// Type field as carried on the wire
    pub fn raw_type(&self) -> u16 {
        if self.compulsory {
            self.ext_type.0 | EXTENSION_FLAG_COMPULSORY
        } else {
            self.ext_type.0
        }
    }

    /// Decode the payload as a CIE list
    pub fn cies(&self, nbma_afi: Afi, proto_afi: Afi) -> Result<Vec<Cie>, WireError> {
        cie::pull_all(self.payload.clone(), nbma_afi, proto_afi)
    }
}

/// Take one extension from the front of `buf`
///
/// Returns `Ok(None)` at the END extension or when `buf` is exhausted.
pub fn pull_extension(buf: &mut Bytes) -> Result<Option<Extension>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < EXTENSION_HEADER_SIZE {
        return Err(WireError::Truncated {
            need: EXTENSION_HEADER_SIZE,
            have: buf.len(),
        });
    }

    let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if EXTENSION_HEADER_SIZE + length > buf.len() {
        return Err(WireError::Length {
            declared: length,
            available: buf.len() - EXTENSION_HEADER_SIZE,
        });
    }
    buf.advance(EXTENSION_HEADER_SIZE);

    let ext_type = ExtensionType(raw_type & !EXTENSION_FLAG_COMPULSORY);
    let payload = buf.split_to(length);
    if ext_type == ExtensionType::END {
        buf.clear();
        return Ok(None);
    }

    Ok(Some(Extension {
        ext_type,
        compulsory: raw_type & EXTENSION_FLAG_COMPULSORY != 0,
        payload,
    }))
}
