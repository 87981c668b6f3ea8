//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the structure being decoded
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Declared length exceeds the bytes actually present
    #[error("declared length {declared} exceeds available {available}")]
    Length {
        /// Length field value
        declared: usize,
        /// Bytes available
        available: usize,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unsupported NBMA address family number
    #[error("unsupported address family {0:#06x}")]
    AddressFamily(u16),

    /// Unsupported protocol type
    #[error("unsupported protocol type {0:#06x}")]
    ProtocolType(u16),

    /// Address length does not match the address family
    #[error("address length {len} invalid for {family}")]
    AddressLength {
        /// Declared length
        len: u8,
        /// Family the length was checked against
        family: &'static str,
    },

    /// Subaddresses are not supported
    #[error("subaddress present ({0} bytes)")]
    Subaddress(u8),

    /// Unknown packet type
    #[error("unknown packet type {0}")]
    Type(u8),

    /// Extension offset points outside the packet
    #[error("extension offset {0} outside packet")]
    ExtensionOffset(usize),

    /// Header checksum mismatch
    #[error("checksum mismatch")]
    Checksum,

    /// Structure too large for its length field
    #[error("size limit exceeded: {0}")]
    Size(usize),
}
