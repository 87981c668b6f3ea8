//! NHRP packet encoding and decoding (RFC 2332).
//!
//! This crate provides the on-wire representation of NHRP packets: the
//! fixed header, address fields sized by address family, client
//! information entries (CIEs), extension blocks and the Internet checksum.
//!
//! ## Features
//!
//! - **Bit-exact layout**: big-endian fields at RFC 2332 offsets
//! - **Bounds-checked decoding**: malformed input yields [`WireError`]
//! - **Back-patching writer**: lengths and checksum filled on completion
//! - **Zero-Copy I/O**: payload and extensions are `Bytes` slices
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Fixed part (20B)     | afn, pro, hop, size, cksum |
//! |                      | ext offset, version, type  |
//! +----------------------+----------------------------+
//! | Mandatory part (8B)  | address lengths, flags,    |
//! |                      | request id                 |
//! +----------------------+----------------------------+
//! | Addresses            | src nbma, src/dst protocol |
//! +----------------------+----------------------------+
//! | Payload              | CIEs (12B + addresses)     |
//! +----------------------+----------------------------+
//! | Extensions           | u16 type, u16 len, data    |
//! |                      | ... terminated by END      |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod afi;
pub mod checksum;
pub mod cie;
pub mod error;
pub mod extension;
pub mod header;
pub mod packet;

// Re-export main types
pub use afi::{Afi, AFNUM_IPV4, AFNUM_IPV6, ETH_P_IP, ETH_P_IPV6};
pub use checksum::{checksum, verify as verify_checksum};
pub use cie::{pull_cie, Cie, CieCode, CIE_HEADER_SIZE, CIE_PREFIX_HOST};
pub use error::WireError;
pub use extension::{
    pull_extension, Extension, ExtensionType, EXTENSION_FLAG_COMPULSORY, EXTENSION_HEADER_SIZE,
};
pub use header::{
    ErrorCode, PacketFlags, PacketHeader, PacketType, DEFAULT_HOP_COUNT, HEADER_SIZE,
    NHRP_VERSION,
};
pub use packet::{pull_header, ExtensionMark, HeaderMark, Packet, PacketWriter};
