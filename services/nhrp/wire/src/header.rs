//! Fixed packet header.
//!
//! This module defines the 28-byte header shared by every NHRP packet: the
//! 20-byte fixed part followed by the 8-byte start of the mandatory part.
//! Source NBMA, source protocol and destination protocol addresses follow
//! immediately after it and are sized by the length fields.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Protocol version (RFC 2332)
pub const NHRP_VERSION: u8 = 1;

/// Header size in bytes, addresses excluded
pub const HEADER_SIZE: usize = 28;

/// Default hop count for originated packets
pub const DEFAULT_HOP_COUNT: u8 = 64;

/// Byte offset of the hop count field
pub const HOP_COUNT_OFFSET: usize = 9;
/// Byte offset of the packet size field
pub const PACKET_SIZE_OFFSET: usize = 10;
/// Byte offset of the checksum field
pub const CHECKSUM_OFFSET: usize = 12;
/// Byte offset of the extension offset field
pub const EXTENSION_OFFSET_OFFSET: usize = 14;
/// Byte offset of the flags field
pub const FLAGS_OFFSET: usize = 22;
/// Byte offset of the request id field
pub const REQUEST_ID_OFFSET: usize = 24;

/// Packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Resolution request
    ResolutionRequest = 1,
    /// Resolution reply
    ResolutionReply = 2,
    /// Registration request
    RegistrationRequest = 3,
    /// Registration reply
    RegistrationReply = 4,
    /// Purge request
    PurgeRequest = 5,
    /// Purge reply
    PurgeReply = 6,
    /// Error indication
    ErrorIndication = 7,
    /// Traffic indication (redirect)
    TrafficIndication = 8,
}

impl PacketType {
    /// Whether this packet answers an earlier request
    ///
    /// Error indications are routed like requests and are not replies.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketType::ResolutionReply
                | PacketType::RegistrationReply
                | PacketType::PurgeReply
        )
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            PacketType::ResolutionRequest => "Resolution-Request",
            PacketType::ResolutionReply => "Resolution-Reply",
            PacketType::RegistrationRequest => "Registration-Request",
            PacketType::RegistrationReply => "Registration-Reply",
            PacketType::PurgeRequest => "Purge-Request",
            PacketType::PurgeReply => "Purge-Reply",
            PacketType::ErrorIndication => "Error-Indication",
            PacketType::TrafficIndication => "Traffic-Indication",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::ResolutionRequest),
            2 => Ok(PacketType::ResolutionReply),
            3 => Ok(PacketType::RegistrationRequest),
            4 => Ok(PacketType::RegistrationReply),
            5 => Ok(PacketType::PurgeRequest),
            6 => Ok(PacketType::PurgeReply),
            7 => Ok(PacketType::ErrorIndication),
            8 => Ok(PacketType::TrafficIndication),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Mandatory part flags; bit meanings depend on the packet type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PacketFlags: u16 {
        /// Q: requester is a router
        const RESOLUTION_SOURCE_IS_ROUTER = 0x8000;
        /// A: reply must come from the authoritative server
        const RESOLUTION_AUTHORITATIVE = 0x4000;
        /// D: destination binding is stable
        const RESOLUTION_DESTINATION_STABLE = 0x2000;
        /// U: uniqueness requested
        const RESOLUTION_UNIQUE = 0x1000;
        /// S: source binding is stable
        const RESOLUTION_SOURCE_STABLE = 0x0800;
        /// Cisco NAT address extension understood
        const RESOLUTION_NAT = 0x0002;
        /// U: registration is unique
        const REGISTRATION_UNIQUE = 0x8000;
        /// Cisco NAT address extension understood
        const REGISTRATION_NAT = 0x0002;
        /// N: no reply expected
        const PURGE_NO_REPLY = 0x8000;
    }
}

/// Error indication codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Unrecognized compulsory extension
    pub const UNRECOGNIZED_EXTENSION: ErrorCode = ErrorCode(1);
    /// Loop detected
    pub const LOOP_DETECTED: ErrorCode = ErrorCode(3);
    /// Protocol address unreachable
    pub const PROTOCOL_ADDRESS_UNREACHABLE: ErrorCode = ErrorCode(6);
    /// Protocol error
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(7);
    /// SDU size exceeded
    pub const SDU_SIZE_EXCEEDED: ErrorCode = ErrorCode(8);
    /// Invalid extension
    pub const INVALID_EXTENSION: ErrorCode = ErrorCode(9);
    /// Invalid resolution reply received
    pub const INVALID_RESOLUTION_REPLY: ErrorCode = ErrorCode(10);
    /// Authentication failure
    pub const AUTHENTICATION_FAILURE: ErrorCode = ErrorCode(11);
    /// Hop count exceeded
    pub const HOP_COUNT_EXCEEDED: ErrorCode = ErrorCode(15);
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// NBMA address family number
    pub afnum: u16,
    /// Protocol address ethertype
    pub protocol_type: u16,
    /// SNAP extension of the protocol type (zero for ethertypes)
    pub snap: [u8; 5],
    /// Hop count, decremented by transit servers
    pub hop_count: u8,
    /// Total packet length including extensions
    pub packet_size: u16,
    /// Internet checksum over the whole packet
    pub checksum: u16,
    /// Offset of the first extension, 0 if none
    pub extension_offset: u16,
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Source NBMA address length
    pub src_nbma_len: u8,
    /// Source NBMA subaddress length
    pub src_nbma_sublen: u8,
    /// Source protocol address length
    pub src_proto_len: u8,
    /// Destination protocol address length
    pub dst_proto_len: u8,
    /// Flags
    pub flags: PacketFlags,
    /// Request id correlating requests and replies
    pub request_id: u32,
}

impl PacketHeader {
    /// Create a header for the given type and families with zeroed lengths
    pub fn new(packet_type: PacketType, afnum: u16, protocol_type: u16) -> Self {
        Self {
            afnum,
            protocol_type,
            snap: [0; 5],
            hop_count: DEFAULT_HOP_COUNT,
            packet_size: 0,
            checksum: 0,
            extension_offset: 0,
            version: NHRP_VERSION,
            packet_type,
            src_nbma_len: 0,
            src_nbma_sublen: 0,
            src_proto_len: 0,
            dst_proto_len: 0,
            flags: PacketFlags::empty(),
            request_id: 0,
        }
    }

    /// Error code of an error indication
    ///
    /// Error indications carry `unused, code, offset` where other packets
    /// carry `flags, request_id`.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode((self.request_id >> 16) as u16)
    }

    /// Error offset of an error indication
    pub fn error_offset(&self) -> u16 {
        (self.request_id & 0xFFFF) as u16
    }

    /// Set code and offset of an error indication
    pub fn set_error(&mut self, code: ErrorCode, offset: u16) {
        self.flags = PacketFlags::empty();
        self.request_id = ((code.0 as u32) << 16) | offset as u32;
    }

    /// Length of the addresses following the header
    pub fn addresses_len(&self) -> usize {
        self.src_nbma_len as usize
            + self.src_nbma_sublen as usize
            + self.src_proto_len as usize
            + self.dst_proto_len as usize
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.afnum);
        buf.put_u16(self.protocol_type);
        buf.put_slice(&self.snap);
        buf.put_u8(self.hop_count);
        buf.put_u16(self.packet_size);
        buf.put_u16(self.checksum);
        buf.put_u16(self.extension_offset);
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.src_nbma_len);
        buf.put_u8(self.src_nbma_sublen);
        buf.put_u8(self.src_proto_len);
        buf.put_u8(self.dst_proto_len);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.request_id);
    }

    /// Decode the header (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let afnum = buf.get_u16();
        let protocol_type = buf.get_u16();
        let mut snap = [0u8; 5];
        buf.copy_to_slice(&mut snap);
        let hop_count = buf.get_u8();
        let packet_size = buf.get_u16();
        let checksum = buf.get_u16();
        let extension_offset = buf.get_u16();
        let version = buf.get_u8();
        if version != NHRP_VERSION {
            return Err(WireError::Version(version));
        }
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let src_nbma_len = buf.get_u8();
        let src_nbma_sublen = buf.get_u8();
        let src_proto_len = buf.get_u8();
        let dst_proto_len = buf.get_u8();
        let flags = PacketFlags::from_bits_retain(buf.get_u16());
        let request_id = buf.get_u32();

        Ok(Self {
            afnum,
            protocol_type,
            snap,
            hop_count,
            packet_size,
            checksum,
            extension_offset,
            version,
            packet_type,
            src_nbma_len,
            src_nbma_sublen,
            src_proto_len,
            dst_proto_len,
            flags,
            request_id,
        })
    }
}
