//! Packet assembly and parsing.
//!
//! [`PacketWriter`] builds a packet in a growable buffer. Length and
//! checksum fields are left as placeholders by [`PacketWriter::push_header`]
//! and [`PacketWriter::push_extension`] and back-patched by the matching
//! `complete` call, so payload and extensions can be appended freely in
//! between.
//!
//! [`Packet`] is the decoded view of a received packet. Decoding never
//! reads past the declared packet size or the buffer, whichever is smaller.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;

use crate::afi::{self, Afi};
use crate::checksum;
use crate::cie::{self, Cie};
use crate::extension::{self, Extension, ExtensionType, EXTENSION_FLAG_COMPULSORY};
use crate::header::{
    ErrorCode, PacketFlags, PacketHeader, PacketType, CHECKSUM_OFFSET, EXTENSION_OFFSET_OFFSET,
    FLAGS_OFFSET, HEADER_SIZE, HOP_COUNT_OFFSET, PACKET_SIZE_OFFSET, REQUEST_ID_OFFSET,
};
use crate::WireError;

/// Buffer capacity reserved for a new packet
const DEFAULT_CAPACITY: usize = 1500;

/// Position of a header written by [`PacketWriter::push_header`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMark {
    start: usize,
}

/// Position of an extension written by [`PacketWriter::push_extension`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionMark {
    start: usize,
}

/// Incremental packet encoder
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_CAPACITY),
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write a header and the three addresses
    ///
    /// Packet size and checksum are placeholders until [`complete`].
    /// Both protocol addresses, when present, must share one family.
    ///
    /// [`complete`]: PacketWriter::complete
    pub fn push_header(
        &mut self,
        packet_type: PacketType,
        src_nbma: &IpAddr,
        src_proto: Option<&IpAddr>,
        dst_proto: Option<&IpAddr>,
    ) -> Result<HeaderMark, WireError> {
        let nbma_afi = Afi::of(src_nbma);
        let proto_afi = src_proto
            .or(dst_proto)
            .map(Afi::of)
            .unwrap_or(nbma_afi);
        if let (Some(src), Some(dst)) = (src_proto, dst_proto) {
            if Afi::of(src) != Afi::of(dst) {
                return Err(WireError::ProtocolType(Afi::of(dst).protocol_type()));
            }
        }

        let mut header = PacketHeader::new(packet_type, nbma_afi.afnum(), proto_afi.protocol_type());
        header.src_nbma_len = nbma_afi.addr_len();
        header.src_proto_len = afi::addr_len(src_proto);
        header.dst_proto_len = afi::addr_len(dst_proto);

        let start = self.buf.len();
        header.encode(&mut self.buf);
        afi::put_addr(&mut self.buf, src_nbma);
        if let Some(addr) = src_proto {
            afi::put_addr(&mut self.buf, addr);
        }
        if let Some(addr) = dst_proto {
            afi::put_addr(&mut self.buf, addr);
        }
        Ok(HeaderMark { start })
    }

    /// Set the flags of a pushed header
    pub fn set_flags(&mut self, hdr: HeaderMark, flags: PacketFlags) {
        self.patch_u16(hdr.start + FLAGS_OFFSET, flags.bits());
    }

    /// Set the request id of a pushed header
    pub fn set_request_id(&mut self, hdr: HeaderMark, request_id: u32) {
        let at = hdr.start + REQUEST_ID_OFFSET;
        self.buf[at..at + 4].copy_from_slice(&request_id.to_be_bytes());
    }

    /// Set the hop count of a pushed header
    pub fn set_hop_count(&mut self, hdr: HeaderMark, hop_count: u8) {
        self.buf[hdr.start + HOP_COUNT_OFFSET] = hop_count;
    }

    /// Set code and offset of a pushed error indication
    pub fn set_error(&mut self, hdr: HeaderMark, code: ErrorCode, offset: u16) {
        self.patch_u16(hdr.start + FLAGS_OFFSET, 0);
        self.patch_u16(hdr.start + REQUEST_ID_OFFSET, code.0);
        self.patch_u16(hdr.start + REQUEST_ID_OFFSET + 2, offset);
    }

    /// Append one CIE
    pub fn push_cie(&mut self, cie: &Cie) {
        cie.encode(&mut self.buf);
    }

    /// Append raw bytes
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Open an extension; the first one also sets the header's extension offset
    pub fn push_extension(
        &mut self,
        hdr: HeaderMark,
        ext_type: ExtensionType,
        compulsory: bool,
    ) -> Result<ExtensionMark, WireError> {
        let start = self.buf.len();
        if self.read_u16(hdr.start + EXTENSION_OFFSET_OFFSET) == 0 {
            let offset = start - hdr.start;
            let offset = u16::try_from(offset).map_err(|_| WireError::Size(offset))?;
            self.patch_u16(hdr.start + EXTENSION_OFFSET_OFFSET, offset);
        }
        let raw_type = if compulsory {
            ext_type.0 | EXTENSION_FLAG_COMPULSORY
        } else {
            ext_type.0
        };
        self.buf.put_u16(raw_type);
        self.buf.put_u16(0);
        Ok(ExtensionMark { start })
    }

    /// Back-patch the payload length of an extension
    pub fn complete_extension(&mut self, ext: ExtensionMark) -> Result<(), WireError> {
        let len = self.buf.len() - ext.start - extension::EXTENSION_HEADER_SIZE;
        let len = u16::try_from(len).map_err(|_| WireError::Size(len))?;
        self.patch_u16(ext.start + 2, len);
        Ok(())
    }

    /// Append an extension with a verbatim payload
    pub fn copy_extension(&mut self, hdr: HeaderMark, ext: &Extension) -> Result<(), WireError> {
        let mark = self.push_extension(hdr, ext.ext_type, ext.compulsory)?;
        self.buf.put_slice(&ext.payload);
        self.complete_extension(mark)
    }

    /// Terminate extensions, back-patch the packet size and checksum
    pub fn complete(mut self, hdr: HeaderMark) -> Result<Bytes, WireError> {
        if self.read_u16(hdr.start + EXTENSION_OFFSET_OFFSET) != 0 {
            let end = self.push_extension(hdr, ExtensionType::END, true)?;
            self.complete_extension(end)?;
        }

        let size = self.buf.len() - hdr.start;
        let size = u16::try_from(size).map_err(|_| WireError::Size(size))?;
        self.patch_u16(hdr.start + PACKET_SIZE_OFFSET, size);
        self.patch_u16(hdr.start + CHECKSUM_OFFSET, 0);
        let sum = checksum::checksum(&self.buf[hdr.start..]);
        self.patch_u16(hdr.start + CHECKSUM_OFFSET, sum);
        Ok(self.buf.freeze())
    }

    fn patch_u16(&mut self, at: usize, value: u16) {
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }
}

/// Decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Fixed header
    pub header: PacketHeader,
    /// Family of NBMA addresses
    pub nbma_afi: Afi,
    /// Family of protocol addresses
    pub proto_afi: Afi,
    /// Source NBMA address
    pub src_nbma: Option<IpAddr>,
    /// Source protocol address
    pub src_proto: Option<IpAddr>,
    /// Destination protocol address
    pub dst_proto: Option<IpAddr>,
    /// Type dependent payload (CIEs, or the offending packet of an error)
    pub payload: Bytes,
    /// Extension blocks, END included
    pub extensions: Bytes,
    /// Whole packet as received, `packet_size` bytes
    pub raw: Bytes,
}

/// Decode one packet from the front of `buf`, consuming `packet_size` bytes
pub fn pull_header(buf: &mut Bytes) -> Result<Packet, WireError> {
    let mut cursor = buf.clone();
    let header = PacketHeader::decode(&mut cursor)?;

    let size = header.packet_size as usize;
    if size < HEADER_SIZE {
        return Err(WireError::Size(size));
    }
    if size > buf.len() {
        return Err(WireError::Length {
            declared: size,
            available: buf.len(),
        });
    }
    if header.src_nbma_sublen != 0 {
        return Err(WireError::Subaddress(header.src_nbma_sublen));
    }
    let nbma_afi = Afi::from_afnum(header.afnum)?;
    let proto_afi = Afi::from_protocol_type(header.protocol_type)?;

    let raw = buf.split_to(size);
    let mut body = raw.slice(HEADER_SIZE..);
    let src_nbma = afi::get_addr(&mut body, nbma_afi, header.src_nbma_len)?;
    let src_proto = afi::get_addr(&mut body, proto_afi, header.src_proto_len)?;
    let dst_proto = afi::get_addr(&mut body, proto_afi, header.dst_proto_len)?;

    let payload_start = HEADER_SIZE + header.addresses_len();
    let (payload, extensions) = match header.extension_offset as usize {
        0 => (raw.slice(payload_start..), Bytes::new()),
        offset if offset >= payload_start && offset <= size => {
            (raw.slice(payload_start..offset), raw.slice(offset..))
        }
        offset => return Err(WireError::ExtensionOffset(offset)),
    };

    Ok(Packet {
        header,
        nbma_afi,
        proto_afi,
        src_nbma,
        src_proto,
        dst_proto,
        payload,
        extensions,
        raw,
    })
}

impl Packet {
    /// Decode a packet occupying the start of `data`
    pub fn parse(data: Bytes) -> Result<Self, WireError> {
        let mut buf = data;
        pull_header(&mut buf)
    }

    /// Decode a packet and verify its checksum
    pub fn parse_verified(data: Bytes) -> Result<Self, WireError> {
        let packet = Self::parse(data)?;
        if !checksum::verify(&packet.raw) {
            return Err(WireError::Checksum);
        }
        Ok(packet)
    }

    /// Packet type
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Decode the payload as a CIE list
    pub fn cies(&self) -> Result<Vec<Cie>, WireError> {
        cie::pull_all(self.payload.clone(), self.nbma_afi, self.proto_afi)
    }

    /// Decode the first payload CIE
    pub fn first_cie(&self) -> Result<Option<Cie>, WireError> {
        let mut payload = self.payload.clone();
        cie::pull_cie(&mut payload, self.nbma_afi, self.proto_afi)
    }

    /// Decode all extensions, END excluded
    pub fn extensions(&self) -> Result<Vec<Extension>, WireError> {
        let mut buf = self.extensions.clone();
        let mut out = Vec::new();
        while let Some(ext) = extension::pull_extension(&mut buf)? {
            out.push(ext);
        }
        Ok(out)
    }

    /// Find the first extension of a type
    pub fn extension(&self, ext_type: ExtensionType) -> Result<Option<Extension>, WireError> {
        Ok(self
            .extensions()?
            .into_iter()
            .find(|ext| ext.ext_type == ext_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cie::CieCode;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn registration(nbma: &str, src: &str, dst: &str) -> Bytes {
        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::RegistrationRequest,
                &ip(nbma),
                Some(&ip(src)),
                Some(&ip(dst)),
            )
            .unwrap();
        w.set_flags(hdr, PacketFlags::REGISTRATION_UNIQUE);
        w.set_request_id(hdr, 77);
        w.set_hop_count(hdr, 0);
        let mut cie = Cie::new(CieCode::SUCCESS, None, None);
        cie.prefix_length = 0xff;
        cie.holding_time = 7200;
        w.push_cie(&cie);
        let ext = w
            .push_extension(hdr, ExtensionType::FORWARD_TRANSIT_NHS, true)
            .unwrap();
        w.complete_extension(ext).unwrap();
        let ext = w
            .push_extension(hdr, ExtensionType::NAT_ADDRESS, false)
            .unwrap();
        w.push_cie(&Cie::new(CieCode::SUCCESS, Some(ip(nbma)), Some(ip(src))));
        w.complete_extension(ext).unwrap();
        w.complete(hdr).unwrap()
    }

    #[test]
    fn test_packet_roundtrip_ipv4() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let packet = Packet::parse_verified(bytes.clone()).unwrap();

        assert_eq!(packet.header.packet_size as usize, bytes.len());
        assert_eq!(packet.packet_type(), PacketType::RegistrationRequest);
        assert_eq!(packet.header.flags, PacketFlags::REGISTRATION_UNIQUE);
        assert_eq!(packet.header.request_id, 77);
        assert_eq!(packet.header.hop_count, 0);
        assert_eq!(packet.src_nbma, Some(ip("192.0.2.1")));
        assert_eq!(packet.src_proto, Some(ip("10.0.0.1")));
        assert_eq!(packet.dst_proto, Some(ip("10.0.0.254")));

        let cies = packet.cies().unwrap();
        assert_eq!(cies.len(), 1);
        assert_eq!(cies[0].holding_time, 7200);

        let exts = packet.extensions().unwrap();
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0].ext_type, ExtensionType::FORWARD_TRANSIT_NHS);
        assert!(exts[0].compulsory);
        let nat = packet.extension(ExtensionType::NAT_ADDRESS).unwrap().unwrap();
        let nat_cies = nat.cies(packet.nbma_afi, packet.proto_afi).unwrap();
        assert_eq!(nat_cies[0].nbma, Some(ip("192.0.2.1")));
    }

    #[test]
    fn test_packet_roundtrip_ipv6() {
        let bytes = registration("2001:db8::1", "fd00::1", "fd00::fe");
        let packet = Packet::parse_verified(bytes).unwrap();
        assert_eq!(packet.nbma_afi, Afi::Ipv6);
        assert_eq!(packet.proto_afi, Afi::Ipv6);
        assert_eq!(packet.header.src_nbma_len, 16);
        assert_eq!(packet.dst_proto, Some(ip("fd00::fe")));
        assert_eq!(packet.cies().unwrap().len(), 1);
    }

    #[test]
    fn test_no_extensions_leaves_offset_zero() {
        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::PurgeReply,
                &ip("192.0.2.1"),
                Some(&ip("10.0.0.1")),
                None,
            )
            .unwrap();
        let bytes = w.complete(hdr).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
        let packet = Packet::parse_verified(bytes).unwrap();
        assert_eq!(packet.header.extension_offset, 0);
        assert!(packet.extensions.is_empty());
        assert_eq!(packet.dst_proto, None);
    }

    #[test]
    fn test_mixed_protocol_families_rejected() {
        let mut w = PacketWriter::new();
        assert!(w
            .push_header(
                PacketType::ResolutionRequest,
                &ip("192.0.2.1"),
                Some(&ip("10.0.0.1")),
                Some(&ip("fd00::1")),
            )
            .is_err());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let mut corrupted = bytes.to_vec();
        corrupted[HEADER_SIZE] ^= 0x01;
        assert_eq!(
            Packet::parse_verified(Bytes::from(corrupted.clone())),
            Err(WireError::Checksum)
        );
        assert!(Packet::parse(Bytes::from(corrupted)).is_ok());
    }

    #[test]
    fn test_declared_length_exceeding_buffer_rejected() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let short = bytes.slice(..40);
        assert_eq!(
            Packet::parse(short),
            Err(WireError::Length {
                declared: bytes.len(),
                available: 40
            })
        );
        assert!(matches!(
            Packet::parse(bytes.slice(..20)),
            Err(WireError::Truncated { need: HEADER_SIZE, have: 20 })
        ));
    }

    #[test]
    fn test_unknown_family_rejected() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let mut data = bytes.to_vec();
        data[0..2].copy_from_slice(&0x000fu16.to_be_bytes());
        assert_eq!(
            Packet::parse(Bytes::from(data)),
            Err(WireError::AddressFamily(0x000f))
        );
    }

    #[test]
    fn test_address_length_overrunning_packet_rejected() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let mut data = bytes[..HEADER_SIZE + 8].to_vec();
        data[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2]
            .copy_from_slice(&((HEADER_SIZE + 8) as u16).to_be_bytes());
        data[EXTENSION_OFFSET_OFFSET..EXTENSION_OFFSET_OFFSET + 2].copy_from_slice(&[0, 0]);
        assert!(matches!(
            Packet::parse(Bytes::from(data)),
            Err(WireError::Truncated { need: 4, have: 0 })
        ));
    }

    #[test]
    fn test_bad_extension_offset_rejected() {
        let bytes = registration("192.0.2.1", "10.0.0.1", "10.0.0.254");
        let mut data = bytes.to_vec();
        data[EXTENSION_OFFSET_OFFSET..EXTENSION_OFFSET_OFFSET + 2]
            .copy_from_slice(&(HEADER_SIZE as u16).to_be_bytes());
        assert_eq!(
            Packet::parse(Bytes::from(data)),
            Err(WireError::ExtensionOffset(HEADER_SIZE))
        );
    }

    #[test]
    fn test_error_indication_fields() {
        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::ErrorIndication,
                &ip("192.0.2.1"),
                Some(&ip("10.0.0.1")),
                Some(&ip("10.0.0.2")),
            )
            .unwrap();
        w.set_error(hdr, ErrorCode::PROTOCOL_ADDRESS_UNREACHABLE, 0);
        let inner = registration("192.0.2.9", "10.0.0.2", "10.0.0.1");
        w.put_slice(&inner);
        let packet = Packet::parse_verified(w.complete(hdr).unwrap()).unwrap();
        assert_eq!(packet.header.error_code(), ErrorCode::PROTOCOL_ADDRESS_UNREACHABLE);
        let offending = Packet::parse(packet.payload.clone()).unwrap();
        assert_eq!(offending.header.request_id, 77);
    }
}
