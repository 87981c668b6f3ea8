//! Inbound packet handling.
//!
//! Packets are validated, then routed by their target protocol address:
//! replies use the source address (the original requester) and everything
//! else the destination. Local replies complete an outstanding request,
//! local and off-NBMA requests are answered here, and anything reachable
//! through another peer is forwarded with the hop count decremented.

use bytes::Bytes;
use nhrp_routing::RouteType;
use nhrp_wire::{
    Afi, Cie, CieCode, Extension, ExtensionType, HeaderMark, Packet, PacketFlags, PacketHeader,
    PacketType, PacketWriter, WireError, CIE_PREFIX_HOST,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

use crate::cache::{BindingStatus, BindingUpdate};
use crate::error::Result;
use crate::interface::Interface;
use crate::route::RouteLookup;
use crate::types::{CacheType, InterfaceFlags, PacketWaiter, PeerId};
use crate::Nhrp;

/// Bytes of the offending packet quoted in a traffic indication
const MAX_INDICATION_PAYLOAD: usize = 128;

/// Append the extensions every request carries
pub(crate) fn push_request_extensions(w: &mut PacketWriter, hdr: HeaderMark) -> std::result::Result<(), WireError> {
    for ext_type in [
        ExtensionType::RESPONDER_ADDRESS,
        ExtensionType::FORWARD_TRANSIT_NHS,
        ExtensionType::REVERSE_TRANSIT_NHS,
    ] {
        let ext = w.push_extension(hdr, ext_type, true)?;
        w.complete_extension(ext)?;
    }
    Ok(())
}

/// Append a NAT address extension holding `cies`
pub(crate) fn push_nat_extension(
    w: &mut PacketWriter,
    hdr: HeaderMark,
    cies: &[Cie],
) -> std::result::Result<(), WireError> {
    let ext = w.push_extension(hdr, ExtensionType::NAT_ADDRESS, false)?;
    for cie in cies {
        w.push_cie(cie);
    }
    w.complete_extension(ext)
}

/// CIE describing this node's own binding on `iface`
pub(crate) fn own_cie(iface: &Interface, afi: Afi) -> Cie {
    let mut cie = Cie::new(CieCode::SUCCESS, iface.nbma, iface.address(afi));
    cie.prefix_length = CIE_PREFIX_HOST;
    cie.holding_time = iface.holdtime;
    cie.mtu = iface.mtu;
    cie
}

/// Source and destination of an IPv4 or IPv6 packet
fn inner_addresses(data: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match data.first()? >> 4 {
        4 if data.len() >= 20 => {
            let src: [u8; 4] = data[12..16].try_into().ok()?;
            let dst: [u8; 4] = data[16..20].try_into().ok()?;
            Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()))
        }
        6 if data.len() >= 40 => {
            let src: [u8; 16] = data[8..24].try_into().ok()?;
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()))
        }
        _ => None,
    }
}

fn is_request(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::ResolutionRequest | PacketType::RegistrationRequest | PacketType::PurgeRequest
    )
}

impl Nhrp {
    /// Handle a packet received on an interface from an NBMA address
    pub fn recv_packet(&mut self, ifindex: u32, src_nbma: IpAddr, data: Bytes) {
        let packet = match Packet::parse_verified(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(component = "packet", "Dropping packet from {}: {}", src_nbma, e);
                return;
            }
        };
        let packet_type = packet.packet_type();

        match self.interfaces.get(&ifindex) {
            Some(iface) if iface.enabled && iface.address(packet.proto_afi).is_some() => {}
            _ => {
                debug!(
                    component = "packet",
                    "{} from {}: NHRP not enabled on {}",
                    packet_type.name(),
                    src_nbma,
                    ifindex
                );
                return;
            }
        }

        let target = if packet_type.is_reply() {
            packet.src_proto
        } else {
            packet.dst_proto
        };
        let Some(target) = target else {
            debug!(component = "packet", "{} from {} without target address", packet_type.name(), src_nbma);
            return;
        };
        let Some(peer) = self.peer_get(ifindex, src_nbma) else {
            return;
        };

        let route = self.route_address(Some(ifindex), target);
        debug!(
            component = "packet",
            "{} from {} for {} ({})",
            packet_type.name(),
            src_nbma,
            target,
            route.route_type
        );

        let result = match route.route_type {
            RouteType::Local if packet_type.is_reply() => {
                match self.packet_reqids.lookup(packet.header.request_id).copied() {
                    Some(waiter) => self.packet_complete(ifindex, waiter, &packet),
                    None => debug!(
                        component = "packet",
                        "{}: unknown request id {}",
                        packet_type.name(),
                        packet.header.request_id
                    ),
                }
                Ok(())
            }
            RouteType::Local | RouteType::OffNbma => self.packet_handle(ifindex, peer, &packet, &route),
            RouteType::NbmaNexthop => match route.peer {
                Some(next) => self.packet_forward(ifindex, next, &packet),
                None => Ok(()),
            },
            RouteType::Blackhole => {
                debug!(component = "packet", "{}: no route to {}, dropped", packet_type.name(), target);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(component = "packet", "{} from {} dropped: {}", packet_type.name(), src_nbma, e);
        }

        if let Some(next) = route.peer {
            self.peer_unref(next);
        }
        self.peer_unref(peer);
    }

    fn packet_complete(&mut self, ifindex: u32, waiter: PacketWaiter, packet: &Packet) {
        match waiter {
            PacketWaiter::Shortcut(id) => self.shortcut_recv_resolution_reply(id, ifindex, packet),
            PacketWaiter::Registration(id) => self.reg_recv_reply(id, packet),
        }
    }

    fn packet_handle(&mut self, ifindex: u32, peer: PeerId, packet: &Packet, route: &RouteLookup) -> Result<()> {
        match packet.packet_type() {
            PacketType::ResolutionRequest => self.handle_resolution_req(ifindex, packet, route),
            PacketType::RegistrationRequest => self.handle_registration_req(ifindex, peer, packet),
            PacketType::PurgeRequest => self.handle_purge_req(ifindex, peer, packet),
            PacketType::TrafficIndication => self.handle_traffic_ind(ifindex, packet),
            PacketType::ErrorIndication => self.handle_error_ind(ifindex, packet),
            other => {
                debug!(component = "packet", "No handler for {}", other.name());
                Ok(())
            }
        }
    }

    /// Answer an extension of a request; `false` rejects the request
    fn extension_reply(
        w: &mut PacketWriter,
        hdr: HeaderMark,
        ext: &Extension,
        own: &Cie,
    ) -> std::result::Result<bool, WireError> {
        match ext.ext_type {
            ExtensionType::RESPONDER_ADDRESS => {
                let mark = w.push_extension(hdr, ext.ext_type, ext.compulsory)?;
                w.push_cie(own);
                w.complete_extension(mark)?;
            }
            ExtensionType::FORWARD_TRANSIT_NHS | ExtensionType::REVERSE_TRANSIT_NHS => {
                w.copy_extension(hdr, ext)?;
            }
            other if ext.compulsory => {
                debug!(component = "packet", "Unsupported compulsory extension {}", other);
                return Ok(false);
            }
            _ => w.copy_extension(hdr, ext)?,
        }
        Ok(true)
    }

    fn handle_resolution_req(&mut self, ifindex: u32, packet: &Packet, route: &RouteLookup) -> Result<()> {
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Ok(());
        };
        if !iface.flags.contains(InterfaceFlags::SHORTCUT) {
            debug!(component = "packet", "{}: shortcuts disabled, resolution request ignored", iface.name);
            return Ok(());
        }
        let (Some(src_nbma), Some(src_proto), Some(dst_proto)) =
            (packet.src_nbma, packet.src_proto, packet.dst_proto)
        else {
            return Ok(());
        };

        let mut own = own_cie(iface, packet.proto_afi);
        if let (RouteType::OffNbma, Some(prefix)) = (route.route_type, route.prefix) {
            if iface.network_id != 0 {
                own.prefix_length = prefix.len();
            }
        }
        let nat_cie = iface
            .nat_nbma
            .map(|nat| Cie { nbma: Some(nat), ..own_cie(iface, packet.proto_afi) });

        let mut w = PacketWriter::new();
        let hdr = w.push_header(PacketType::ResolutionReply, &src_nbma, Some(&src_proto), Some(&dst_proto))?;
        let mask = PacketFlags::RESOLUTION_SOURCE_IS_ROUTER | PacketFlags::RESOLUTION_SOURCE_STABLE;
        w.set_flags(
            hdr,
            (packet.header.flags & mask)
                | PacketFlags::RESOLUTION_DESTINATION_STABLE
                | PacketFlags::RESOLUTION_AUTHORITATIVE,
        );
        w.set_request_id(hdr, packet.header.request_id);
        w.push_cie(&own);

        for ext in packet.extensions()? {
            if ext.ext_type == ExtensionType::NAT_ADDRESS {
                let mark = w.push_extension(hdr, ext.ext_type, ext.compulsory)?;
                if let Some(cie) = &nat_cie {
                    w.push_cie(cie);
                }
                w.complete_extension(mark)?;
            } else if !Self::extension_reply(&mut w, hdr, &ext, &own)? {
                return Ok(());
            }
        }
        let reply = w.complete(hdr)?;

        if let Some(to) = self.peer_get(ifindex, src_nbma) {
            self.peer_send(to, reply);
            self.peer_unref(to);
        }
        Ok(())
    }

    fn handle_registration_req(&mut self, ifindex: u32, peer: PeerId, packet: &Packet) -> Result<()> {
        let (Some(src_nbma), Some(src_proto)) = (packet.src_nbma, packet.src_proto) else {
            return Ok(());
        };
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Ok(());
        };
        let own = own_cie(iface, packet.proto_afi);
        let Some(peer_nbma) = self.peers.get(&peer).map(|p| p.remote_nbma) else {
            return Ok(());
        };
        let natted = peer_nbma != src_nbma;
        let unique = packet.header.flags.contains(PacketFlags::REGISTRATION_UNIQUE);
        let host = packet.proto_afi.host_prefix_len();

        let mut w = PacketWriter::new();
        let hdr = w.push_header(
            PacketType::RegistrationReply,
            &src_nbma,
            Some(&src_proto),
            packet.dst_proto.as_ref(),
        )?;
        w.set_flags(
            hdr,
            packet.header.flags & (PacketFlags::REGISTRATION_UNIQUE | PacketFlags::REGISTRATION_NAT),
        );
        w.set_request_id(hdr, packet.header.request_id);

        for mut cie in packet.cies()? {
            cie.code = self.register_cie(ifindex, peer, &cie, src_nbma, src_proto, natted, unique, host);
            w.push_cie(&cie);
        }

        for ext in packet.extensions()? {
            if ext.ext_type == ExtensionType::NAT_ADDRESS {
                let mark = w.push_extension(hdr, ext.ext_type, ext.compulsory)?;
                w.put_slice(&ext.payload);
                if natted {
                    let mut cie = Cie::new(CieCode::SUCCESS, Some(peer_nbma), Some(src_proto));
                    cie.prefix_length = CIE_PREFIX_HOST;
                    w.push_cie(&cie);
                }
                w.complete_extension(mark)?;
            } else if !Self::extension_reply(&mut w, hdr, &ext, &own)? {
                return Ok(());
            }
        }
        let reply = w.complete(hdr)?;
        self.peer_send(peer, reply);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn register_cie(
        &mut self,
        ifindex: u32,
        peer: PeerId,
        cie: &Cie,
        src_nbma: IpAddr,
        src_proto: IpAddr,
        natted: bool,
        unique: bool,
        host: u8,
    ) -> CieCode {
        if cie.prefix_len_for(Afi::of(&src_proto)) != Some(host) {
            return CieCode::BINDING_NON_UNIQUE;
        }
        let protocol = cie.protocol.unwrap_or(src_proto);
        if protocol != src_proto {
            return CieCode::ADMINISTRATIVELY_PROHIBITED;
        }
        let Some(id) = self.cache_get(ifindex, protocol, true) else {
            return CieCode::INSUFFICIENT_RESOURCES;
        };

        if unique {
            let taken = self.caches.get(&id).is_some_and(|c| {
                c.cur.cache_type == CacheType::Dynamic && c.cur.peer.is_some_and(|p| p != peer)
            });
            if taken {
                debug!(component = "packet", "{} already registered by another peer", protocol);
                return CieCode::UNIQUE_ADDRESS_REGISTERED;
            }
        }

        let nbma = cie.nbma.unwrap_or(src_nbma);
        let update = BindingUpdate::new(CacheType::Dynamic, u32::from(cie.holding_time))
            .with_peer(self.peer_ref(peer))
            .with_natoa(natted.then_some(nbma))
            .with_protocol(protocol);
        match self.cache_update_binding(id, update) {
            Ok(BindingStatus::Refused) | Err(_) => CieCode::ADMINISTRATIVELY_PROHIBITED,
            Ok(_) => CieCode::SUCCESS,
        }
    }

    fn handle_purge_req(&mut self, ifindex: u32, peer: PeerId, packet: &Packet) -> Result<()> {
        let cies = packet.cies()?;
        for cie in &cies {
            let Some(protocol) = cie.protocol else {
                continue;
            };
            let Some(id) = self.cache_get(ifindex, protocol, false) else {
                continue;
            };
            let learned = self.caches.get(&id).is_some_and(|c| {
                !c.mapped && matches!(c.cur.cache_type, CacheType::Cached | CacheType::Dynamic)
            });
            if learned {
                debug!(component = "packet", "Purging binding of {}", protocol);
                self.cache_invalidate(id);
            }
        }

        if packet.header.flags.contains(PacketFlags::PURGE_NO_REPLY) {
            return Ok(());
        }
        let Some(src_nbma) = packet.src_nbma else {
            return Ok(());
        };
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Ok(());
        };
        let own = own_cie(iface, packet.proto_afi);

        let mut w = PacketWriter::new();
        let hdr = w.push_header(
            PacketType::PurgeReply,
            &src_nbma,
            packet.src_proto.as_ref(),
            packet.dst_proto.as_ref(),
        )?;
        w.set_flags(hdr, packet.header.flags);
        w.set_request_id(hdr, packet.header.request_id);
        for cie in &cies {
            w.push_cie(cie);
        }
        for ext in packet.extensions()? {
            if !Self::extension_reply(&mut w, hdr, &ext, &own)? {
                return Ok(());
            }
        }
        let reply = w.complete(hdr)?;
        self.peer_send(peer, reply);
        Ok(())
    }

    fn handle_traffic_ind(&mut self, ifindex: u32, packet: &Packet) -> Result<()> {
        let shortcuts = self
            .interfaces
            .get(&ifindex)
            .is_some_and(|i| i.flags.contains(InterfaceFlags::SHORTCUT));
        if !shortcuts {
            debug!(component = "packet", "Shortcuts disabled on {}, traffic indication ignored", ifindex);
            return Ok(());
        }
        match inner_addresses(&packet.payload) {
            Some((_, dst)) => {
                debug!(component = "packet", "Traffic indication for {}", dst);
                self.shortcut_initiate(dst);
            }
            None => debug!(component = "packet", "Traffic indication without usable IP header"),
        }
        Ok(())
    }

    fn handle_error_ind(&mut self, ifindex: u32, packet: &Packet) -> Result<()> {
        let mut payload = packet.payload.clone();
        let offending = PacketHeader::decode(&mut payload)?;
        debug!(
            component = "packet",
            "Error indication code {} offset {} for {} {}",
            packet.header.error_code().0,
            packet.header.error_offset(),
            offending.packet_type.name(),
            offending.request_id
        );
        if let Some(waiter) = self.packet_reqids.lookup(offending.request_id).copied() {
            self.packet_complete(ifindex, waiter, packet);
        }
        Ok(())
    }

    fn packet_forward(&mut self, ifindex: u32, next: PeerId, packet: &Packet) -> Result<()> {
        let packet_type = packet.packet_type();
        if packet.header.hop_count == 0 {
            debug!(component = "packet", "{}: hop count exceeded", packet_type.name());
            return Ok(());
        }
        let Some(src_nbma) = packet.src_nbma else {
            return Ok(());
        };
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Ok(());
        };
        let own = own_cie(iface, packet.proto_afi);
        let transit = if is_request(packet_type) {
            Some(ExtensionType::FORWARD_TRANSIT_NHS)
        } else if packet_type.is_reply() {
            Some(ExtensionType::REVERSE_TRANSIT_NHS)
        } else {
            None
        };

        let mut w = PacketWriter::new();
        let hdr = w.push_header(
            packet_type,
            &src_nbma,
            packet.src_proto.as_ref(),
            packet.dst_proto.as_ref(),
        )?;
        w.set_flags(hdr, packet.header.flags);
        w.set_request_id(hdr, packet.header.request_id);
        w.set_hop_count(hdr, packet.header.hop_count - 1);
        w.put_slice(&packet.payload);

        for ext in packet.extensions()? {
            if Some(ext.ext_type) != transit {
                w.copy_extension(hdr, &ext)?;
                continue;
            }
            let looped = ext
                .cies(packet.nbma_afi, packet.proto_afi)?
                .iter()
                .any(|cie| cie.protocol.is_some() && cie.protocol == own.protocol);
            if looped {
                warn!(component = "packet", "{}: forwarding loop detected", packet_type.name());
                return Ok(());
            }
            let mark = w.push_extension(hdr, ext.ext_type, ext.compulsory)?;
            w.put_slice(&ext.payload);
            w.push_cie(&own);
            w.complete_extension(mark)?;
        }

        let forwarded = w.complete(hdr)?;
        self.peer_send(next, forwarded);
        Ok(())
    }

    /// Tell the source of hairpinned traffic that a better path exists
    pub fn send_traffic_indication(&mut self, ifindex: u32, inner: &[u8]) {
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return;
        };
        if !iface.enabled || !iface.flags.contains(InterfaceFlags::REDIRECT) {
            return;
        }
        let Some((src, dst)) = inner_addresses(inner) else {
            return;
        };
        let (Some(nbma), Some(addr)) = (iface.nbma, iface.address(Afi::of(&src))) else {
            return;
        };

        let lookup = self.route_address(None, src);
        let peer = match (lookup.route_type, lookup.peer) {
            (RouteType::NbmaNexthop, Some(peer)) => peer,
            (_, peer) => {
                if let Some(peer) = peer {
                    self.peer_unref(peer);
                }
                return;
            }
        };

        let build = || -> std::result::Result<Bytes, WireError> {
            let mut w = PacketWriter::new();
            let hdr = w.push_header(PacketType::TrafficIndication, &nbma, Some(&addr), Some(&src))?;
            w.set_hop_count(hdr, 1);
            w.put_slice(&inner[..inner.len().min(MAX_INDICATION_PAYLOAD)]);
            w.complete(hdr)
        };
        match build() {
            Ok(packet) => {
                debug!(component = "packet", "Traffic indication to {} about {}", src, dst);
                self.peer_send(peer, packet);
            }
            Err(e) => warn!(component = "packet", "Failed to build traffic indication: {}", e),
        }
        self.peer_unref(peer);
    }
}
