//! Shortcut routes.
//!
//! A shortcut resolves a destination prefix to a cache entry learned from
//! a resolution reply and announces a route through it while the entry is
//! up. Shortcuts expire at two thirds of their holding time; if traffic
//! still uses the binding they re-resolve, otherwise they are purged after
//! the remaining third.

use nhrp_routing::{Prefix, RouteType};
use nhrp_wire::{
    Afi, Cie, CieCode, ErrorCode, ExtensionType, Packet, PacketFlags, PacketType, PacketWriter,
    WireError, CIE_PREFIX_HOST,
};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::BindingUpdate;
use crate::dispatch::{push_nat_extension, push_request_extensions};
use crate::effects::{Effect, RouteRequest};
use crate::timer::TimerId;
use crate::types::{
    CacheId, CacheType, NotifyEvent, PacketWaiter, ShortcutAction, ShortcutId, Subscriber, TimerEvent,
};
use crate::Nhrp;

/// Shortcut route
#[derive(Debug, Clone)]
pub struct Shortcut {
    /// Destination prefix
    pub prefix: Prefix,
    /// Address being resolved
    pub addr: Option<IpAddr>,
    /// Binding type
    pub cache_type: CacheType,
    /// Holding time of the last reply, seconds
    pub holding_time: u16,
    /// Route announced
    pub route_installed: bool,
    /// Past two thirds of the holding time
    pub expiring: bool,
    /// Cache entry the route points at
    pub cache: Option<CacheId>,
    pub(crate) reqid: Option<u32>,
    pub(crate) timer: Option<TimerId>,
}

/// Listing of one shortcut
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortcutSnapshot {
    /// Destination prefix
    pub prefix: Prefix,
    /// Binding type
    pub cache_type: CacheType,
    /// Protocol next hop
    pub nexthop: Option<IpAddr>,
    /// Route announced
    pub route_installed: bool,
    /// Past two thirds of the holding time
    pub expiring: bool,
}

impl Nhrp {
    /// Look up a shortcut
    pub fn shortcut(&self, id: ShortcutId) -> Option<&Shortcut> {
        self.shortcuts.get(&id)
    }

    /// Shortcut of an exact prefix
    pub fn shortcut_lookup(&self, prefix: &Prefix) -> Option<ShortcutId> {
        self.shortcut_table.get(prefix).copied()
    }

    /// Snapshot of every shortcut, ordered by prefix
    pub fn shortcut_foreach(&self) -> Vec<ShortcutSnapshot> {
        let mut out: Vec<_> = self
            .shortcuts
            .values()
            .map(|s| ShortcutSnapshot {
                prefix: s.prefix,
                cache_type: s.cache_type,
                nexthop: s.cache.and_then(|c| self.caches.get(&c)).map(|c| c.protocol),
                route_installed: s.route_installed,
                expiring: s.expiring,
            })
            .collect();
        out.sort_by_key(|s| s.prefix);
        out
    }

    pub(crate) fn shortcuts_on(&self, ifindex: u32) -> Vec<ShortcutId> {
        self.shortcuts
            .iter()
            .filter(|(_, s)| {
                s.cache
                    .and_then(|c| self.caches.get(&c))
                    .is_some_and(|c| c.ifindex == ifindex)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn shortcut_get(&mut self, prefix: Prefix) -> ShortcutId {
        if let Some(id) = self.shortcut_table.get(&prefix) {
            return *id;
        }
        let id = ShortcutId(self.alloc_id());
        self.shortcuts.insert(
            id,
            Shortcut {
                prefix,
                addr: None,
                cache_type: CacheType::Invalid,
                holding_time: 0,
                route_installed: false,
                expiring: false,
                cache: None,
                reqid: None,
                timer: None,
            },
        );
        self.shortcut_table.insert(prefix, id);
        debug!(component = "shortcut", "{} created for {}", id, prefix);
        id
    }

    /// Start resolving a destination seen in traffic
    pub fn shortcut_initiate(&mut self, addr: IpAddr) {
        let existing = self
            .shortcut_table
            .longest_match(&addr)
            .and_then(|p| self.shortcut_table.get(&p).copied());
        let id = match existing {
            Some(id) => id,
            None => self.shortcut_get(Prefix::host(addr)),
        };
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        if s.cache_type == CacheType::Incomplete {
            return;
        }
        s.addr = Some(addr);
        let mut timer = s.timer.take();
        self.cancel(&mut timer);
        let timer = self.schedule(self.config.shortcut_purge, TimerEvent::Shortcut(id, ShortcutAction::Purge));
        if let Some(s) = self.shortcuts.get_mut(&id) {
            s.timer = Some(timer);
        }
        self.shortcut_send_resolution_req(id);
    }

    fn shortcut_send_resolution_req(&mut self, id: ShortcutId) {
        let Some(addr) = self.shortcuts.get(&id).and_then(|s| s.addr) else {
            return;
        };
        let lookup = self.route_address(None, addr);
        let peer = match (lookup.route_type, lookup.peer) {
            (RouteType::NbmaNexthop, Some(peer)) => peer,
            (route_type, peer) => {
                if let Some(peer) = peer {
                    self.peer_unref(peer);
                }
                debug!(component = "shortcut", "{}: {} is {}, not resolving", id, addr, route_type);
                return;
            }
        };

        let reqid = match self.shortcuts.get(&id).and_then(|s| s.reqid) {
            Some(reqid) => reqid,
            None => self.packet_reqids.allocate(PacketWaiter::Shortcut(id)),
        };
        if let Some(s) = self.shortcuts.get_mut(&id) {
            if matches!(s.cache_type, CacheType::Invalid | CacheType::Negative) {
                s.cache_type = CacheType::Incomplete;
            }
            s.reqid = Some(reqid);
        }

        let ifindex = self.peers.get(&peer).map(|p| p.ifindex);
        match ifindex.map(|ifindex| self.build_resolution_req(ifindex, addr, reqid)) {
            Some(Ok(Some(packet))) => {
                debug!(component = "shortcut", "{}: resolving {} (reqid {})", id, addr, reqid);
                self.peer_send(peer, packet);
            }
            Some(Err(e)) => warn!(component = "shortcut", "{}: failed to build request: {}", id, e),
            _ => debug!(component = "shortcut", "{}: interface not ready for {}", id, addr),
        }
        self.peer_unref(peer);
    }

    fn build_resolution_req(&self, ifindex: u32, addr: IpAddr, reqid: u32) -> Result<Option<bytes::Bytes>, WireError> {
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Ok(None);
        };
        let (Some(nbma), Some(src_proto)) = (iface.nbma, iface.address(Afi::of(&addr))) else {
            return Ok(None);
        };

        let mut w = PacketWriter::new();
        let hdr = w.push_header(PacketType::ResolutionRequest, &nbma, Some(&src_proto), Some(&addr))?;
        w.set_flags(
            hdr,
            PacketFlags::RESOLUTION_SOURCE_IS_ROUTER
                | PacketFlags::RESOLUTION_AUTHORITATIVE
                | PacketFlags::RESOLUTION_SOURCE_STABLE
                | PacketFlags::RESOLUTION_NAT,
        );
        w.set_request_id(hdr, reqid);

        let mut cie = Cie::new(CieCode::SUCCESS, None, None);
        cie.prefix_length = CIE_PREFIX_HOST;
        cie.holding_time = iface.holdtime;
        cie.mtu = iface.mtu;
        w.push_cie(&cie);

        push_request_extensions(&mut w, hdr)?;
        if let Some(nat) = iface.nat_nbma {
            let mut nat_cie = Cie::new(CieCode::SUCCESS, Some(nat), Some(src_proto));
            nat_cie.prefix_length = CIE_PREFIX_HOST;
            push_nat_extension(&mut w, hdr, &[nat_cie])?;
        }
        w.complete(hdr).map(Some)
    }

    /// Reply or error indication for a resolution request
    pub(crate) fn shortcut_recv_resolution_reply(&mut self, id: ShortcutId, ifindex: u32, packet: &Packet) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        let reqid = s.reqid.take();
        let mut timer = s.timer.take();
        if let Some(reqid) = reqid {
            self.packet_reqids.free(reqid);
        }
        self.cancel(&mut timer);
        let timer = self.schedule(
            self.config.shortcut_settle,
            TimerEvent::Shortcut(id, ShortcutAction::Purge),
        );
        if let Some(s) = self.shortcuts.get_mut(&id) {
            s.timer = Some(timer);
        }

        if packet.packet_type() != PacketType::ResolutionReply {
            if packet.packet_type() == PacketType::ErrorIndication
                && packet.header.error_code() == ErrorCode::PROTOCOL_ADDRESS_UNREACHABLE
            {
                debug!(component = "shortcut", "{}: destination unreachable", id);
                self.shortcut_update_binding(id, CacheType::Negative, None, 0);
            } else {
                info!(
                    component = "shortcut",
                    "{}: resolution failed ({})", id, packet.packet_type().name()
                );
            }
            return;
        }

        if let Err(e) = self.shortcut_learn(id, ifindex, packet) {
            debug!(component = "shortcut", "{}: bad resolution reply: {}", id, e);
        }
    }

    fn shortcut_learn(&mut self, id: ShortcutId, ifindex: u32, packet: &Packet) -> Result<(), WireError> {
        let (Some(dst_proto), Some(addr)) = (packet.dst_proto, self.shortcuts.get(&id).and_then(|s| s.addr)) else {
            return Ok(());
        };

        let mut nat_nbma = None;
        if let Some(ext) = packet.extension(ExtensionType::NAT_ADDRESS)? {
            nat_nbma = ext
                .cies(packet.nbma_afi, packet.proto_afi)?
                .into_iter()
                .find(|cie| cie.protocol == Some(dst_proto))
                .and_then(|cie| cie.nbma);
        }

        let Some(cie) = packet.first_cie()? else {
            debug!(component = "shortcut", "{}: reply without CIE", id);
            return Ok(());
        };
        if cie.code != CieCode::SUCCESS {
            debug!(component = "shortcut", "{}: CIE code {}", id, cie.code.0);
            return Ok(());
        }
        let Some(prefix_len) = cie.prefix_len_for(packet.proto_afi) else {
            debug!(component = "shortcut", "{}: invalid CIE prefix length {}", id, cie.prefix_length);
            return Ok(());
        };
        let Some(nbma) = nat_nbma.or(cie.nbma).or(packet.src_nbma) else {
            return Ok(());
        };
        let protocol = cie.protocol.unwrap_or(dst_proto);
        let holding_time = cie.holding_time;

        debug!(
            component = "shortcut",
            "{}: {} is at {} via {}/{}", id, protocol, nbma, dst_proto, prefix_len
        );

        let Some(cache) = self.cache_get(ifindex, protocol, true) else {
            return Ok(());
        };
        let peer = self.peer_get(ifindex, nbma);
        let update = BindingUpdate::new(CacheType::Cached, u32::from(holding_time)).with_peer(peer);
        if let Err(e) = self.cache_update_binding(cache, update) {
            debug!(component = "shortcut", "{}: binding not accepted: {}", id, e);
            return Ok(());
        }

        let Ok(prefix) = Prefix::new(dst_proto, prefix_len) else {
            return Ok(());
        };
        let target = self.shortcut_get(prefix);
        if let Some(s) = self.shortcuts.get_mut(&target) {
            s.addr = Some(addr);
        }
        self.shortcut_update_binding(target, CacheType::Cached, Some(cache), holding_time);
        Ok(())
    }

    fn shortcut_announce(&mut self, id: ShortcutId, add: bool) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        s.route_installed = add;
        let (cache_type, prefix, cache) = (s.cache_type, s.prefix, s.cache);
        let nexthop = if add {
            cache.and_then(|c| self.caches.get(&c)).map(|c| c.protocol)
        } else {
            None
        };
        self.emit(Effect::Route(RouteRequest {
            add,
            cache_type: if add { cache_type } else { CacheType::Invalid },
            prefix,
            ifindex: None,
            nexthop,
        }));
    }

    /// Bind a shortcut to a cache entry
    pub(crate) fn shortcut_update_binding(
        &mut self,
        id: ShortcutId,
        cache_type: CacheType,
        cache: Option<CacheId>,
        holding_time: u16,
    ) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        s.cache_type = cache_type;
        let old = s.cache;
        if old != cache {
            s.cache = cache;
            if let Some(old) = old {
                self.cache_unsubscribe(old, Subscriber::Shortcut(id));
            }
            let up = cache
                .and_then(|c| self.caches.get(&c))
                .is_some_and(|c| c.cur.cache_type.is_up());
            if let Some(cache) = cache {
                self.cache_subscribe(cache, Subscriber::Shortcut(id));
            }
            if up {
                if let Some(s) = self.shortcuts.get_mut(&id) {
                    s.route_installed = false;
                }
                self.shortcut_cache_notify(id, NotifyEvent::CacheUp);
            } else {
                self.shortcut_cache_notify(id, NotifyEvent::CacheDown);
            }
        }

        let Some((current, installed)) = self.shortcuts.get(&id).map(|s| (s.cache_type, s.route_installed)) else {
            return;
        };
        if current == CacheType::Negative && !installed {
            self.shortcut_announce(id, true);
        } else if current == CacheType::Invalid && installed {
            self.shortcut_announce(id, false);
        }

        if holding_time > 0 {
            let Some(s) = self.shortcuts.get_mut(&id) else {
                return;
            };
            s.holding_time = holding_time;
            s.expiring = false;
            let mut timer = s.timer.take();
            self.cancel(&mut timer);
            let expire = Duration::from_secs(u64::from(holding_time) * 2 / 3);
            let timer = self.schedule(expire, TimerEvent::Shortcut(id, ShortcutAction::Expire));
            if let Some(s) = self.shortcuts.get_mut(&id) {
                s.timer = Some(timer);
            }
        }
    }

    /// Cache entry announcement delivered to a shortcut
    pub(crate) fn shortcut_cache_notify(&mut self, id: ShortcutId, event: NotifyEvent) {
        let Some(installed) = self.shortcuts.get(&id).map(|s| s.route_installed) else {
            return;
        };
        match event {
            NotifyEvent::CacheUp => {
                if !installed {
                    self.shortcut_announce(id, true);
                }
            }
            NotifyEvent::CacheUsed => self.shortcut_check_use(id),
            NotifyEvent::CacheDown | NotifyEvent::CacheDelete => {
                if installed {
                    self.shortcut_announce(id, false);
                }
                if event == NotifyEvent::CacheDelete {
                    self.shortcut_update_binding(id, CacheType::Invalid, None, 0);
                }
            }
            _ => {}
        }
    }

    fn shortcut_check_use(&mut self, id: ShortcutId) {
        let Some(s) = self.shortcuts.get(&id) else {
            return;
        };
        let used = s
            .cache
            .and_then(|c| self.caches.get(&c))
            .is_some_and(|c| c.used);
        if s.expiring && used {
            debug!(component = "shortcut", "{}: in use, renewing", id);
            self.shortcut_send_resolution_req(id);
        }
    }

    pub(crate) fn shortcut_timer(&mut self, id: ShortcutId, action: ShortcutAction, timer: TimerId) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        if s.timer != Some(timer) {
            return;
        }
        s.timer = None;
        match action {
            ShortcutAction::Expire => {
                s.expiring = true;
                let rest = Duration::from_secs(u64::from(s.holding_time) / 3);
                let timer = self.schedule(rest, TimerEvent::Shortcut(id, ShortcutAction::Purge));
                if let Some(s) = self.shortcuts.get_mut(&id) {
                    s.timer = Some(timer);
                }
                self.shortcut_check_use(id);
            }
            ShortcutAction::Purge => self.shortcut_delete(id),
        }
    }

    /// Withdraw and release a shortcut
    pub(crate) fn shortcut_delete(&mut self, id: ShortcutId) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        let mut timer = s.timer.take();
        let reqid = s.reqid.take();
        self.cancel(&mut timer);
        if let Some(reqid) = reqid {
            self.packet_reqids.free(reqid);
        }
        self.shortcut_update_binding(id, CacheType::Invalid, None, 0);
        if let Some(s) = self.shortcuts.remove(&id) {
            self.shortcut_table.remove(&s.prefix);
            debug!(component = "shortcut", "{} ({}) deleted", id, s.prefix);
        }
    }

    /// Purge shortcuts inside a prefix whose route changed
    pub(crate) fn shortcut_prefix_change(&mut self, prefix: &Prefix, deleted: bool) {
        let ids: Vec<_> = self
            .shortcut_table
            .covered_by(prefix)
            .iter()
            .filter_map(|p| self.shortcut_table.get(p).copied())
            .collect();
        for id in ids {
            self.shortcut_purge(id, deleted);
        }
    }

    /// Purge at once when `force`, otherwise renew if used and purge soon after
    pub fn shortcut_purge(&mut self, id: ShortcutId, force: bool) {
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        let mut timer = s.timer.take();
        let reqid = s.reqid.take();
        self.cancel(&mut timer);
        if let Some(reqid) = reqid {
            self.packet_reqids.free(reqid);
        }

        let delay = if force {
            self.config.shortcut_hard_purge
        } else {
            self.config.shortcut_soft_purge
        };
        let timer = self.schedule(delay, TimerEvent::Shortcut(id, ShortcutAction::Purge));
        let Some(s) = self.shortcuts.get_mut(&id) else {
            return;
        };
        s.timer = Some(timer);
        if !force {
            s.expiring = true;
            self.shortcut_check_use(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{drain, enabled_interface, ip, sent, setup, IFINDEX, LOCAL_ADDR};
    use crate::types::InterfaceFlags;
    use bytes::Bytes;
    use nhrp_routing::RibEntry;

    const HUB_ADDR: &str = "10.0.0.254";
    const HUB_NBMA: &str = "192.0.2.254";
    const TARGET: &str = "10.1.2.3";

    fn hub_topology() -> (Nhrp, tokio::sync::mpsc::UnboundedReceiver<Effect>) {
        let (mut nhrp, rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.interface_set_flags(IFINDEX, InterfaceFlags::SHORTCUT).unwrap();
        nhrp.map_static(IFINDEX, ip(HUB_ADDR), ip(HUB_NBMA)).unwrap();
        nhrp.route_update("10.0.0.0/24".parse().unwrap(), Some(RibEntry::connected(IFINDEX)));
        nhrp.route_update("10.1.0.0/16".parse().unwrap(), Some(RibEntry::via(IFINDEX, ip(HUB_ADDR))));
        (nhrp, rx)
    }

    fn resolution_reply(request: &Packet, nbma: &str, holding_time: u16) -> Bytes {
        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::ResolutionReply,
                &request.src_nbma.unwrap(),
                request.src_proto.as_ref(),
                request.dst_proto.as_ref(),
            )
            .unwrap();
        w.set_request_id(hdr, request.header.request_id);
        let mut cie = Cie::new(CieCode::SUCCESS, Some(ip(nbma)), request.dst_proto);
        cie.prefix_length = CIE_PREFIX_HOST;
        cie.holding_time = holding_time;
        w.push_cie(&cie);
        w.complete(hdr).unwrap()
    }

    fn shortcut_routes(effects: &[Effect]) -> Vec<RouteRequest> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Route(r) if r.ifindex.is_none() => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn resolve(nhrp: &mut Nhrp, rx: &mut tokio::sync::mpsc::UnboundedReceiver<Effect>) -> Packet {
        nhrp.shortcut_initiate(ip(TARGET));
        let packets = sent(&drain(rx));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, ip(HUB_NBMA));
        Packet::parse_verified(packets[0].1.clone()).unwrap()
    }

    #[test]
    fn test_resolution_request_layout() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);

        assert_eq!(request.packet_type(), PacketType::ResolutionRequest);
        assert_eq!(request.src_proto, Some(ip(LOCAL_ADDR)));
        assert_eq!(request.dst_proto, Some(ip(TARGET)));
        assert!(request.header.flags.contains(PacketFlags::RESOLUTION_SOURCE_IS_ROUTER));
        assert_ne!(request.header.request_id, 0);
        let extensions: Vec<_> = request
            .extensions()
            .unwrap()
            .into_iter()
            .map(|e| (e.ext_type, e.compulsory))
            .collect();
        assert_eq!(
            extensions,
            vec![
                (ExtensionType::RESPONDER_ADDRESS, true),
                (ExtensionType::FORWARD_TRANSIT_NHS, true),
                (ExtensionType::REVERSE_TRANSIT_NHS, true),
            ]
        );

        let id = nhrp.shortcut_lookup(&Prefix::host(ip(TARGET))).unwrap();
        assert_eq!(nhrp.shortcut(id).unwrap().cache_type, CacheType::Incomplete);
    }

    #[test]
    fn test_incomplete_not_resent() {
        let (mut nhrp, mut rx) = hub_topology();
        resolve(&mut nhrp, &mut rx);
        nhrp.shortcut_initiate(ip(TARGET));
        assert!(sent(&drain(&mut rx)).is_empty());
    }

    #[test]
    fn test_reply_installs_route() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), resolution_reply(&request, "192.0.2.30", 60));

        let routes = shortcut_routes(&drain(&mut rx));
        assert_eq!(routes.len(), 1);
        assert!(routes[0].add);
        assert_eq!(routes[0].prefix, Prefix::host(ip(TARGET)));
        assert_eq!(routes[0].nexthop, Some(ip(TARGET)));

        let cache = nhrp.cache_get(IFINDEX, ip(TARGET), false).unwrap();
        let peer = nhrp.cache(cache).unwrap().cur.peer.unwrap();
        assert_eq!(nhrp.cache(cache).unwrap().cur.cache_type, CacheType::Cached);
        assert_eq!(nhrp.peer(peer).unwrap().remote_nbma, ip("192.0.2.30"));
        assert!(nhrp.packet_reqids.is_empty());
    }

    #[test]
    fn test_unused_shortcut_withdrawn_once() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);
        let t0 = nhrp.now();
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), resolution_reply(&request, "192.0.2.30", 60));
        drain(&mut rx);

        nhrp.run_timers(t0 + Duration::from_secs(40));
        let id = nhrp.shortcut_lookup(&Prefix::host(ip(TARGET))).unwrap();
        assert!(nhrp.shortcut(id).unwrap().expiring);
        assert!(sent(&drain(&mut rx)).is_empty());

        nhrp.run_timers(t0 + Duration::from_secs(60));
        let withdrawn: Vec<_> = shortcut_routes(&drain(&mut rx))
            .into_iter()
            .filter(|r| !r.add)
            .collect();
        assert_eq!(withdrawn.len(), 1);
        assert!(nhrp.shortcut(id).is_none());
    }

    #[test]
    fn test_used_shortcut_renews() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);
        let t0 = nhrp.now();
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), resolution_reply(&request, "192.0.2.30", 60));
        let cache = nhrp.cache_get(IFINDEX, ip(TARGET), false).unwrap();
        nhrp.cache_set_used(cache, true);
        drain(&mut rx);

        nhrp.run_timers(t0 + Duration::from_secs(40));
        let packets = sent(&drain(&mut rx));
        assert_eq!(packets.len(), 1);
        let renewal = Packet::parse_verified(packets[0].1.clone()).unwrap();
        assert_eq!(renewal.dst_proto, Some(ip(TARGET)));
    }

    #[test]
    fn test_unreachable_marks_negative() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);

        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::ErrorIndication,
                &ip(HUB_NBMA),
                Some(&ip(HUB_ADDR)),
                Some(&ip(LOCAL_ADDR)),
            )
            .unwrap();
        w.set_error(hdr, ErrorCode::PROTOCOL_ADDRESS_UNREACHABLE, 0);
        w.put_slice(&request.raw);
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), w.complete(hdr).unwrap());

        let id = nhrp.shortcut_lookup(&Prefix::host(ip(TARGET))).unwrap();
        assert_eq!(nhrp.shortcut(id).unwrap().cache_type, CacheType::Negative);
        let routes = shortcut_routes(&drain(&mut rx));
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].cache_type, CacheType::Negative);
        assert!(routes[0].add);

        nhrp.run_timers(nhrp.now() + nhrp.config().shortcut_settle);
        assert!(nhrp.shortcut(id).is_none());
        let routes = shortcut_routes(&drain(&mut rx));
        assert_eq!(routes.len(), 1);
        assert!(!routes[0].add);
    }

    #[test]
    fn test_route_withdrawal_purges() {
        let (mut nhrp, mut rx) = hub_topology();
        let request = resolve(&mut nhrp, &mut rx);
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), resolution_reply(&request, "192.0.2.30", 60));
        drain(&mut rx);

        nhrp.route_update("10.1.0.0/16".parse().unwrap(), None);
        nhrp.run_timers(nhrp.now() + nhrp.config().shortcut_hard_purge);
        assert!(nhrp.shortcut_lookup(&Prefix::host(ip(TARGET))).is_none());
        let routes = shortcut_routes(&drain(&mut rx));
        assert_eq!(routes.len(), 1);
        assert!(!routes[0].add);
    }

    #[test]
    fn test_no_route_no_request() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.shortcut_initiate(ip(TARGET));
        assert!(sent(&drain(&mut rx)).is_empty());
        assert!(nhrp.packet_reqids.is_empty());
    }

    #[test]
    fn test_shortcut_listing() {
        let (mut nhrp, mut rx) = hub_topology();
        assert!(nhrp.shortcut_foreach().is_empty());

        let request = resolve(&mut nhrp, &mut rx);
        let pending = nhrp.shortcut_foreach();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prefix, Prefix::host(ip(TARGET)));
        assert_eq!(pending[0].cache_type, CacheType::Incomplete);
        assert!(!pending[0].route_installed);

        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), resolution_reply(&request, "192.0.2.30", 60));
        let listed = nhrp.shortcut_foreach();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cache_type, CacheType::Cached);
        assert_eq!(listed[0].nexthop, Some(ip(TARGET)));
        assert!(listed[0].route_installed);
        assert!(!listed[0].expiring);
    }
}
