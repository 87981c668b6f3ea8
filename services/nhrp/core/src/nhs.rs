//! Next hop server registration.
//!
//! Each configured NHS names its NBMA address by host name. The name is
//! resolved through the resolver boundary and every resolved address gets
//! one [`Registration`], which keeps this node's binding registered with
//! that server. A successful reply binds the server's protocol address as
//! an `nhs` cache entry; missing replies back off exponentially and
//! eventually drop the binding.

use bytes::Bytes;
use nhrp_wire::{
    Afi, Cie, CieCode, ExtensionType, Packet, PacketFlags, PacketType, PacketWriter, WireError,
    CIE_PREFIX_HOST,
};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::BindingUpdate;
use crate::dispatch::{push_nat_extension, push_request_extensions};
use crate::effects::Effect;
use crate::error::{NhrpError, Result};
use crate::interface::afi_index;
use crate::timer::TimerId;
use crate::types::{
    CacheType, Establish, InterfaceFlags, NhsId, NotifyEvent, PacketWaiter, PeerId, RegAction,
    RegId, Subscriber, TimerEvent,
};
use crate::Nhrp;

/// Timeout of the first registration attempt, seconds
const REG_TIMEOUT_INITIAL: u32 = 1;
/// Timeout after a successful registration, seconds
const REG_TIMEOUT_REFRESH: u32 = 2;
/// Backoff at which the server's binding is dropped
const REG_TIMEOUT_INVALIDATE: u32 = 16;
/// Largest backoff before starting over
const REG_TIMEOUT_MAX: u32 = 64;

/// Configured next hop server
#[derive(Debug, Clone)]
pub struct Nhs {
    /// Interface
    pub ifindex: u32,
    /// Protocol family served
    pub afi: Afi,
    /// Server protocol address; learned from the reply when unset
    pub proto: Option<IpAddr>,
    /// NBMA host name or literal address
    pub nbma_fqdn: String,
    /// One of the resolved addresses is our own
    pub hub: bool,
    /// Registrations, one per resolved address
    pub registrations: Vec<RegId>,
    pub(crate) timer: Option<TimerId>,
    pub(crate) resolve_id: Option<u32>,
}

/// Registration with one resolved NHS address
#[derive(Debug, Clone)]
pub struct Registration {
    /// Owning server
    pub nhs: NhsId,
    /// Peer of the resolved NBMA address
    pub peer: PeerId,
    /// Server protocol address confirmed by the last reply
    pub proto_addr: Option<IpAddr>,
    /// Current reply timeout, seconds
    pub timeout: u32,
    pub(crate) reqid: Option<u32>,
    pub(crate) timer: Option<TimerId>,
    mark: bool,
}

/// Listing of one registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationSnapshot {
    /// NBMA address registered with
    pub nbma: IpAddr,
    /// Confirmed server protocol address
    pub proto_addr: Option<IpAddr>,
    /// Peer online
    pub online: bool,
    /// Reply timeout, seconds
    pub timeout: u32,
}

/// Listing of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NhsSnapshot {
    /// Interface
    pub ifindex: u32,
    /// Protocol family
    pub afi: Afi,
    /// Configured protocol address
    pub proto: Option<IpAddr>,
    /// NBMA host name
    pub nbma_fqdn: String,
    /// Hub
    pub hub: bool,
    /// Registrations
    pub registrations: Vec<RegistrationSnapshot>,
}

impl Nhrp {
    /// Look up a server
    pub fn nhs(&self, id: NhsId) -> Option<&Nhs> {
        self.nhs.get(&id)
    }

    /// Look up a registration
    pub fn registration(&self, id: RegId) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    /// Snapshot of every server and its registrations
    pub fn nhs_foreach(&self) -> Vec<NhsSnapshot> {
        let mut out: Vec<_> = self
            .nhs
            .values()
            .map(|nhs| NhsSnapshot {
                ifindex: nhs.ifindex,
                afi: nhs.afi,
                proto: nhs.proto,
                nbma_fqdn: nhs.nbma_fqdn.clone(),
                hub: nhs.hub,
                registrations: nhs
                    .registrations
                    .iter()
                    .filter_map(|r| self.registrations.get(r))
                    .filter_map(|r| {
                        let peer = self.peers.get(&r.peer)?;
                        Some(RegistrationSnapshot {
                            nbma: peer.remote_nbma,
                            proto_addr: r.proto_addr,
                            online: peer.online,
                            timeout: r.timeout,
                        })
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| (a.ifindex, &a.nbma_fqdn).cmp(&(b.ifindex, &b.nbma_fqdn)));
        out
    }

    /// Configure a next hop server on an interface
    pub fn nhs_add(
        &mut self,
        ifindex: u32,
        afi: Afi,
        proto: Option<IpAddr>,
        nbma_fqdn: &str,
    ) -> Result<NhsId> {
        let Some(iface) = self.interfaces.get(&ifindex) else {
            return Err(NhrpError::UnsupportedInterface(ifindex));
        };
        if proto.is_some_and(|p| Afi::of(&p) != afi) {
            return Err(NhrpError::AddressMismatch);
        }
        let exists = iface.nhs(afi).iter().filter_map(|id| self.nhs.get(id)).any(|nhs| {
            nhs.proto == proto && nhs.nbma_fqdn == nbma_fqdn
        });
        if exists {
            return Err(NhrpError::EntryExists);
        }

        let id = NhsId(self.alloc_id());
        let timer = self.schedule(self.config.resolve_initial, TimerEvent::NhsResolve(id));
        self.nhs.insert(
            id,
            Nhs {
                ifindex,
                afi,
                proto,
                nbma_fqdn: nbma_fqdn.to_string(),
                hub: false,
                registrations: Vec::new(),
                timer: Some(timer),
                resolve_id: None,
            },
        );
        if let Some(iface) = self.interfaces.get_mut(&ifindex) {
            iface.afi[afi_index(afi)].nhs.push(id);
        }
        info!(component = "nhs", "{} added on {}: {:?} at {}", id, ifindex, proto, nbma_fqdn);
        Ok(id)
    }

    /// Remove a configured next hop server
    pub fn nhs_del(
        &mut self,
        ifindex: u32,
        afi: Afi,
        proto: Option<IpAddr>,
        nbma_fqdn: &str,
    ) -> Result<()> {
        let found = self
            .interfaces
            .get(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?
            .nhs(afi)
            .iter()
            .copied()
            .find(|id| {
                self.nhs
                    .get(id)
                    .is_some_and(|nhs| nhs.proto == proto && nhs.nbma_fqdn == nbma_fqdn)
            });
        match found {
            Some(id) => {
                self.nhs_free(id);
                Ok(())
            }
            None => Err(NhrpError::NotFound),
        }
    }

    /// Drop a server with its registrations and pending lookups
    pub(crate) fn nhs_free(&mut self, id: NhsId) {
        let Some(mut nhs) = self.nhs.remove(&id) else {
            return;
        };
        for reg in nhs.registrations.drain(..) {
            self.reg_delete(reg);
        }
        self.cancel(&mut nhs.timer);
        if let Some(resolve_id) = nhs.resolve_id.take() {
            self.resolver_reqids.free(resolve_id);
        }
        if let Some(iface) = self.interfaces.get_mut(&nhs.ifindex) {
            iface.afi[afi_index(nhs.afi)].nhs.retain(|n| *n != id);
        }
        info!(component = "nhs", "{} ({}) removed", id, nhs.nbma_fqdn);
    }

    pub(crate) fn nhs_resolve(&mut self, id: NhsId, timer: TimerId) {
        let Some(nhs) = self.nhs.get_mut(&id) else {
            return;
        };
        if nhs.timer != Some(timer) {
            return;
        }
        nhs.timer = None;
        let old = nhs.resolve_id.take();
        let hostname = nhs.nbma_fqdn.clone();
        let ifindex = nhs.ifindex;
        if let Some(old) = old {
            self.resolver_reqids.free(old);
        }

        let afi = self
            .interfaces
            .get(&ifindex)
            .and_then(|iface| iface.nbma)
            .map(|nbma| Afi::of(&nbma))
            .unwrap_or(Afi::Ipv4);
        let resolve_id = self.resolver_reqids.allocate(id);
        if let Some(nhs) = self.nhs.get_mut(&id) {
            nhs.resolve_id = Some(resolve_id);
        }
        debug!(component = "nhs", "{}: resolving {}", id, hostname);
        self.emit(Effect::Resolve {
            id: resolve_id,
            afi,
            hostname,
        });
    }

    /// Deliver the addresses a resolver request produced; empty means failure
    pub fn resolve_result(&mut self, resolve_id: u32, addrs: &[IpAddr]) {
        let Some(id) = self.resolver_reqids.free(resolve_id) else {
            debug!(component = "nhs", "Unknown resolver request {}", resolve_id);
            return;
        };
        let Some(nhs) = self.nhs.get_mut(&id) else {
            return;
        };
        if nhs.resolve_id != Some(resolve_id) {
            return;
        }
        nhs.resolve_id = None;
        let ifindex = nhs.ifindex;
        let hostname = nhs.nbma_fqdn.clone();
        let mut timer = nhs.timer.take();
        self.cancel(&mut timer);

        if addrs.is_empty() {
            warn!(component = "nhs", "{}: failed to resolve {}", id, hostname);
            let timer = self.schedule(self.config.resolve_retry, TimerEvent::NhsResolve(id));
            if let Some(nhs) = self.nhs.get_mut(&id) {
                nhs.timer = Some(timer);
            }
            return;
        }

        let timer = self.schedule(self.config.resolve_refresh, TimerEvent::NhsResolve(id));
        let regs = match self.nhs.get_mut(&id) {
            Some(nhs) => {
                nhs.timer = Some(timer);
                nhs.hub = false;
                nhs.registrations.clone()
            }
            None => return,
        };
        for reg in &regs {
            if let Some(r) = self.registrations.get_mut(reg) {
                r.mark = true;
            }
        }

        let own_nbma = self.interfaces.get(&ifindex).and_then(|iface| iface.nbma);
        let family = own_nbma.map(|nbma| Afi::of(&nbma));
        for addr in addrs {
            if family.is_some_and(|f| f != Afi::of(addr)) {
                continue;
            }
            let existing = regs.iter().copied().find(|reg| {
                self.registrations
                    .get(reg)
                    .and_then(|r| self.peers.get(&r.peer))
                    .is_some_and(|p| p.remote_nbma == *addr)
            });
            if let Some(reg) = existing {
                if let Some(r) = self.registrations.get_mut(&reg) {
                    r.mark = false;
                }
                continue;
            }
            if own_nbma == Some(*addr) {
                debug!(component = "nhs", "{}: {} is our own address, acting as hub", id, addr);
                if let Some(nhs) = self.nhs.get_mut(&id) {
                    nhs.hub = true;
                }
                continue;
            }
            self.reg_create(id, ifindex, *addr);
        }

        let stale: Vec<RegId> = regs
            .into_iter()
            .filter(|reg| self.registrations.get(reg).is_some_and(|r| r.mark))
            .collect();
        for reg in stale {
            if let Some(nhs) = self.nhs.get_mut(&id) {
                nhs.registrations.retain(|r| *r != reg);
            }
            self.reg_delete(reg);
        }
    }

    fn reg_create(&mut self, nhs: NhsId, ifindex: u32, nbma: IpAddr) {
        let Some(peer) = self.peer_get(ifindex, nbma) else {
            return;
        };
        let id = RegId(self.alloc_id());
        let timer = self.schedule(self.config.reg_initial_delay, TimerEvent::Registration(id, RegAction::Send));
        self.registrations.insert(
            id,
            Registration {
                nhs,
                peer,
                proto_addr: None,
                timeout: REG_TIMEOUT_INITIAL,
                reqid: None,
                timer: Some(timer),
                mark: false,
            },
        );
        self.peer_subscribe(peer, Subscriber::Registration(id));
        if let Some(n) = self.nhs.get_mut(&nhs) {
            n.registrations.push(id);
        }
        debug!(component = "nhs", "{}: registering with {}", nhs, nbma);
    }

    fn reg_delete(&mut self, id: RegId) {
        let Some(mut r) = self.registrations.remove(&id) else {
            return;
        };
        self.cancel(&mut r.timer);
        if let Some(reqid) = r.reqid.take() {
            self.packet_reqids.free(reqid);
        }
        self.peer_unsubscribe(r.peer, Subscriber::Registration(id));
        self.peer_unref(r.peer);
        debug!(component = "nhs", "{} deleted", id);
    }

    fn reg_rearm(&mut self, id: RegId, after: Duration, action: RegAction) {
        let Some(r) = self.registrations.get_mut(&id) else {
            return;
        };
        let mut old = r.timer.take();
        self.cancel(&mut old);
        let timer = self.schedule(after, TimerEvent::Registration(id, action));
        if let Some(r) = self.registrations.get_mut(&id) {
            r.timer = Some(timer);
        }
    }

    pub(crate) fn reg_timer(&mut self, id: RegId, action: RegAction, timer: TimerId) {
        let Some(r) = self.registrations.get_mut(&id) else {
            return;
        };
        if r.timer != Some(timer) {
            return;
        }
        r.timer = None;
        match action {
            RegAction::Send => self.reg_send(id),
            RegAction::Timeout => self.reg_timeout(id),
        }
    }

    fn reg_send(&mut self, id: RegId) {
        let Some((peer, nhs, timeout)) = self.registrations.get(&id).map(|r| (r.peer, r.nhs, r.timeout)) else {
            return;
        };
        if !self.peer_check(peer, Establish::Priority) {
            debug!(component = "nhs", "{}: peer not online, waiting", id);
            self.reg_rearm(id, self.config.reg_link_wait, RegAction::Send);
            return;
        }
        self.reg_rearm(id, Duration::from_secs(u64::from(timeout)), RegAction::Timeout);

        let reqid = match self.registrations.get(&id).and_then(|r| r.reqid) {
            Some(reqid) => reqid,
            None => self.packet_reqids.allocate(PacketWaiter::Registration(id)),
        };
        if let Some(r) = self.registrations.get_mut(&id) {
            r.reqid = Some(reqid);
        }

        match self.build_registration_req(nhs, reqid) {
            Ok(Some(packet)) => {
                debug!(component = "nhs", "{}: sending registration (reqid {}, timeout {}s)", id, reqid, timeout);
                self.peer_send(peer, packet);
            }
            Ok(None) => debug!(component = "nhs", "{}: interface not ready", id),
            Err(e) => warn!(component = "nhs", "{}: failed to build registration: {}", id, e),
        }
    }

    fn build_registration_req(&self, nhs: NhsId, reqid: u32) -> std::result::Result<Option<Bytes>, WireError> {
        let Some(nhs) = self.nhs.get(&nhs) else {
            return Ok(None);
        };
        let Some(iface) = self.interfaces.get(&nhs.ifindex) else {
            return Ok(None);
        };
        let (Some(nbma), Some(addr)) = (iface.nbma, iface.address(nhs.afi)) else {
            return Ok(None);
        };
        let dst_proto = nhs.proto.unwrap_or(addr);
        let no_unique = iface.flags.contains(InterfaceFlags::REG_NO_UNIQUE);

        let mut w = PacketWriter::new();
        let hdr = w.push_header(PacketType::RegistrationRequest, &nbma, Some(&addr), Some(&dst_proto))?;
        w.set_hop_count(hdr, 1);
        let mut flags = PacketFlags::REGISTRATION_NAT;
        if !no_unique {
            flags |= PacketFlags::REGISTRATION_UNIQUE;
        }
        w.set_flags(hdr, flags);
        w.set_request_id(hdr, reqid);

        let mut cie = Cie::new(CieCode::SUCCESS, None, None);
        cie.prefix_length = if no_unique {
            nhs.afi.host_prefix_len()
        } else {
            CIE_PREFIX_HOST
        };
        cie.holding_time = iface.holdtime;
        cie.mtu = iface.mtu;
        w.push_cie(&cie);

        push_request_extensions(&mut w, hdr)?;
        let mut nat_cie = Cie::new(CieCode::SUCCESS, Some(nbma), Some(addr));
        nat_cie.prefix_length = CIE_PREFIX_HOST;
        push_nat_extension(&mut w, hdr, &[nat_cie])?;
        w.complete(hdr).map(Some)
    }

    /// Reply or error indication for a registration request
    pub(crate) fn reg_recv_reply(&mut self, id: RegId, packet: &Packet) {
        let Some(r) = self.registrations.get_mut(&id) else {
            return;
        };
        let reqid = r.reqid.take();
        let (peer, nhs) = (r.peer, r.nhs);
        if let Some(reqid) = reqid {
            self.packet_reqids.free(reqid);
        }

        if packet.packet_type() != PacketType::RegistrationReply {
            info!(
                component = "nhs",
                "{}: registration failed ({})", id, packet.packet_type().name()
            );
            return;
        }

        let Some((ifindex, hub)) = self.nhs.get(&nhs).map(|n| (n.ifindex, n.hub)) else {
            return;
        };
        if let Err(e) = self.reg_learn(id, ifindex, hub, peer, packet) {
            debug!(component = "nhs", "{}: bad registration reply: {}", id, e);
        }
    }

    fn reg_learn(
        &mut self,
        id: RegId,
        ifindex: u32,
        hub: bool,
        peer: PeerId,
        packet: &Packet,
    ) -> std::result::Result<(), WireError> {
        for cie in packet.cies()? {
            let accepted = cie.code == CieCode::SUCCESS
                || (hub && cie.code == CieCode::ADMINISTRATIVELY_PROHIBITED);
            if !accepted {
                info!(component = "nhs", "{}: registration rejected, code {}", id, cie.code.0);
                return Ok(());
            }
        }

        let nat_nbma = match packet.extension(ExtensionType::NAT_ADDRESS)? {
            Some(ext) => ext
                .cies(packet.nbma_afi, packet.proto_afi)?
                .get(1)
                .and_then(|cie| cie.nbma),
            None => None,
        };
        self.interface_set_nat_nbma(ifindex, nat_nbma);

        let Some(holdtime) = self.interfaces.get(&ifindex).map(|i| i.holdtime) else {
            return Ok(());
        };
        let Some(proto) = packet.dst_proto else {
            return Ok(());
        };
        if let Some(r) = self.registrations.get_mut(&id) {
            r.timeout = REG_TIMEOUT_REFRESH;
            r.proto_addr = Some(proto);
        }
        self.reg_rearm(id, Duration::from_secs(u64::from(holdtime) / 3), RegAction::Send);
        info!(component = "nhs", "{}: registered with {}", id, proto);

        if let Some(cache) = self.cache_get(ifindex, proto, true) {
            let update = BindingUpdate::new(CacheType::Nhs, u32::from(holdtime)).with_peer(self.peer_ref(peer));
            if let Err(e) = self.cache_update_binding(cache, update) {
                debug!(component = "nhs", "{}: binding {} failed: {}", id, proto, e);
            }
        }
        Ok(())
    }

    fn reg_timeout(&mut self, id: RegId) {
        let Some(r) = self.registrations.get(&id) else {
            return;
        };
        let (timeout, proto, nhs) = (r.timeout, r.proto_addr, r.nhs);

        if timeout >= REG_TIMEOUT_INVALIDATE {
            if let Some(proto) = proto {
                debug!(component = "nhs", "{}: no reply from {}, dropping binding", id, proto);
                let reqid = self.registrations.get_mut(&id).and_then(|r| {
                    r.proto_addr = None;
                    r.reqid.take()
                });
                if let Some(reqid) = reqid {
                    self.packet_reqids.free(reqid);
                }
                let ifindex = self.nhs.get(&nhs).map(|n| n.ifindex);
                let cache = ifindex.and_then(|ifindex| self.cache_get(ifindex, proto, false));
                if let Some(cache) = cache {
                    if self.caches.get(&cache).is_some_and(|c| c.cur.cache_type <= CacheType::Nhs) {
                        self.cache_invalidate(cache);
                    }
                }
            }
        }

        if let Some(r) = self.registrations.get_mut(&id) {
            r.timeout <<= 1;
            if r.timeout > REG_TIMEOUT_MAX {
                r.timeout = REG_TIMEOUT_REFRESH;
            }
            debug!(component = "nhs", "{}: timed out, next timeout {}s", id, r.timeout);
        }
        self.reg_rearm(id, self.config.reg_flush_delay, RegAction::Send);
    }

    /// Peer announcement delivered to a registration
    pub(crate) fn reg_peer_notify(&mut self, id: RegId, event: NotifyEvent) {
        match event {
            NotifyEvent::PeerUp | NotifyEvent::PeerDown | NotifyEvent::PeerIfconfigChanged => {
                debug!(component = "nhs", "{}: peer changed, flushing", id);
                self.reg_rearm(id, self.config.reg_flush_delay, RegAction::Send);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{drain, enabled_interface, ip, sent, setup, IFINDEX, LOCAL_ADDR, LOCAL_NBMA};
    use tokio::sync::mpsc::UnboundedReceiver;

    const HUB_ADDR: &str = "10.0.0.254";
    const HUB_NBMA: &str = "192.0.2.254";

    fn resolve_request(effects: &[Effect]) -> Option<(u32, String)> {
        effects.iter().find_map(|e| match e {
            Effect::Resolve { id, hostname, .. } => Some((*id, hostname.clone())),
            _ => None,
        })
    }

    /// NHS configured and resolved to `HUB_NBMA`, first registration sent
    fn registered_nhs(nhrp: &mut Nhrp, rx: &mut UnboundedReceiver<Effect>) -> (NhsId, Packet) {
        let nhs = nhrp
            .nhs_add(IFINDEX, Afi::Ipv4, Some(ip(HUB_ADDR)), "hub.example.net")
            .unwrap();
        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_initial);
        let (id, hostname) = resolve_request(&drain(rx)).unwrap();
        assert_eq!(hostname, "hub.example.net");

        nhrp.resolve_result(id, &[ip(HUB_NBMA)]);
        nhrp.run_timers(nhrp.now() + nhrp.config().reg_initial_delay);
        let packets = sent(&drain(rx));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, ip(HUB_NBMA));
        (nhs, Packet::parse_verified(packets[0].1.clone()).unwrap())
    }

    fn registration_reply(request: &Packet, nat_nbma: Option<&str>) -> Bytes {
        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::RegistrationReply,
                &request.src_nbma.unwrap(),
                request.src_proto.as_ref(),
                request.dst_proto.as_ref(),
            )
            .unwrap();
        w.set_request_id(hdr, request.header.request_id);
        let mut cie = Cie::new(CieCode::SUCCESS, None, None);
        cie.prefix_length = CIE_PREFIX_HOST;
        cie.holding_time = 7200;
        w.push_cie(&cie);
        if let Some(nat) = nat_nbma {
            let ext = w.push_extension(hdr, ExtensionType::NAT_ADDRESS, false).unwrap();
            w.push_cie(&Cie::new(CieCode::SUCCESS, request.src_nbma, request.src_proto));
            w.push_cie(&Cie::new(CieCode::SUCCESS, Some(ip(nat)), request.src_proto));
            w.complete_extension(ext).unwrap();
        }
        w.complete(hdr).unwrap()
    }

    fn only_registration(nhrp: &Nhrp, nhs: NhsId) -> RegId {
        let regs = &nhrp.nhs(nhs).unwrap().registrations;
        assert_eq!(regs.len(), 1);
        regs[0]
    }

    #[test]
    fn test_add_errors() {
        let (mut nhrp, _rx) = setup();
        assert_eq!(
            nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "hub"),
            Err(NhrpError::UnsupportedInterface(IFINDEX))
        );
        enabled_interface(&mut nhrp);
        assert_eq!(
            nhrp.nhs_add(IFINDEX, Afi::Ipv4, Some(ip("fd00::1")), "hub"),
            Err(NhrpError::AddressMismatch)
        );
        nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "hub").unwrap();
        assert_eq!(
            nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "hub"),
            Err(NhrpError::EntryExists)
        );
        assert_eq!(
            nhrp.nhs_del(IFINDEX, Afi::Ipv4, None, "other"),
            Err(NhrpError::NotFound)
        );
    }

    #[test]
    fn test_registration_request_layout() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let (_, request) = registered_nhs(&mut nhrp, &mut rx);

        assert_eq!(request.packet_type(), PacketType::RegistrationRequest);
        assert_eq!(request.header.hop_count, 1);
        assert_eq!(
            request.header.flags,
            PacketFlags::REGISTRATION_UNIQUE | PacketFlags::REGISTRATION_NAT
        );
        assert_eq!(request.src_nbma, Some(ip(LOCAL_NBMA)));
        assert_eq!(request.src_proto, Some(ip(LOCAL_ADDR)));
        assert_eq!(request.dst_proto, Some(ip(HUB_ADDR)));

        let cies = request.cies().unwrap();
        assert_eq!(cies.len(), 1);
        assert_eq!(cies[0].prefix_length, CIE_PREFIX_HOST);
        assert_eq!(cies[0].holding_time, 7200);

        let nat = request.extension(ExtensionType::NAT_ADDRESS).unwrap().unwrap();
        let nat_cies = nat.cies(request.nbma_afi, request.proto_afi).unwrap();
        assert_eq!(nat_cies[0].nbma, Some(ip(LOCAL_NBMA)));
        assert_eq!(nat_cies[0].protocol, Some(ip(LOCAL_ADDR)));
    }

    #[test]
    fn test_no_unique_registration() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.interface_set_flags(IFINDEX, InterfaceFlags::REG_NO_UNIQUE).unwrap();
        let (_, request) = registered_nhs(&mut nhrp, &mut rx);
        assert_eq!(request.header.flags, PacketFlags::REGISTRATION_NAT);
        assert_eq!(request.cies().unwrap()[0].prefix_length, 32);
    }

    #[test]
    fn test_reply_binds_nhs_and_refreshes() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let (nhs, request) = registered_nhs(&mut nhrp, &mut rx);
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), registration_reply(&request, Some("203.0.113.9")));

        let reg = only_registration(&nhrp, nhs);
        let r = nhrp.registration(reg).unwrap();
        assert_eq!(r.timeout, 2);
        assert_eq!(r.proto_addr, Some(ip(HUB_ADDR)));
        assert!(nhrp.packet_reqids.is_empty());
        assert_eq!(nhrp.interface(IFINDEX).unwrap().nat_nbma, Some(ip("203.0.113.9")));

        let cache = nhrp.cache_get(IFINDEX, ip(HUB_ADDR), false).unwrap();
        let entry = nhrp.cache(cache).unwrap();
        assert_eq!(entry.cur.cache_type, CacheType::Nhs);
        assert_eq!(nhrp.peer(entry.cur.peer.unwrap()).unwrap().remote_nbma, ip(HUB_NBMA));
        drain(&mut rx);

        nhrp.run_timers(nhrp.now() + Duration::from_secs(7200 / 3));
        let packets = sent(&drain(&mut rx));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, ip(HUB_NBMA));
    }

    #[test]
    fn test_rejected_registration_not_bound() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let (nhs, request) = registered_nhs(&mut nhrp, &mut rx);

        let mut w = PacketWriter::new();
        let hdr = w
            .push_header(
                PacketType::RegistrationReply,
                &request.src_nbma.unwrap(),
                request.src_proto.as_ref(),
                request.dst_proto.as_ref(),
            )
            .unwrap();
        w.set_request_id(hdr, request.header.request_id);
        w.push_cie(&Cie::new(CieCode::ADMINISTRATIVELY_PROHIBITED, None, None));
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), w.complete(hdr).unwrap());

        let reg = only_registration(&nhrp, nhs);
        assert_eq!(nhrp.registration(reg).unwrap().proto_addr, None);
        assert!(nhrp.cache_get(IFINDEX, ip(HUB_ADDR), false).is_none());
    }

    #[test]
    fn test_timeouts_back_off_and_drop_binding() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let (nhs, request) = registered_nhs(&mut nhrp, &mut rx);
        nhrp.recv_packet(IFINDEX, ip(HUB_NBMA), registration_reply(&request, None));
        let reg = only_registration(&nhrp, nhs);

        let mut timeouts = Vec::new();
        for _ in 0..32 {
            if nhrp.registration(reg).unwrap().proto_addr.is_none() {
                break;
            }
            let before = nhrp.registration(reg).unwrap().timeout;
            let deadline = nhrp.next_deadline().unwrap();
            nhrp.run_timers(deadline);
            let after = nhrp.registration(reg).unwrap().timeout;
            if after != before {
                timeouts.push(after);
            }
        }
        assert_eq!(timeouts, vec![4, 8, 16, 32]);
        assert_eq!(nhrp.registration(reg).unwrap().proto_addr, None);
        let cache = nhrp.cache_get(IFINDEX, ip(HUB_ADDR), false);
        assert!(cache.map_or(true, |c| nhrp.cache(c).unwrap().cur.cache_type == CacheType::Invalid));
    }

    #[test]
    fn test_own_address_marks_hub() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let nhs = nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "hubs.example.net").unwrap();
        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_initial);
        let (id, _) = resolve_request(&drain(&mut rx)).unwrap();

        nhrp.resolve_result(id, &[ip(LOCAL_NBMA), ip(HUB_NBMA)]);
        assert!(nhrp.nhs(nhs).unwrap().hub);
        let reg = only_registration(&nhrp, nhs);
        let peer = nhrp.registration(reg).unwrap().peer;
        assert_eq!(nhrp.peer(peer).unwrap().remote_nbma, ip(HUB_NBMA));
    }

    #[test]
    fn test_refresh_replaces_stale_registrations() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let nhs = nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "hubs.example.net").unwrap();
        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_initial);
        let (id, _) = resolve_request(&drain(&mut rx)).unwrap();
        nhrp.resolve_result(id, &[ip("192.0.2.10"), ip("192.0.2.11")]);
        assert_eq!(nhrp.nhs(nhs).unwrap().registrations.len(), 2);

        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_refresh);
        let (id, _) = resolve_request(&drain(&mut rx)).unwrap();
        nhrp.resolve_result(id, &[ip("192.0.2.11"), ip("192.0.2.12")]);

        let nbmas: Vec<_> = nhrp.nhs_foreach()[0]
            .registrations
            .iter()
            .map(|r| r.nbma)
            .collect();
        assert_eq!(nbmas, vec![ip("192.0.2.11"), ip("192.0.2.12")]);
        assert!(nhrp.peer_lookup(IFINDEX, ip("192.0.2.10")).is_none());
    }

    #[test]
    fn test_failed_resolution_retries() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.nhs_add(IFINDEX, Afi::Ipv4, None, "missing.example.net").unwrap();
        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_initial);
        let (id, _) = resolve_request(&drain(&mut rx)).unwrap();

        nhrp.resolve_result(id, &[]);
        assert!(resolve_request(&drain(&mut rx)).is_none());
        nhrp.run_timers(nhrp.now() + nhrp.config().resolve_retry);
        assert!(resolve_request(&drain(&mut rx)).is_some());

        // stale answers are ignored
        nhrp.resolve_result(id, &[ip(HUB_NBMA)]);
        assert!(nhrp.registrations.is_empty());
    }

    #[test]
    fn test_delete_releases_registrations() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let (nhs, _) = registered_nhs(&mut nhrp, &mut rx);
        assert!(!nhrp.packet_reqids.is_empty());

        nhrp.nhs_del(IFINDEX, Afi::Ipv4, Some(ip(HUB_ADDR)), "hub.example.net").unwrap();
        assert!(nhrp.nhs(nhs).is_none());
        assert!(nhrp.registrations.is_empty());
        assert!(nhrp.packet_reqids.is_empty());
        assert!(nhrp.interface(IFINDEX).unwrap().nhs(Afi::Ipv4).is_empty());
        assert!(nhrp.peer_lookup(IFINDEX, ip(HUB_NBMA)).is_none());
    }
}
