//! Address resolution cache.
//!
//! Each entry maps a protocol address on an interface to the peer it is
//! reached through. An entry carries two bindings: `cur`, which drives
//! routes and notifications, and `new`, a learned binding waiting for its
//! peer to come online and for authorization. Promotion replaces `cur`
//! with `new` in one step and only then notifies subscribers.

use nhrp_routing::Prefix;
use serde::Serialize;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::effects::{Effect, RouteRequest};
use crate::error::{NhrpError, Result};
use crate::notifier::NotifierList;
use crate::timer::TimerId;
use crate::types::{CacheId, CacheType, Establish, NotifierOwner, NotifyEvent, PeerId, Subscriber, TimerEvent};
use crate::Nhrp;

/// Event result that accepts a binding
pub const EVENT_ACCEPT: &str = "accept";

/// One binding snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Binding type
    pub cache_type: CacheType,
    /// NBMA address to bind when it differs from the peer's
    pub nbma_natoa: Option<IpAddr>,
    /// Peer, holding a reference
    pub peer: Option<PeerId>,
    /// Expiry; `None` never expires
    pub expires: Option<Instant>,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Invalid,
            nbma_natoa: None,
            peer: None,
            expires: None,
        }
    }
}

/// Cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Interface index
    pub ifindex: u32,
    /// Protocol address
    pub protocol: IpAddr,
    /// Configured by the administrator
    pub mapped: bool,
    /// Traffic used the entry since it was last re-resolved
    pub used: bool,
    /// Host route and neighbour binding installed
    pub route_installed: bool,
    /// Current binding
    pub cur: Binding,
    /// Pending binding
    pub new: Binding,
    pub(crate) timeout: Option<TimerId>,
    pub(crate) auth: Option<TimerId>,
    pub(crate) event_id: Option<u32>,
    pub(crate) notifiers: NotifierList<Subscriber>,
}

/// Requested binding change
///
/// The caller transfers one peer reference, if any, to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingUpdate {
    /// New type
    pub cache_type: CacheType,
    /// Holding time in seconds; 0 never expires
    pub holding_time: u32,
    /// Peer, with a reference owned by the update
    pub peer: Option<PeerId>,
    /// NBMA address to bind instead of the peer's
    pub nbma_natoa: Option<IpAddr>,
    /// Claimed protocol address; must match the entry
    pub protocol: Option<IpAddr>,
}

impl BindingUpdate {
    /// Update without a peer
    pub fn new(cache_type: CacheType, holding_time: u32) -> Self {
        Self {
            cache_type,
            holding_time,
            peer: None,
            nbma_natoa: None,
            protocol: None,
        }
    }

    /// Attach a peer reference
    pub fn with_peer(mut self, peer: Option<PeerId>) -> Self {
        self.peer = peer;
        self
    }

    /// NBMA address override
    pub fn with_natoa(mut self, nbma_natoa: Option<IpAddr>) -> Self {
        self.nbma_natoa = nbma_natoa;
        self
    }

    /// Claimed protocol address
    pub fn with_protocol(mut self, protocol: IpAddr) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

/// Outcome of [`Nhrp::cache_update_binding`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    /// The binding is now current
    Promoted,
    /// The current binding was refreshed
    Refreshed,
    /// Waiting for the peer or for authorization
    Pending,
    /// A binding of higher authority is in place
    Refused,
}

/// Listing of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    /// Interface index
    pub ifindex: u32,
    /// Binding type
    pub cache_type: CacheType,
    /// Protocol address
    pub protocol: IpAddr,
    /// NBMA address bound
    pub nbma: Option<IpAddr>,
    /// NAT-OA override
    pub nbma_natoa: Option<IpAddr>,
    /// Peer online
    pub online: bool,
    /// Traffic used the entry
    pub used: bool,
    /// Configured by the administrator
    pub mapped: bool,
    /// Remaining holding time
    pub remaining: Option<Duration>,
}

/// Number of entries per current type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheCounts(pub [usize; CacheType::ALL.len()]);

impl CacheCounts {
    /// Entries of one type
    pub fn get(&self, cache_type: CacheType) -> usize {
        self.0[cache_type.index()]
    }

    /// All entries
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

impl Nhrp {
    /// Find the entry for an address, creating an invalid one on demand
    pub fn cache_get(&mut self, ifindex: u32, addr: IpAddr, create: bool) -> Option<CacheId> {
        if let Some(id) = self.cache_index.get(&(ifindex, addr)) {
            return Some(*id);
        }
        if !create || !self.interfaces.contains_key(&ifindex) {
            return None;
        }
        let id = CacheId(self.alloc_id());
        self.caches.insert(
            id,
            CacheEntry {
                ifindex,
                protocol: addr,
                mapped: false,
                used: false,
                route_installed: false,
                cur: Binding::default(),
                new: Binding::default(),
                timeout: None,
                auth: None,
                event_id: None,
                notifiers: NotifierList::new(),
            },
        );
        self.cache_index.insert((ifindex, addr), id);
        self.cache_counts[CacheType::Invalid.index()] += 1;
        debug!(component = "cache", "{} created for {} on {}", id, addr, ifindex);
        Some(id)
    }

    /// Look up an entry
    pub fn cache(&self, id: CacheId) -> Option<&CacheEntry> {
        self.caches.get(&id)
    }

    /// Entry counts by current type
    pub fn cache_counts(&self) -> CacheCounts {
        CacheCounts(self.cache_counts)
    }

    /// Snapshot of the entries of an interface, ordered by address
    pub fn cache_foreach(&self, ifindex: u32) -> Vec<CacheSnapshot> {
        let mut out: Vec<_> = self
            .caches
            .values()
            .filter(|c| c.ifindex == ifindex)
            .map(|c| {
                let peer = c.cur.peer.and_then(|p| self.peers.get(&p));
                CacheSnapshot {
                    ifindex: c.ifindex,
                    cache_type: c.cur.cache_type,
                    protocol: c.protocol,
                    nbma: peer.map(|p| p.remote_nbma),
                    nbma_natoa: c.cur.nbma_natoa,
                    online: peer.is_some_and(|p| p.online),
                    used: c.used,
                    mapped: c.mapped,
                    remaining: c.cur.expires.map(|e| e.saturating_duration_since(self.now)),
                }
            })
            .collect();
        out.sort_by_key(|c| c.protocol);
        out
    }

    /// Offer a binding to an entry
    ///
    /// A binding of lower authority than the current or pending one is
    /// refused. The same type and peer only refreshes the expiry. Learned
    /// bindings wait for their peer to come online and for authorization;
    /// everything else is promoted at once.
    pub fn cache_update_binding(&mut self, id: CacheId, update: BindingUpdate) -> Result<BindingStatus> {
        let Some(c) = self.caches.get_mut(&id) else {
            if let Some(peer) = update.peer {
                self.peer_unref(peer);
            }
            return Err(NhrpError::NotFound);
        };

        if update.protocol.is_some_and(|p| p != c.protocol) {
            if let Some(peer) = update.peer {
                self.peer_unref(peer);
            }
            return Err(NhrpError::AddressMismatch);
        }

        let cache_type = update.cache_type;
        if c.cur.cache_type > cache_type || c.new.cache_type > cache_type {
            debug!(
                component = "cache",
                "{}: refusing {} binding over {}/{}", id, cache_type, c.cur.cache_type, c.new.cache_type
            );
            if let Some(peer) = update.peer {
                self.peer_unref(peer);
            }
            return Ok(BindingStatus::Refused);
        }

        let expires = match update.holding_time {
            0 => None,
            secs => Some(self.now + Duration::from_secs(u64::from(secs))),
        };

        if c.cur.cache_type == cache_type && c.cur.peer == update.peer {
            c.cur.expires = expires;
            c.cur.nbma_natoa = update.nbma_natoa;
            debug!(component = "cache", "{}: {} binding refreshed", id, cache_type);
            if let Some(peer) = update.peer {
                self.peer_unref(peer);
            }
            self.cache_update_timers(id);
            return Ok(BindingStatus::Refreshed);
        }

        self.cache_reset_new(id);
        let Some(c) = self.caches.get_mut(&id) else {
            return Err(NhrpError::NotFound);
        };
        c.new = Binding {
            cache_type,
            nbma_natoa: update.nbma_natoa,
            peer: update.peer,
            expires,
        };

        let peer = match update.peer {
            Some(peer) if !cache_type.is_permanent() && !c.mapped && cache_type != CacheType::Invalid => {
                peer
            }
            _ => {
                self.cache_authorize(id, EVENT_ACCEPT);
                return Ok(BindingStatus::Promoted);
            }
        };

        let auth = self.schedule(self.config.auth_timeout, TimerEvent::CacheAuth(id));
        if let Some(c) = self.caches.get_mut(&id) {
            c.auth = Some(auth);
        }
        self.peer_subscribe(peer, Subscriber::CachePending(id));
        self.cache_newpeer_notify(id, NotifyEvent::PeerUp);

        let Some(c) = self.caches.get(&id) else {
            return Err(NhrpError::NotFound);
        };
        if c.new.cache_type != CacheType::Invalid {
            Ok(BindingStatus::Pending)
        } else if c.cur.cache_type == cache_type && c.cur.peer == Some(peer) {
            Ok(BindingStatus::Promoted)
        } else {
            Ok(BindingStatus::Refused)
        }
    }

    /// Demote an entry to invalid regardless of its type
    pub(crate) fn cache_invalidate(&mut self, id: CacheId) {
        if !self.caches.contains_key(&id) {
            return;
        }
        self.cache_reset_new(id);
        self.cache_authorize(id, EVENT_ACCEPT);
    }

    /// Mark whether traffic uses the entry
    pub fn cache_set_used(&mut self, id: CacheId, used: bool) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        c.used = used;
        if used {
            self.announce(NotifierOwner::Cache(id), NotifyEvent::CacheUsed);
        }
    }

    /// Administratively bind a protocol address to an NBMA address
    pub fn map_static(&mut self, ifindex: u32, protocol: IpAddr, nbma: IpAddr) -> Result<CacheId> {
        if !self.interfaces.contains_key(&ifindex) {
            return Err(NhrpError::UnsupportedInterface(ifindex));
        }
        let id = self
            .cache_get(ifindex, protocol, true)
            .ok_or(NhrpError::ResourceExhausted("cache"))?;
        let peer = self.peer_get(ifindex, nbma);
        let status = self.cache_update_binding(id, BindingUpdate::new(CacheType::Static, 0).with_peer(peer))?;
        if status == BindingStatus::Refused {
            warn!(component = "cache", "Static map {} -> {} on {} refused", protocol, nbma, ifindex);
            return Err(NhrpError::Refused);
        }
        if let Some(c) = self.caches.get_mut(&id) {
            c.mapped = true;
        }
        info!(component = "cache", "Static map {} -> {} on {}", protocol, nbma, ifindex);
        Ok(id)
    }

    /// Remove an administrative binding
    pub fn unmap_static(&mut self, ifindex: u32, protocol: IpAddr) -> Result<()> {
        let id = self.cache_get(ifindex, protocol, false).ok_or(NhrpError::NotFound)?;
        let c = self.caches.get_mut(&id).ok_or(NhrpError::NotFound)?;
        if !c.mapped {
            return Err(NhrpError::NotFound);
        }
        c.mapped = false;
        self.cache_invalidate(id);
        Ok(())
    }

    pub(crate) fn cache_subscribe(&mut self, id: CacheId, subscriber: Subscriber) {
        if let Some(c) = self.caches.get_mut(&id) {
            c.notifiers.subscribe(subscriber);
        }
    }

    pub(crate) fn cache_unsubscribe(&mut self, id: CacheId, subscriber: Subscriber) {
        if let Some(c) = self.caches.get_mut(&id) {
            c.notifiers.unsubscribe(&subscriber);
        }
    }

    fn cache_reset_new(&mut self, id: CacheId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        let new = std::mem::take(&mut c.new);
        let mut auth = c.auth.take();
        let event_id = c.event_id.take();
        self.cancel(&mut auth);
        if let Some(event_id) = event_id {
            self.event_reqids.free(event_id);
        }
        if let Some(peer) = new.peer {
            self.peer_unsubscribe(peer, Subscriber::CachePending(id));
            self.peer_unref(peer);
        }
    }

    /// Complete authorization of the pending binding
    pub(crate) fn cache_authorize(&mut self, id: CacheId, result: &str) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        let mut auth = c.auth.take();
        let event_id = c.event_id.take();
        self.cancel(&mut auth);
        if let Some(event_id) = event_id {
            self.event_reqids.free(event_id);
        }

        if result == EVENT_ACCEPT {
            self.cache_promote(id);
        } else {
            info!(component = "cache", "{}: binding rejected ({})", id, result);
            self.cache_reset_new(id);
            self.cache_update_timers(id);
        }
    }

    fn cache_promote(&mut self, id: CacheId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        let new = std::mem::take(&mut c.new);
        let old = std::mem::replace(&mut c.cur, new);
        self.cache_counts[old.cache_type.index()] -= 1;
        self.cache_counts[new.cache_type.index()] += 1;

        if old.peer != new.peer {
            if let Some(peer) = new.peer {
                self.peer_unsubscribe(peer, Subscriber::CachePending(id));
                self.peer_subscribe(peer, Subscriber::Cache(id));
            }
            if let Some(peer) = old.peer {
                self.peer_unsubscribe(peer, Subscriber::Cache(id));
            }
        }
        if let Some(peer) = old.peer {
            self.peer_unref(peer);
        }

        if let Some(c) = self.caches.get(&id) {
            debug!(
                component = "cache",
                "{} ({}): {} -> {}", id, c.protocol, old.cache_type, new.cache_type
            );
        }
        self.cache_update_route(id);
        self.cache_update_timers(id);

        self.announce(NotifierOwner::Cache(id), NotifyEvent::CacheBindingChange);
        match (old.cache_type.is_up(), new.cache_type.is_up()) {
            (false, true) => self.announce(NotifierOwner::Cache(id), NotifyEvent::CacheUp),
            (true, false) => self.announce(NotifierOwner::Cache(id), NotifyEvent::CacheDown),
            _ => {}
        }
    }

    /// Install or withdraw the host route and neighbour binding
    fn cache_update_route(&mut self, id: CacheId) {
        let Some(c) = self.caches.get(&id) else {
            return;
        };
        let (ifindex, protocol, binding, installed) = (c.ifindex, c.protocol, c.cur, c.route_installed);

        let nbma = match binding.peer {
            Some(peer) if binding.cache_type.is_up() && binding.cache_type != CacheType::Local => {
                if self.peer_check(peer, Establish::Yes) {
                    self.peers.get(&peer).map(|p| binding.nbma_natoa.unwrap_or(p.remote_nbma))
                } else {
                    None
                }
            }
            _ => None,
        };

        match nbma {
            Some(nbma) => {
                self.emit(Effect::Neighbor {
                    ifindex,
                    protocol,
                    nbma: Some(nbma),
                });
                self.emit(Effect::Route(RouteRequest {
                    add: true,
                    cache_type: binding.cache_type,
                    prefix: Prefix::host(protocol),
                    ifindex: Some(ifindex),
                    nexthop: None,
                }));
                if let Some(c) = self.caches.get_mut(&id) {
                    c.route_installed = true;
                }
            }
            None if installed => {
                self.emit(Effect::Neighbor {
                    ifindex,
                    protocol,
                    nbma: None,
                });
                self.emit(Effect::Route(RouteRequest {
                    add: false,
                    cache_type: binding.cache_type,
                    prefix: Prefix::host(protocol),
                    ifindex: Some(ifindex),
                    nexthop: None,
                }));
                if let Some(c) = self.caches.get_mut(&id) {
                    c.route_installed = false;
                }
            }
            None => {}
        }
    }

    fn cache_update_timers(&mut self, id: CacheId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        let mut timeout = c.timeout.take();
        let (cache_type, expires, auth_pending) = (c.cur.cache_type, c.cur.expires, c.auth.is_some());
        self.cancel(&mut timeout);

        let timer = match cache_type {
            CacheType::Invalid if !auth_pending => {
                Some(self.schedule(self.config.cache_free_delay, TimerEvent::CacheFree(id)))
            }
            CacheType::Invalid => None,
            _ => expires.map(|at| self.timers.schedule(at, TimerEvent::CacheTimeout(id))),
        };
        if let Some(c) = self.caches.get_mut(&id) {
            c.timeout = timer;
        }
    }

    pub(crate) fn cache_timeout(&mut self, id: CacheId, timer: TimerId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        if c.timeout != Some(timer) {
            return;
        }
        c.timeout = None;
        if c.cur.cache_type == CacheType::Invalid || c.cur.cache_type.is_permanent() {
            return;
        }
        debug!(component = "cache", "{} ({}): {} binding expired", id, c.protocol, c.cur.cache_type);
        self.cache_invalidate(id);
    }

    pub(crate) fn cache_free(&mut self, id: CacheId, timer: TimerId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        if c.timeout != Some(timer) {
            return;
        }
        c.timeout = None;
        if c.cur.cache_type == CacheType::Invalid && c.new.cache_type == CacheType::Invalid {
            self.cache_delete(id);
        }
    }

    pub(crate) fn cache_auth_timeout(&mut self, id: CacheId, timer: TimerId) {
        let Some(c) = self.caches.get_mut(&id) else {
            return;
        };
        if c.auth != Some(timer) {
            return;
        }
        c.auth = None;
        debug!(component = "cache", "{}: authorization timed out", id);
        self.cache_authorize(id, "timeout");
    }

    /// Current peer changed state
    pub(crate) fn cache_peer_notify(&mut self, id: CacheId, event: NotifyEvent) {
        let Some(c) = self.caches.get(&id) else {
            return;
        };
        let permanent = c.cur.cache_type.is_permanent();
        match event {
            NotifyEvent::PeerUp => self.cache_update_route(id),
            NotifyEvent::PeerDown | NotifyEvent::PeerIfconfigChanged if permanent => {
                self.cache_update_route(id)
            }
            NotifyEvent::PeerDown | NotifyEvent::PeerIfconfigChanged => self.cache_invalidate(id),
            _ => {}
        }
    }

    /// Pending peer changed state
    pub(crate) fn cache_newpeer_notify(&mut self, id: CacheId, event: NotifyEvent) {
        let Some(peer) = self.caches.get(&id).and_then(|c| c.new.peer) else {
            return;
        };
        match event {
            NotifyEvent::PeerUp => {
                if self.peer_check(peer, Establish::Yes) {
                    self.peer_unsubscribe(peer, Subscriber::CachePending(id));
                    self.event_notify("authorize-binding", id);
                }
            }
            NotifyEvent::PeerDown => {
                self.cache_reset_new(id);
                self.cache_update_timers(id);
            }
            _ => {}
        }
    }

    /// Announce deletion and release the entry
    pub(crate) fn cache_delete(&mut self, id: CacheId) {
        if !self.caches.contains_key(&id) {
            return;
        }
        self.announce(NotifierOwner::Cache(id), NotifyEvent::CacheDelete);
        self.cache_reset_new(id);

        let Some(mut c) = self.caches.remove(&id) else {
            return;
        };
        self.cache_index.remove(&(c.ifindex, c.protocol));
        self.cache_counts[c.cur.cache_type.index()] -= 1;
        self.cancel(&mut c.timeout);
        if c.route_installed {
            self.emit(Effect::Neighbor {
                ifindex: c.ifindex,
                protocol: c.protocol,
                nbma: None,
            });
            self.emit(Effect::Route(RouteRequest {
                add: false,
                cache_type: c.cur.cache_type,
                prefix: Prefix::host(c.protocol),
                ifindex: Some(c.ifindex),
                nexthop: None,
            }));
        }
        if let Some(peer) = c.cur.peer {
            self.peer_unsubscribe(peer, Subscriber::Cache(id));
            self.peer_unref(peer);
        }
        debug!(component = "cache", "{} ({}) deleted", id, c.protocol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::test_util::{
        announced, drain, enabled_interface, ip, setup, setup_with, IFINDEX, LOCAL_ADDR, LOCAL_NBMA,
    };
    use crate::types::ShortcutId;

    fn route_changes(effects: &[Effect]) -> Vec<(bool, Prefix)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Route(r) => Some((r.add, r.prefix)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_learned_binding_promotes_once() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let addr = ip("10.0.0.20");
        let id = nhrp.cache_get(IFINDEX, addr, true).unwrap();
        nhrp.cache_update_binding(id, BindingUpdate::new(CacheType::Incomplete, 0))
            .unwrap();
        drain(&mut rx);
        nhrp.announced.clear();

        let t0 = nhrp.now();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.20"));
        let status = nhrp
            .cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        assert_eq!(status, BindingStatus::Promoted);

        let owner = NotifierOwner::Cache(id);
        assert_eq!(announced(&nhrp, owner, NotifyEvent::CacheUp), 1);
        assert_eq!(announced(&nhrp, owner, NotifyEvent::CacheBindingChange), 1);
        assert_eq!(announced(&nhrp, owner, NotifyEvent::CacheDown), 0);

        let c = nhrp.cache(id).unwrap();
        assert_eq!(c.cur.cache_type, CacheType::Dynamic);
        assert_eq!(c.cur.expires, Some(t0 + Duration::from_secs(60)));
        assert_eq!(c.new.cache_type, CacheType::Invalid);
        assert!(c.route_installed);

        let effects = drain(&mut rx);
        assert_eq!(route_changes(&effects), vec![(true, Prefix::host(addr))]);
        assert!(effects.contains(&Effect::Neighbor {
            ifindex: IFINDEX,
            protocol: addr,
            nbma: Some(ip("192.0.2.20")),
        }));
        assert_eq!(nhrp.cache_counts().get(CacheType::Dynamic), 1);
    }

    #[test]
    fn test_static_never_expires() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.map_static(IFINDEX, ip("10.0.0.9"), ip("192.0.2.9")).unwrap();
        assert!(nhrp.cache(id).unwrap().timeout.is_none());

        let later = nhrp.now() + Duration::from_secs(365 * 24 * 3600);
        nhrp.run_timers(later);
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Static);

        let local = nhrp.cache_get(IFINDEX, ip("10.0.0.1"), false).unwrap();
        assert_eq!(nhrp.cache(local).unwrap().cur.cache_type, CacheType::Local);
    }

    #[test]
    fn test_lower_type_refused() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.map_static(IFINDEX, ip("10.0.0.9"), ip("192.0.2.9")).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.10")).unwrap();

        let status = nhrp
            .cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(Some(peer)))
            .unwrap();
        assert_eq!(status, BindingStatus::Refused);
        assert!(nhrp.peer(peer).is_none());
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Static);
    }

    #[test]
    fn test_protocol_mismatch() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let result = nhrp.cache_update_binding(
            id,
            BindingUpdate::new(CacheType::Dynamic, 60).with_protocol(ip("10.0.0.10")),
        );
        assert_eq!(result, Err(NhrpError::AddressMismatch));
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let nbma = ip("192.0.2.9");
        let peer = nhrp.peer_get(IFINDEX, nbma);
        nhrp.cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();

        nhrp.run_timers(nhrp.now() + Duration::from_secs(30));
        let peer = nhrp.peer_get(IFINDEX, nbma);
        let status = nhrp
            .cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        assert_eq!(status, BindingStatus::Refreshed);
        assert_eq!(nhrp.peer(peer.unwrap()).unwrap().refcount(), 1);

        nhrp.run_timers(nhrp.now() + Duration::from_secs(45));
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Dynamic);
    }

    #[test]
    fn test_expiry_demotes_then_frees() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let addr = ip("10.0.0.9");
        let id = nhrp.cache_get(IFINDEX, addr, true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.9"));
        nhrp.cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        drain(&mut rx);
        nhrp.announced.clear();

        let t0 = nhrp.now();
        nhrp.run_timers(t0 + Duration::from_secs(60));
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Invalid);
        assert_eq!(announced(&nhrp, NotifierOwner::Cache(id), NotifyEvent::CacheDown), 1);
        assert_eq!(route_changes(&drain(&mut rx)), vec![(false, Prefix::host(addr))]);
        assert!(nhrp.peer(peer.unwrap()).is_none());

        nhrp.run_timers(t0 + Duration::from_secs(60) + Duration::from_millis(10));
        assert!(nhrp.cache(id).is_none());
        assert_eq!(announced(&nhrp, NotifierOwner::Cache(id), NotifyEvent::CacheDelete), 1);
        assert_eq!(nhrp.cache_counts().total(), 1);
    }

    #[test]
    fn test_pending_until_peer_online() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.interface_set_protection(IFINDEX, Some("dmvpn".into()), None).unwrap();
        let remote = ip("192.0.2.9");
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, remote);

        let status = nhrp
            .cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        assert_eq!(status, BindingStatus::Pending);
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Invalid);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Effect::RequestVc { remote: r, .. } if *r == remote)));

        nhrp.vc_ipsec_updown(5, ip(LOCAL_NBMA), remote, true).unwrap();
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Invalid);

        nhrp.run_timers(nhrp.now() + nhrp.config().peer_settle);
        let c = nhrp.cache(id).unwrap();
        assert_eq!(c.cur.cache_type, CacheType::Dynamic);
        assert!(c.auth.is_none());
    }

    #[test]
    fn test_authorization_timeout_rejects() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.interface_set_protection(IFINDEX, Some("dmvpn".into()), None).unwrap();
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.9"));
        nhrp.cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();

        let t0 = nhrp.now();
        nhrp.run_timers(t0 + nhrp.config().auth_timeout);
        assert!(nhrp.peer(peer.unwrap()).is_none());
        nhrp.run_timers(t0 + nhrp.config().auth_timeout + nhrp.config().cache_free_delay);
        assert!(nhrp.cache(id).is_none());
    }

    #[test]
    fn test_event_consumer_authorizes() {
        let config = CoreConfig {
            event_consumer: true,
            ..CoreConfig::default()
        };
        let (mut nhrp, mut rx) = setup_with(config);
        enabled_interface(&mut nhrp);
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.9"));
        drain(&mut rx);

        let status = nhrp
            .cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        assert_eq!(status, BindingStatus::Pending);

        let event_id = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                Effect::Event { id, name, .. } if name == "authorize-binding" => id,
                _ => None,
            })
            .unwrap();
        nhrp.event_reply(event_id, EVENT_ACCEPT);
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Dynamic);

        nhrp.event_reply(event_id, "reject");
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Dynamic);
    }

    #[test]
    fn test_peer_down_invalidates_learned_only() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let learned = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.9"));
        nhrp.cache_update_binding(learned, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();
        let mapped = nhrp.map_static(IFINDEX, ip("10.0.0.10"), ip("192.0.2.10")).unwrap();

        nhrp.interface_set_up(IFINDEX, false).unwrap();
        assert_eq!(nhrp.cache(learned).unwrap().cur.cache_type, CacheType::Invalid);
        let mapped = nhrp.cache(mapped).unwrap();
        assert_eq!(mapped.cur.cache_type, CacheType::Static);
        assert!(!mapped.route_installed);
    }

    #[test]
    fn test_used_announced_when_set() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.map_static(IFINDEX, ip("10.0.0.9"), ip("192.0.2.9")).unwrap();
        nhrp.announced.clear();
        nhrp.cache_set_used(id, false);
        nhrp.cache_set_used(id, true);
        assert_eq!(announced(&nhrp, NotifierOwner::Cache(id), NotifyEvent::CacheUsed), 1);
        assert!(nhrp.cache(id).unwrap().used);
    }

    #[test]
    fn test_bindings_settled_before_delivery() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.9"), true).unwrap();
        nhrp.cache_subscribe(id, Subscriber::Shortcut(ShortcutId(0)));
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.9"));
        nhrp.cache_update_binding(id, BindingUpdate::new(CacheType::Dynamic, 60).with_peer(peer))
            .unwrap();

        let seen: Vec<_> = nhrp
            .cache_deliveries
            .iter()
            .filter(|(c, ..)| *c == id)
            .map(|(_, event, cur, new)| (*event, cur.cache_type, cur.peer, new.cache_type, new.peer))
            .collect();
        assert_eq!(
            seen,
            vec![
                (NotifyEvent::CacheBindingChange, CacheType::Dynamic, peer, CacheType::Invalid, None),
                (NotifyEvent::CacheUp, CacheType::Dynamic, peer, CacheType::Invalid, None),
            ]
        );

        nhrp.cache_deliveries.clear();
        nhrp.run_timers(nhrp.now() + Duration::from_secs(60));
        let seen: Vec<_> = nhrp
            .cache_deliveries
            .iter()
            .map(|(_, event, cur, _)| (*event, cur.cache_type, cur.peer))
            .collect();
        assert_eq!(
            seen,
            vec![
                (NotifyEvent::CacheBindingChange, CacheType::Invalid, None),
                (NotifyEvent::CacheDown, CacheType::Invalid, None),
            ]
        );
    }

    #[test]
    fn test_map_over_local_refused() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let local = ip(LOCAL_ADDR);
        let nbma = ip("192.0.2.9");

        assert_eq!(nhrp.map_static(IFINDEX, local, nbma), Err(NhrpError::Refused));
        let id = nhrp.cache_get(IFINDEX, local, false).unwrap();
        let c = nhrp.cache(id).unwrap();
        assert_eq!(c.cur.cache_type, CacheType::Local);
        assert!(!c.mapped);
        assert!(nhrp.peer_lookup(IFINDEX, nbma).is_none());

        assert_eq!(nhrp.unmap_static(IFINDEX, local), Err(NhrpError::NotFound));
        assert_eq!(nhrp.cache(id).unwrap().cur.cache_type, CacheType::Local);
    }

    #[test]
    fn test_unmap_static() {
        let (mut nhrp, mut rx) = setup();
        enabled_interface(&mut nhrp);
        let addr = ip("10.0.0.9");
        let nbma = ip("192.0.2.9");
        let id = nhrp.map_static(IFINDEX, addr, nbma).unwrap();
        assert!(nhrp.cache(id).unwrap().mapped);
        drain(&mut rx);

        nhrp.unmap_static(IFINDEX, addr).unwrap();
        let c = nhrp.cache(id).unwrap();
        assert_eq!(c.cur.cache_type, CacheType::Invalid);
        assert!(!c.mapped);
        assert_eq!(route_changes(&drain(&mut rx)), vec![(false, Prefix::host(addr))]);
        assert!(nhrp.peer_lookup(IFINDEX, nbma).is_none());

        assert_eq!(nhrp.unmap_static(IFINDEX, addr), Err(NhrpError::NotFound));
        assert_eq!(nhrp.unmap_static(IFINDEX, ip("10.0.0.99")), Err(NhrpError::NotFound));

        nhrp.run_timers(nhrp.now() + nhrp.config().cache_free_delay);
        assert!(nhrp.cache(id).is_none());
    }

    #[test]
    fn test_cache_listing() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.map_static(IFINDEX, ip("10.0.0.9"), ip("192.0.2.9")).unwrap();
        let id = nhrp.cache_get(IFINDEX, ip("10.0.0.5"), true).unwrap();
        let peer = nhrp.peer_get(IFINDEX, ip("192.0.2.5"));
        nhrp.cache_update_binding(
            id,
            BindingUpdate::new(CacheType::Dynamic, 60)
                .with_peer(peer)
                .with_natoa(Some(ip("198.51.100.5"))),
        )
        .unwrap();

        let entries = nhrp.cache_foreach(IFINDEX);
        let summary: Vec<_> = entries.iter().map(|c| (c.protocol, c.cache_type)).collect();
        assert_eq!(
            summary,
            vec![
                (ip(LOCAL_ADDR), CacheType::Local),
                (ip("10.0.0.5"), CacheType::Dynamic),
                (ip("10.0.0.9"), CacheType::Static),
            ]
        );

        let dynamic = &entries[1];
        assert_eq!(dynamic.nbma, Some(ip("192.0.2.5")));
        assert_eq!(dynamic.nbma_natoa, Some(ip("198.51.100.5")));
        assert!(dynamic.online);
        assert!(!dynamic.mapped);
        assert_eq!(dynamic.remaining, Some(Duration::from_secs(60)));

        let mapped = &entries[2];
        assert!(mapped.mapped);
        assert_eq!(mapped.nbma, Some(ip("192.0.2.9")));
        assert_eq!(mapped.remaining, None);

        assert!(nhrp.cache_foreach(IFINDEX + 1).is_empty());
    }
}
