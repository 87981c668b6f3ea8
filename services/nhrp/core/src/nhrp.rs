//! The control plane context.
//!
//! [`Nhrp`] owns every table (interfaces, security associations, peers,
//! cache entries, shortcuts, NHS registrations), the timer queue and the
//! request id pools. All inputs are method calls on it and all outputs are
//! [`Effect`]s, so the whole state machine runs on one thread without
//! locking.

use nhrp_routing::RouteTable;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::trace;

#[cfg(test)]
use crate::cache::Binding;
use crate::cache::CacheEntry;
use crate::config::CoreConfig;
use crate::effects::{Effect, EffectSink};
use crate::interface::Interface;
use crate::nhs::{Nhs, Registration};
use crate::notifier::{self, NotifierList, Observer};
use crate::peer::Peer;
use crate::reqid::ReqidPool;
use crate::shortcut::Shortcut;
use crate::timer::{TimerId, TimerQueue};
use crate::types::{
    CacheId, CacheType, NhsId, NotifierOwner, NotifyEvent, PacketWaiter, PeerId, RegId,
    ShortcutId, Subscriber, TimerEvent, VcId,
};
use crate::vc::{Vc, VcKey};
use nhrp_routing::PrefixTable;

/// NHRP control plane state
#[derive(Debug)]
pub struct Nhrp {
    pub(crate) config: CoreConfig,
    pub(crate) now: Instant,
    pub(crate) effects: EffectSink,
    pub(crate) timers: TimerQueue<TimerEvent>,

    pub(crate) packet_reqids: ReqidPool<PacketWaiter>,
    pub(crate) event_reqids: ReqidPool<CacheId>,
    pub(crate) resolver_reqids: ReqidPool<NhsId>,

    pub(crate) interfaces: HashMap<u32, Interface>,
    pub(crate) routes: RouteTable,

    pub(crate) vcs: HashMap<VcId, Vc>,
    pub(crate) vc_index: HashMap<VcKey, VcId>,
    pub(crate) child_sas: HashMap<u32, VcId>,

    pub(crate) peers: HashMap<PeerId, Peer>,
    pub(crate) peer_index: HashMap<(u32, IpAddr), PeerId>,

    pub(crate) caches: HashMap<CacheId, CacheEntry>,
    pub(crate) cache_index: HashMap<(u32, IpAddr), CacheId>,
    pub(crate) cache_counts: [usize; CacheType::ALL.len()],

    pub(crate) shortcuts: HashMap<ShortcutId, Shortcut>,
    pub(crate) shortcut_table: PrefixTable<ShortcutId>,

    pub(crate) nhs: HashMap<NhsId, Nhs>,
    pub(crate) registrations: HashMap<RegId, Registration>,

    next_id: u64,

    #[cfg(test)]
    pub(crate) announced: Vec<(NotifierOwner, NotifyEvent)>,
    /// Bindings of a cache entry as seen by each delivery from it
    #[cfg(test)]
    pub(crate) cache_deliveries: Vec<(CacheId, NotifyEvent, Binding, Binding)>,
}

impl Nhrp {
    /// Create an empty control plane whose clock starts at `now`
    pub fn new(config: CoreConfig, effects: EffectSink, now: Instant) -> Self {
        Self {
            config,
            now,
            effects,
            timers: TimerQueue::new(),
            packet_reqids: ReqidPool::new("packet"),
            event_reqids: ReqidPool::new("event"),
            resolver_reqids: ReqidPool::new("resolver"),
            interfaces: HashMap::new(),
            routes: RouteTable::new(),
            vcs: HashMap::new(),
            vc_index: HashMap::new(),
            child_sas: HashMap::new(),
            peers: HashMap::new(),
            peer_index: HashMap::new(),
            caches: HashMap::new(),
            cache_index: HashMap::new(),
            cache_counts: [0; CacheType::ALL.len()],
            shortcuts: HashMap::new(),
            shortcut_table: PrefixTable::new(),
            nhs: HashMap::new(),
            registrations: HashMap::new(),
            next_id: 1,
            #[cfg(test)]
            announced: Vec::new(),
            #[cfg(test)]
            cache_deliveries: Vec::new(),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Current time as seen by the control plane
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Advance the clock to `now` and fire every timer due by then
    pub fn run_timers(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
        while let Some((id, event)) = self.timers.pop_due(self.now) {
            trace!(?event, "Timer fired");
            self.fire(id, event);
        }
    }

    fn fire(&mut self, id: TimerId, event: TimerEvent) {
        match event {
            TimerEvent::PeerFallback(peer) => self.peer_fallback_timeout(peer, id),
            TimerEvent::PeerNotifyUp(peer) => self.peer_notify_up(peer, id),
            TimerEvent::CacheTimeout(cache) => self.cache_timeout(cache, id),
            TimerEvent::CacheFree(cache) => self.cache_free(cache, id),
            TimerEvent::CacheAuth(cache) => self.cache_auth_timeout(cache, id),
            TimerEvent::Shortcut(shortcut, action) => self.shortcut_timer(shortcut, action, id),
            TimerEvent::Registration(reg, action) => self.reg_timer(reg, action, id),
            TimerEvent::NhsResolve(nhs) => self.nhs_resolve(nhs, id),
        }
    }

    pub(crate) fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        self.timers.schedule(self.now + after, event)
    }

    pub(crate) fn cancel(&mut self, timer: &mut Option<TimerId>) {
        if let Some(id) = timer.take() {
            self.timers.cancel(id);
        }
    }

    pub(crate) fn emit(&self, effect: Effect) {
        self.effects.emit(effect);
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn announce(&mut self, owner: NotifierOwner, event: NotifyEvent) {
        #[cfg(test)]
        self.announced.push((owner, event));
        notifier::announce(self, owner, event);
    }

    /// Outstanding timers
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

impl Observer<Subscriber, NotifyEvent> for Nhrp {
    type Owner = NotifierOwner;

    fn notifier(&self, owner: NotifierOwner) -> Option<&NotifierList<Subscriber>> {
        match owner {
            NotifierOwner::Interface(ifindex) => self.interfaces.get(&ifindex).map(|i| &i.notifiers),
            NotifierOwner::Vc(id) => self.vcs.get(&id).map(|v| &v.notifiers),
            NotifierOwner::Peer(id) => self.peers.get(&id).map(|p| &p.notifiers),
            NotifierOwner::Cache(id) => self.caches.get(&id).map(|c| &c.notifiers),
        }
    }

    fn on_event(&mut self, _owner: NotifierOwner, subscriber: Subscriber, event: NotifyEvent) {
        #[cfg(test)]
        if let NotifierOwner::Cache(id) = _owner {
            if let Some(c) = self.caches.get(&id) {
                self.cache_deliveries.push((id, event, c.cur, c.new));
            }
        }
        match subscriber {
            Subscriber::Peer(peer) => self.peer_notify(peer, event),
            Subscriber::Cache(cache) => self.cache_peer_notify(cache, event),
            Subscriber::CachePending(cache) => self.cache_newpeer_notify(cache, event),
            Subscriber::Shortcut(shortcut) => self.shortcut_cache_notify(shortcut, event),
            Subscriber::Registration(reg) => self.reg_peer_notify(reg, event),
        }
    }
}
