//! Peers: an NBMA neighbour reached through one interface.
//!
//! A peer is reference counted by the cache entries, registrations and
//! in-flight operations that use it, and is released once the last
//! reference is dropped and nobody watches it. Whether a peer is online
//! depends on its interface and, when a protection profile is configured,
//! on its security association having at least one child SA.

use bytes::Bytes;
use nhrp_wire::Afi;
use serde::Serialize;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::effects::Effect;
use crate::notifier::NotifierList;
use crate::timer::TimerId;
use crate::types::{Establish, NotifierOwner, NotifyEvent, PeerId, Subscriber, TimerEvent, VcId};
use crate::Nhrp;

/// NBMA neighbour
#[derive(Debug, Clone)]
pub struct Peer {
    /// Interface the peer is reached through
    pub ifindex: u32,
    /// NBMA address of the peer
    pub remote_nbma: IpAddr,
    /// Security association with the peer
    pub vc: VcId,
    /// Usable for traffic
    pub online: bool,
    /// Security negotiation requested
    pub requested: bool,
    /// Fallback profile requested
    pub fallback_requested: bool,
    /// Last request was made at priority
    pub prio: bool,
    pub(crate) refcount: u32,
    pub(crate) timer: Option<TimerId>,
    pub(crate) notifiers: NotifierList<Subscriber>,
}

impl Peer {
    /// Live references
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Listing of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    /// Interface index
    pub ifindex: u32,
    /// NBMA address
    pub nbma: IpAddr,
    /// Online state
    pub online: bool,
    /// Live references
    pub refcount: u32,
    /// Child SAs of the security association
    pub ipsec: usize,
}

impl Nhrp {
    /// Find or create the peer for an NBMA address and take a reference
    pub fn peer_get(&mut self, ifindex: u32, nbma: IpAddr) -> Option<PeerId> {
        let local = self
            .interfaces
            .get(&ifindex)?
            .nbma_or_unspecified(Afi::of(&nbma));

        let id = match self.peer_index.get(&(ifindex, nbma)) {
            Some(id) => *id,
            None => {
                let vc = self.vc_get(local, nbma, true)?;
                let id = PeerId(self.alloc_id());
                self.peers.insert(
                    id,
                    Peer {
                        ifindex,
                        remote_nbma: nbma,
                        vc,
                        online: false,
                        requested: false,
                        fallback_requested: false,
                        prio: false,
                        refcount: 0,
                        timer: None,
                        notifiers: NotifierList::new(),
                    },
                );
                self.peer_index.insert((ifindex, nbma), id);
                self.vc_subscribe(vc, Subscriber::Peer(id));
                if let Some(iface) = self.interfaces.get_mut(&ifindex) {
                    iface.notifiers.subscribe(Subscriber::Peer(id));
                }
                debug!(component = "peer", "{} created for {} on {}", id, nbma, ifindex);
                id
            }
        };

        let peer = self.peers.get_mut(&id)?;
        peer.refcount += 1;
        if peer.refcount == 1 {
            self.peer_recheck(id);
        }
        Some(id)
    }

    /// Look up a peer
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Peer of an NBMA address without taking a reference
    pub fn peer_lookup(&self, ifindex: u32, nbma: IpAddr) -> Option<PeerId> {
        self.peer_index.get(&(ifindex, nbma)).copied()
    }

    /// Snapshot of every peer
    pub fn peer_foreach(&self) -> Vec<PeerSnapshot> {
        let mut out: Vec<_> = self
            .peers
            .values()
            .map(|p| PeerSnapshot {
                ifindex: p.ifindex,
                nbma: p.remote_nbma,
                online: p.online,
                refcount: p.refcount,
                ipsec: self.vcs.get(&p.vc).map(|v| v.ipsec()).unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| (a.ifindex, a.nbma).cmp(&(b.ifindex, b.nbma)));
        out
    }

    /// Take another reference
    pub fn peer_ref(&mut self, id: PeerId) -> Option<PeerId> {
        let peer = self.peers.get_mut(&id)?;
        peer.refcount += 1;
        Some(id)
    }

    /// Drop a reference
    pub fn peer_unref(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        match peer.refcount.checked_sub(1) {
            Some(count) => peer.refcount = count,
            None => warn!(component = "peer", "{}: unbalanced unref", id),
        }
        self.peer_check_delete(id);
    }

    pub(crate) fn peer_subscribe(&mut self, id: PeerId, subscriber: Subscriber) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.notifiers.subscribe(subscriber);
        }
    }

    pub(crate) fn peer_unsubscribe(&mut self, id: PeerId, subscriber: Subscriber) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.notifiers.unsubscribe(&subscriber);
        }
        self.peer_check_delete(id);
    }

    fn peer_check_delete(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.refcount > 0 || peer.notifiers.has_subscribers() {
            return;
        }
        self.peer_detach(id);
    }

    /// Release a peer, dropping its subscriptions and timer
    pub(crate) fn peer_detach(&mut self, id: PeerId) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        self.cancel(&mut peer.timer);
        self.peer_index.remove(&(peer.ifindex, peer.remote_nbma));
        if let Some(iface) = self.interfaces.get_mut(&peer.ifindex) {
            iface.notifiers.unsubscribe(&Subscriber::Peer(id));
        }
        self.vc_unsubscribe(peer.vc, Subscriber::Peer(id));
        debug!(component = "peer", "{} deleted", id);
    }

    /// Re-evaluate the online state and announce changes
    pub(crate) fn peer_recheck(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let Some(iface) = self.interfaces.get(&peer.ifindex) else {
            return;
        };
        let ipsec = self.vcs.get(&peer.vc).map(|v| v.ipsec()).unwrap_or(0);
        let online = iface.enabled && (iface.ipsec_profile.is_none() || ipsec > 0);
        let settle = self.config.peer_settle;

        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.online == online {
            return;
        }
        peer.online = online;
        let mut timer = peer.timer.take();
        let has_subscribers = peer.notifiers.has_subscribers();
        self.cancel(&mut timer);

        if online {
            info!(component = "peer", "{} ({}) online", id, self.peers[&id].remote_nbma);
            if has_subscribers {
                let timer = self.schedule(settle, TimerEvent::PeerNotifyUp(id));
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.timer = Some(timer);
                }
            } else {
                self.peer_announce(id, NotifyEvent::PeerUp);
            }
        } else {
            info!(component = "peer", "{} ({}) offline", id, self.peers[&id].remote_nbma);
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.requested = false;
                peer.fallback_requested = false;
            }
            self.peer_announce(id, NotifyEvent::PeerDown);
        }
    }

    /// Announce while holding a reference so a subscriber cannot free the peer
    fn peer_announce(&mut self, id: PeerId, event: NotifyEvent) {
        if self.peer_ref(id).is_none() {
            return;
        }
        self.announce(NotifierOwner::Peer(id), event);
        self.peer_unref(id);
    }

    pub(crate) fn peer_notify_up(&mut self, id: PeerId, timer: TimerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.timer != Some(timer) {
            return;
        }
        peer.timer = None;
        if peer.online {
            self.peer_announce(id, NotifyEvent::PeerUp);
        }
    }

    /// Whether the peer is online, optionally asking for protection to be set up
    pub fn peer_check(&mut self, id: PeerId, establish: Establish) -> bool {
        let Some(peer) = self.peers.get(&id) else {
            return false;
        };
        if peer.online {
            return true;
        }
        if establish == Establish::No || peer.requested {
            return false;
        }
        let Some(iface) = self.interfaces.get(&peer.ifindex) else {
            return false;
        };
        let Some(profile) = iface.ipsec_profile.clone() else {
            return false;
        };
        let Some(local) = iface.nbma.filter(|a| !a.is_unspecified()) else {
            return false;
        };
        let prio = establish == Establish::Priority;
        let interval = if iface.ipsec_fallback_profile.is_some() && !prio {
            self.config.vc_fallback_first
        } else {
            self.config.vc_fallback
        };
        let remote = peer.remote_nbma;

        debug!(component = "peer", "{}: requesting protection with {}", id, profile);
        self.emit(Effect::RequestVc {
            profile,
            local,
            remote,
            prio,
        });

        let timer = self.schedule(interval, TimerEvent::PeerFallback(id));
        if let Some(peer) = self.peers.get_mut(&id) {
            let mut old = peer.timer.replace(timer);
            peer.prio = prio;
            peer.requested = true;
            self.cancel(&mut old);
        }
        false
    }

    pub(crate) fn peer_fallback_timeout(&mut self, id: PeerId, timer: TimerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.timer != Some(timer) {
            return;
        }
        peer.timer = None;
        let (ifindex, remote, online, prio, fallback_requested) = (
            peer.ifindex,
            peer.remote_nbma,
            peer.online,
            peer.prio,
            peer.fallback_requested,
        );

        let fallback = self.interfaces.get(&ifindex).and_then(|iface| {
            let local = iface.nbma?;
            let profile = iface.ipsec_fallback_profile.clone()?;
            Some((local, profile))
        });

        match fallback {
            Some((local, profile)) if !online && !prio && !fallback_requested => {
                debug!(component = "peer", "{}: trying fallback profile {}", id, profile);
                self.emit(Effect::RequestVc {
                    profile,
                    local,
                    remote,
                    prio: false,
                });
                let timer = self.schedule(self.config.vc_fallback, TimerEvent::PeerFallback(id));
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.fallback_requested = true;
                    peer.timer = Some(timer);
                }
            }
            _ => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.requested = false;
                    peer.fallback_requested = false;
                }
            }
        }
    }

    /// Interface or VC announcement delivered to a peer
    pub(crate) fn peer_notify(&mut self, id: PeerId, event: NotifyEvent) {
        match event {
            NotifyEvent::InterfaceUp | NotifyEvent::InterfaceDown | NotifyEvent::VcIpsecChanged => {
                self.peer_recheck(id)
            }
            NotifyEvent::InterfaceNbmaChanged => {
                self.peer_rebind_vc(id);
                self.peer_recheck(id);
                self.peer_announce(id, NotifyEvent::PeerIfconfigChanged);
            }
            NotifyEvent::InterfaceAddressChanged => {
                self.peer_announce(id, NotifyEvent::PeerIfconfigChanged);
            }
            NotifyEvent::InterfaceIpsecChanged => {
                self.peer_recheck(id);
                self.peer_announce(id, NotifyEvent::PeerIfconfigChanged);
            }
            _ => {}
        }
    }

    fn peer_rebind_vc(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let (old, ifindex, remote) = (peer.vc, peer.ifindex, peer.remote_nbma);
        let Some(local) = self
            .interfaces
            .get(&ifindex)
            .map(|iface| iface.nbma_or_unspecified(Afi::of(&remote)))
        else {
            return;
        };
        let Some(vc) = self.vc_get(local, remote, true) else {
            return;
        };
        if vc == old {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.vc = vc;
        }
        self.vc_subscribe(vc, Subscriber::Peer(id));
        self.vc_unsubscribe(old, Subscriber::Peer(id));
    }

    /// Transmit a packet to the peer; dropped when the peer is offline
    pub fn peer_send(&mut self, id: PeerId, packet: Bytes) -> bool {
        if !self.peer_check(id, Establish::No) {
            debug!(component = "peer", "{}: offline, dropping {} byte packet", id, packet.len());
            return false;
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        peer.fallback_requested = false;
        let (ifindex, nbma) = (peer.ifindex, peer.remote_nbma);
        self.emit(Effect::Send {
            ifindex,
            nbma,
            packet,
        });
        true
    }
}
