//! Event export towards an external consumer.
//!
//! Events describe a cache entry as ordered key/value pairs. When a
//! consumer is attached the event carries a request id and the decision
//! comes back through [`Nhrp::event_reply`]; otherwise it is accepted on
//! the spot.

use nhrp_wire::Afi;
use tracing::debug;

use crate::cache::EVENT_ACCEPT;
use crate::effects::Effect;
use crate::types::{CacheId, CacheType};
use crate::Nhrp;

impl Nhrp {
    /// Export an event about a cache entry and ask for a decision
    pub(crate) fn event_notify(&mut self, name: &str, id: CacheId) {
        if !self.config.event_consumer {
            debug!(component = "event", "No event consumer, {} accepted for {}", name, id);
            self.cache_authorize(id, EVENT_ACCEPT);
            return;
        }
        let Some(fields) = self.event_fields(id) else {
            return;
        };

        let event_id = self.event_reqids.allocate(id);
        if let Some(old) = self.caches.get_mut(&id).and_then(|c| c.event_id.replace(event_id)) {
            self.event_reqids.free(old);
        }
        debug!(component = "event", "Sending event {} ({}) for {}", name, event_id, id);
        self.emit(Effect::Event {
            id: Some(event_id),
            name: name.to_string(),
            fields,
        });
    }

    fn event_fields(&self, id: CacheId) -> Option<Vec<(String, String)>> {
        let c = self.caches.get(&id)?;
        let iface = self.interfaces.get(&c.ifindex)?;
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut push = |key: &str, value: String| fields.push((key.to_string(), value));

        push("type", c.new.cache_type.to_string());
        push("old_type", c.cur.cache_type.to_string());
        push("num_nhs", self.cache_counts[CacheType::Nhs.index()].to_string());
        push("interface", iface.name.clone());
        if let Some(addr) = iface.address(Afi::of(&c.protocol)) {
            push("local_addr", addr.to_string());
        }

        if let Some(peer) = c.new.peer.and_then(|p| self.peers.get(&p)) {
            if let Some(vc) = self.vcs.get(&peer.vc) {
                let (local, remote) = if vc.remote.nbma == peer.remote_nbma {
                    (&vc.local, &vc.remote)
                } else {
                    (&vc.remote, &vc.local)
                };
                push(
                    "vc_initiated",
                    if peer.requested { "yes" } else { "no" }.to_string(),
                );
                if !local.nbma.is_unspecified() {
                    push("local_nbma", local.nbma.to_string());
                }
                if !local.id.is_empty() {
                    push("local_id", local.id.clone());
                }
                push("remote_addr", c.protocol.to_string());
                push("remote_nbma", remote.nbma.to_string());
                if !remote.id.is_empty() {
                    push("remote_id", remote.id.clone());
                }
                if let Some(cert) = &remote.cert {
                    push("remote_cert", hex::encode(cert));
                }
            }
        }
        Some(fields)
    }

    /// Decision from the event consumer
    pub fn event_reply(&mut self, event_id: u32, result: &str) {
        let Some(id) = self.event_reqids.free(event_id) else {
            debug!(component = "event", "Reply for unknown event {}", event_id);
            return;
        };
        match self.caches.get(&id) {
            Some(c) if c.event_id == Some(event_id) => {
                debug!(component = "event", "Event {} for {}: {}", event_id, id, result);
                self.cache_authorize(id, result);
            }
            _ => debug!(component = "event", "Stale reply for event {}", event_id),
        }
    }
}
