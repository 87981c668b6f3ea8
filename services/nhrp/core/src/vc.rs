//! Security associations between two NBMA endpoints.
//!
//! A VC is shared by every peer using the same address pair, in either
//! direction. It counts the child SAs reported by the security negotiator
//! and announces when protection comes up or goes away.

use bytes::Bytes;
use smallvec::SmallVec;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::error::{NhrpError, Result};
use crate::notifier::NotifierList;
use crate::types::{NotifierOwner, NotifyEvent, Subscriber, VcId};
use crate::Nhrp;

/// Child SAs tracked per VC
pub const MAX_CHILD_SAS: usize = 32;
/// Longest identity kept, bytes
pub const MAX_IDENTITY_LEN: usize = 64;
/// Largest certificate kept, bytes
pub const MAX_CERT_LEN: usize = 2048;

/// Unordered NBMA address pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcKey(IpAddr, IpAddr);

impl VcKey {
    /// Key of the pair regardless of direction
    pub fn new(a: IpAddr, b: IpAddr) -> Self {
        if a <= b {
            VcKey(a, b)
        } else {
            VcKey(b, a)
        }
    }
}

/// One side of a VC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcEndpoint {
    /// NBMA address
    pub nbma: IpAddr,
    /// Identity as authenticated by the negotiator
    pub id: String,
    /// Certificate in DER
    pub cert: Option<Bytes>,
}

impl VcEndpoint {
    fn new(nbma: IpAddr) -> Self {
        Self {
            nbma,
            id: String::new(),
            cert: None,
        }
    }
}

/// Security association
#[derive(Debug, Clone)]
pub struct Vc {
    /// Side of whoever created the VC
    pub local: VcEndpoint,
    /// The other side
    pub remote: VcEndpoint,
    pub(crate) child_sas: SmallVec<[u32; 4]>,
    pub(crate) updating: bool,
    pub(crate) notifiers: NotifierList<Subscriber>,
}

impl Vc {
    /// Number of live child SAs
    pub fn ipsec(&self) -> usize {
        self.child_sas.len()
    }

    /// Endpoint for `nbma`, if it belongs to this VC
    pub fn endpoint(&self, nbma: &IpAddr) -> Option<&VcEndpoint> {
        if self.local.nbma == *nbma {
            Some(&self.local)
        } else if self.remote.nbma == *nbma {
            Some(&self.remote)
        } else {
            None
        }
    }
}

fn truncate_identity(id: &str) -> String {
    if id.len() <= MAX_IDENTITY_LEN {
        return id.to_string();
    }
    let mut end = MAX_IDENTITY_LEN;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    id[..end].to_string()
}

impl Nhrp {
    /// Find the VC of an address pair in either direction, creating it on demand
    pub fn vc_get(&mut self, local: IpAddr, remote: IpAddr, create: bool) -> Option<VcId> {
        let key = VcKey::new(local, remote);
        if let Some(id) = self.vc_index.get(&key) {
            return Some(*id);
        }
        if !create {
            return None;
        }
        let id = VcId(self.alloc_id());
        self.vcs.insert(
            id,
            Vc {
                local: VcEndpoint::new(local),
                remote: VcEndpoint::new(remote),
                child_sas: SmallVec::new(),
                updating: false,
                notifiers: NotifierList::new(),
            },
        );
        self.vc_index.insert(key, id);
        debug!(component = "vc", "{} created for {} <-> {}", id, local, remote);
        Some(id)
    }

    /// Look up a VC
    pub fn vc(&self, id: VcId) -> Option<&Vc> {
        self.vcs.get(&id)
    }

    /// Child SA came up or went down
    ///
    /// Child id 0 is ignored. An SA moving between address pairs is
    /// detached from its old VC first.
    pub fn vc_ipsec_updown(&mut self, child_id: u32, local: IpAddr, remote: IpAddr, up: bool) -> Result<()> {
        if child_id == 0 {
            return Ok(());
        }

        let current = self.child_sas.get(&child_id).copied();
        let target = if up { self.vc_get(local, remote, true) } else { current };

        if let Some(old) = current {
            if Some(old) != target || !up {
                self.vc_detach_child(old, child_id);
            }
        }
        if !up {
            return Ok(());
        }

        let Some(id) = target else {
            return Err(NhrpError::NotFound);
        };
        if current == Some(id) {
            return Ok(());
        }
        let Some(vc) = self.vcs.get_mut(&id) else {
            return Err(NhrpError::NotFound);
        };
        if vc.child_sas.len() >= MAX_CHILD_SAS {
            warn!(
                component = "vc",
                "{}: child SA table full, ignoring SA {}", id, child_id
            );
            self.vc_check_delete(id);
            return Err(NhrpError::ResourceExhausted("child SA"));
        }
        vc.child_sas.push(child_id);
        let first = vc.child_sas.len() == 1;
        self.child_sas.insert(child_id, id);
        debug!(component = "vc", "{}: child SA {} up", id, child_id);
        if first {
            self.vc_update(id, NotifyEvent::VcIpsecChanged);
        }
        Ok(())
    }

    fn vc_detach_child(&mut self, id: VcId, child_id: u32) {
        self.child_sas.remove(&child_id);
        let Some(vc) = self.vcs.get_mut(&id) else {
            return;
        };
        vc.child_sas.retain(|c| *c != child_id);
        debug!(component = "vc", "{}: child SA {} down", id, child_id);
        if vc.child_sas.is_empty() {
            self.vc_update(id, NotifyEvent::VcIpsecChanged);
        }
    }

    /// Record the identities the negotiator authenticated for a pair
    pub fn vc_update_identity(
        &mut self,
        local: IpAddr,
        remote: IpAddr,
        local_id: &str,
        remote_id: &str,
        remote_cert: Option<Bytes>,
    ) -> Result<()> {
        let id = self.vc_get(local, remote, true).ok_or(NhrpError::NotFound)?;
        let Some(vc) = self.vcs.get_mut(&id) else {
            return Err(NhrpError::NotFound);
        };
        let cert = match remote_cert {
            Some(cert) if cert.len() > MAX_CERT_LEN => {
                warn!(
                    component = "vc",
                    "{}: certificate of {} bytes dropped", id, cert.len()
                );
                None
            }
            cert => cert,
        };
        let (mine, theirs) = if vc.local.nbma == local {
            (&mut vc.local, &mut vc.remote)
        } else {
            (&mut vc.remote, &mut vc.local)
        };
        mine.id = truncate_identity(local_id);
        theirs.id = truncate_identity(remote_id);
        theirs.cert = cert;
        self.vc_check_delete(id);
        Ok(())
    }

    fn vc_update(&mut self, id: VcId, event: NotifyEvent) {
        if let Some(vc) = self.vcs.get_mut(&id) {
            vc.updating = true;
        }
        self.announce(NotifierOwner::Vc(id), event);
        if let Some(vc) = self.vcs.get_mut(&id) {
            vc.updating = false;
        }
        self.vc_check_delete(id);
    }

    /// Release a VC nobody needs any more
    pub(crate) fn vc_check_delete(&mut self, id: VcId) {
        let Some(vc) = self.vcs.get(&id) else {
            return;
        };
        if vc.updating || vc.ipsec() > 0 || vc.notifiers.has_subscribers() {
            return;
        }
        let key = VcKey::new(vc.local.nbma, vc.remote.nbma);
        self.vc_index.remove(&key);
        self.vcs.remove(&id);
        debug!(component = "vc", "{} deleted", id);
    }

    pub(crate) fn vc_subscribe(&mut self, id: VcId, subscriber: Subscriber) {
        if let Some(vc) = self.vcs.get_mut(&id) {
            vc.notifiers.subscribe(subscriber);
        }
    }

    pub(crate) fn vc_unsubscribe(&mut self, id: VcId, subscriber: Subscriber) {
        if let Some(vc) = self.vcs.get_mut(&id) {
            vc.notifiers.unsubscribe(&subscriber);
        }
        self.vc_check_delete(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ip, setup};

    #[test]
    fn test_lookup_is_symmetric() {
        let (mut nhrp, _rx) = setup();
        let a = nhrp.vc_get(ip("192.0.2.1"), ip("192.0.2.2"), true).unwrap();
        let b = nhrp.vc_get(ip("192.0.2.2"), ip("192.0.2.1"), false).unwrap();
        assert_eq!(a, b);
        assert_eq!(nhrp.vc(a).unwrap().local.nbma, ip("192.0.2.1"));
    }

    #[test]
    fn test_child_sa_counting() {
        let (mut nhrp, _rx) = setup();
        let (l, r) = (ip("192.0.2.1"), ip("192.0.2.2"));
        nhrp.vc_ipsec_updown(0, l, r, true).unwrap();
        assert!(nhrp.vc_get(l, r, false).is_none());

        nhrp.vc_ipsec_updown(10, l, r, true).unwrap();
        nhrp.vc_ipsec_updown(11, r, l, true).unwrap();
        let id = nhrp.vc_get(l, r, false).unwrap();
        assert_eq!(nhrp.vc(id).unwrap().ipsec(), 2);

        nhrp.vc_ipsec_updown(10, l, r, false).unwrap();
        assert_eq!(nhrp.vc(id).unwrap().ipsec(), 1);
        nhrp.vc_ipsec_updown(11, l, r, false).unwrap();
        assert!(nhrp.vc(id).is_none());
    }

    #[test]
    fn test_child_sa_limit() {
        let (mut nhrp, _rx) = setup();
        let (l, r) = (ip("192.0.2.1"), ip("192.0.2.2"));
        for child in 1..=MAX_CHILD_SAS as u32 {
            nhrp.vc_ipsec_updown(child, l, r, true).unwrap();
        }
        assert_eq!(
            nhrp.vc_ipsec_updown(100, l, r, true),
            Err(NhrpError::ResourceExhausted("child SA"))
        );
        let id = nhrp.vc_get(l, r, false).unwrap();
        assert_eq!(nhrp.vc(id).unwrap().ipsec(), MAX_CHILD_SAS);
    }

    #[test]
    fn test_identity_bounds() {
        let (mut nhrp, _rx) = setup();
        let (l, r) = (ip("192.0.2.1"), ip("192.0.2.2"));
        nhrp.vc_ipsec_updown(1, l, r, true).unwrap();
        let long = "é".repeat(40);
        nhrp.vc_update_identity(r, l, "hub", &long, Some(Bytes::from(vec![0u8; 4096])))
            .unwrap();

        let id = nhrp.vc_get(l, r, false).unwrap();
        let vc = nhrp.vc(id).unwrap();
        assert_eq!(vc.remote.id, "hub");
        assert_eq!(vc.local.id.len(), MAX_IDENTITY_LEN);
        assert!(vc.local.cert.is_none());
    }
}
