//! NHRP interfaces.
//!
//! An interface is enabled once it is administratively up and has an NBMA
//! address. Peers subscribe to their interface and react to its
//! announcements.

use nhrp_wire::Afi;
use serde::Serialize;
use std::net::IpAddr;
use tracing::{debug, info};

use crate::cache::BindingUpdate;
use crate::config::DEFAULT_HOLDTIME;
use crate::error::{NhrpError, Result};
use crate::notifier::NotifierList;
use crate::types::{CacheType, InterfaceFlags, NhsId, NotifierOwner, NotifyEvent, Subscriber};
use crate::Nhrp;

/// Per address family interface state
#[derive(Debug, Clone, Default)]
pub struct AfiState {
    /// Protocol address of the interface
    pub address: Option<IpAddr>,
    /// Configured next hop servers
    pub nhs: Vec<NhsId>,
}

/// NHRP enabled interface
#[derive(Debug, Clone)]
pub struct Interface {
    /// Kernel interface index
    pub ifindex: u32,
    /// Interface name
    pub name: String,
    /// Administrative and link state
    pub up: bool,
    /// Up with an NBMA address
    pub enabled: bool,
    /// Local NBMA address
    pub nbma: Option<IpAddr>,
    /// Address our NBMA address is translated to, as reported by an NHS
    pub nat_nbma: Option<IpAddr>,
    /// Behaviour switches
    pub flags: InterfaceFlags,
    /// Holding time advertised in our CIEs, seconds
    pub holdtime: u16,
    /// MTU advertised in our CIEs, 0 if unspecified
    pub mtu: u16,
    /// NBMA network identifier; 0 when unset
    pub network_id: u32,
    /// Protection profile handed to the security negotiator
    pub ipsec_profile: Option<String>,
    /// Profile tried when the primary one does not come up
    pub ipsec_fallback_profile: Option<String>,
    pub(crate) afi: [AfiState; 2],
    pub(crate) notifiers: NotifierList<Subscriber>,
}

/// Listing of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSnapshot {
    /// Kernel interface index
    pub ifindex: u32,
    /// Interface name
    pub name: String,
    /// Enabled state
    pub enabled: bool,
    /// Local NBMA address
    pub nbma: Option<IpAddr>,
    /// Translated NBMA address
    pub nat_nbma: Option<IpAddr>,
    /// IPv4 protocol address
    pub ipv4: Option<IpAddr>,
    /// IPv6 protocol address
    pub ipv6: Option<IpAddr>,
}

pub(crate) fn afi_index(afi: Afi) -> usize {
    match afi {
        Afi::Ipv4 => 0,
        Afi::Ipv6 => 1,
    }
}

impl Interface {
    fn new(ifindex: u32, name: String) -> Self {
        Self {
            ifindex,
            name,
            up: false,
            enabled: false,
            nbma: None,
            nat_nbma: None,
            flags: InterfaceFlags::empty(),
            holdtime: DEFAULT_HOLDTIME,
            mtu: 0,
            network_id: 0,
            ipsec_profile: None,
            ipsec_fallback_profile: None,
            afi: Default::default(),
            notifiers: NotifierList::new(),
        }
    }

    /// Protocol address of a family
    pub fn address(&self, afi: Afi) -> Option<IpAddr> {
        self.afi[afi_index(afi)].address
    }

    /// Next hop servers of a family
    pub fn nhs(&self, afi: Afi) -> &[NhsId] {
        &self.afi[afi_index(afi)].nhs
    }

    /// Local NBMA address, or the unspecified address of `family`
    pub(crate) fn nbma_or_unspecified(&self, family: Afi) -> IpAddr {
        self.nbma.unwrap_or_else(|| family.unspecified())
    }

    fn snapshot(&self) -> InterfaceSnapshot {
        InterfaceSnapshot {
            ifindex: self.ifindex,
            name: self.name.clone(),
            enabled: self.enabled,
            nbma: self.nbma,
            nat_nbma: self.nat_nbma,
            ipv4: self.address(Afi::Ipv4),
            ipv6: self.address(Afi::Ipv6),
        }
    }
}

impl Nhrp {
    /// Look up an interface
    pub fn interface(&self, ifindex: u32) -> Option<&Interface> {
        self.interfaces.get(&ifindex)
    }

    /// Snapshot of every interface, ordered by index
    pub fn interfaces(&self) -> Vec<InterfaceSnapshot> {
        let mut out: Vec<_> = self.interfaces.values().map(Interface::snapshot).collect();
        out.sort_by_key(|i| i.ifindex);
        out
    }

    /// Start tracking an interface
    pub fn interface_add(&mut self, ifindex: u32, name: &str) -> Result<()> {
        if self.interfaces.contains_key(&ifindex) {
            return Err(NhrpError::EntryExists);
        }
        info!(component = "if", "Interface {} ({}) added", name, ifindex);
        self.interfaces.insert(ifindex, Interface::new(ifindex, name.to_string()));
        Ok(())
    }

    /// Stop tracking an interface and drop everything learned on it
    pub fn interface_delete(&mut self, ifindex: u32) -> Result<()> {
        let name = match self.interfaces.get(&ifindex) {
            Some(iface) => iface.name.clone(),
            None => return Err(NhrpError::UnsupportedInterface(ifindex)),
        };

        for id in self.shortcuts_on(ifindex) {
            self.shortcut_delete(id);
        }
        for afi in [Afi::Ipv4, Afi::Ipv6] {
            let nhs: Vec<NhsId> = self.interfaces[&ifindex].nhs(afi).to_vec();
            for id in nhs {
                self.nhs_free(id);
            }
        }
        let caches: Vec<_> = self
            .cache_index
            .iter()
            .filter(|((idx, _), _)| *idx == ifindex)
            .map(|(_, id)| *id)
            .collect();
        for id in caches {
            self.cache_delete(id);
        }

        if let Some(iface) = self.interfaces.get_mut(&ifindex) {
            iface.up = false;
        }
        self.interface_update(ifindex);

        let peers: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, p)| p.ifindex == ifindex)
            .map(|(id, _)| *id)
            .collect();
        for id in peers {
            self.peer_detach(id);
        }

        self.interfaces.remove(&ifindex);
        info!(component = "if", "Interface {} ({}) deleted", name, ifindex);
        Ok(())
    }

    /// Record administrative or link state
    pub fn interface_set_up(&mut self, ifindex: u32, up: bool) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        iface.up = up;
        self.interface_update(ifindex);
        Ok(())
    }

    /// Set or clear the NBMA address
    pub fn interface_set_nbma(&mut self, ifindex: u32, nbma: Option<IpAddr>) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        if iface.nbma == nbma {
            return Ok(());
        }
        debug!(component = "if", "{}: NBMA address changed to {:?}", iface.name, nbma);
        iface.nbma = nbma;
        iface.nat_nbma = None;
        self.announce(NotifierOwner::Interface(ifindex), NotifyEvent::InterfaceNbmaChanged);
        self.interface_update(ifindex);
        Ok(())
    }

    /// Set or clear the protocol address of a family
    ///
    /// The address is bound as a `local` cache entry; the entry of the
    /// previous address is invalidated.
    pub fn interface_set_address(&mut self, ifindex: u32, afi: Afi, addr: Option<IpAddr>) -> Result<()> {
        if addr.is_some_and(|a| Afi::of(&a) != afi) {
            return Err(NhrpError::AddressMismatch);
        }
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        let slot = &mut iface.afi[afi_index(afi)];
        if slot.address == addr {
            return Ok(());
        }
        let old = std::mem::replace(&mut slot.address, addr);
        debug!(component = "if", "{}: {:?} address changed to {:?}", iface.name, afi, addr);

        if let Some(old) = old {
            if let Some(id) = self.cache_get(ifindex, old, false) {
                self.cache_invalidate(id);
            }
        }
        if let Some(addr) = addr {
            if let Some(id) = self.cache_get(ifindex, addr, true) {
                self.cache_update_binding(
                    id,
                    BindingUpdate::new(CacheType::Local, 0).with_protocol(addr),
                )?;
            }
        }
        self.announce(NotifierOwner::Interface(ifindex), NotifyEvent::InterfaceAddressChanged);
        Ok(())
    }

    /// Holding time advertised in registrations and replies
    pub fn interface_set_holdtime(&mut self, ifindex: u32, holdtime: u16) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        iface.holdtime = holdtime;
        Ok(())
    }

    /// Behaviour switches
    pub fn interface_set_flags(&mut self, ifindex: u32, flags: InterfaceFlags) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        iface.flags = flags;
        Ok(())
    }

    /// MTU advertised in our CIEs
    pub fn interface_set_mtu(&mut self, ifindex: u32, mtu: u16) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        iface.mtu = mtu;
        Ok(())
    }

    /// NBMA network identifier used to detect routes leaving the overlay
    pub fn interface_set_network_id(&mut self, ifindex: u32, network_id: u32) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        iface.network_id = network_id;
        Ok(())
    }

    /// Protection profiles; peers re-evaluate their state
    pub fn interface_set_protection(
        &mut self,
        ifindex: u32,
        profile: Option<String>,
        fallback: Option<String>,
    ) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(NhrpError::UnsupportedInterface(ifindex))?;
        if iface.ipsec_profile == profile && iface.ipsec_fallback_profile == fallback {
            return Ok(());
        }
        iface.ipsec_profile = profile;
        iface.ipsec_fallback_profile = fallback;
        self.announce(NotifierOwner::Interface(ifindex), NotifyEvent::InterfaceIpsecChanged);
        Ok(())
    }

    /// Record the translated NBMA address reported by an NHS
    pub(crate) fn interface_set_nat_nbma(&mut self, ifindex: u32, nat_nbma: Option<IpAddr>) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else {
            return;
        };
        if iface.nat_nbma == nat_nbma {
            return;
        }
        info!(component = "if", "{}: NAT detected, NBMA seen as {:?}", iface.name, nat_nbma);
        iface.nat_nbma = nat_nbma;
        self.announce(NotifierOwner::Interface(ifindex), NotifyEvent::InterfaceAddressChanged);
    }

    fn interface_update(&mut self, ifindex: u32) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else {
            return;
        };
        let enabled = iface.up && iface.nbma.is_some();
        if enabled == iface.enabled {
            return;
        }
        iface.enabled = enabled;
        info!(
            component = "if",
            "{}: NHRP {}",
            iface.name,
            if enabled { "enabled" } else { "disabled" }
        );
        let event = if enabled {
            NotifyEvent::InterfaceUp
        } else {
            NotifyEvent::InterfaceDown
        };
        self.announce(NotifierOwner::Interface(ifindex), event);
    }
}
