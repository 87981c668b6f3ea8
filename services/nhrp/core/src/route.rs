//! Destination classification against the mirrored routing table.

use nhrp_routing::{Prefix, RibEntry, RouteType};
use std::net::IpAddr;
use tracing::debug;

use crate::types::{CacheType, PeerId};
use crate::Nhrp;

/// Recursive lookups followed before giving up
const MAX_RECURSION: usize = 4;

/// Result of [`Nhrp::route_address`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLookup {
    /// Classification
    pub route_type: RouteType,
    /// Matching route prefix, for destinations leaving the NBMA network
    pub prefix: Option<Prefix>,
    /// Next hop peer; the caller owns one reference
    pub peer: Option<PeerId>,
}

impl RouteLookup {
    fn new(route_type: RouteType) -> Self {
        Self {
            route_type,
            prefix: None,
            peer: None,
        }
    }
}

impl Nhrp {
    /// Apply a routing update; `None` withdraws the prefix
    ///
    /// Shortcuts inside the changed prefix are purged so they re-resolve
    /// against the new topology.
    pub fn route_update(&mut self, prefix: Prefix, entry: Option<RibEntry>) {
        let deleted = entry.is_none();
        if self.routes.update(prefix, entry) {
            self.shortcut_prefix_change(&prefix, deleted);
        }
    }

    /// Classify how `addr` is reached and find its next hop peer
    ///
    /// `in_ifindex` is the interface a packet arrived on; routes leaving
    /// towards another NBMA network are then reported as off-NBMA.
    pub fn route_address(&mut self, in_ifindex: Option<u32>, addr: IpAddr) -> RouteLookup {
        let mut network_id = 0;
        if let Some(ifindex) = in_ifindex {
            if let Some(iface) = self.interfaces.get(&ifindex) {
                network_id = iface.network_id;
            }
            if let Some(c) = self.cache_index.get(&(ifindex, addr)).and_then(|id| self.caches.get(id)) {
                if c.cur.cache_type == CacheType::Local {
                    return RouteLookup::new(RouteType::Local);
                }
            }
        }

        let mut target = addr;
        let mut first_prefix = None;
        let mut out_ifindex = None;
        for _ in 0..MAX_RECURSION {
            let Some((prefix, entry)) = self.routes.lookup(&target) else {
                debug!(component = "route", "No route to {}", target);
                return RouteLookup::new(RouteType::Blackhole);
            };
            if entry.blackhole {
                return RouteLookup::new(RouteType::Blackhole);
            }
            let entry = entry.clone();
            if first_prefix.is_none() {
                first_prefix = Some(prefix);
            }

            if let Some(ifindex) = entry.ifindex {
                let off_nbma = match self.interfaces.get(&ifindex) {
                    None => true,
                    Some(iface) => network_id != 0 && iface.network_id != network_id,
                };
                if off_nbma {
                    return RouteLookup {
                        route_type: RouteType::OffNbma,
                        prefix: first_prefix,
                        peer: None,
                    };
                }
                out_ifindex = Some(ifindex);
            }
            match entry.nexthop {
                Some(via) => target = via,
                None => break,
            }
        }

        let Some(ifindex) = out_ifindex else {
            return RouteLookup::new(RouteType::Blackhole);
        };
        let binding = self
            .cache_index
            .get(&(ifindex, target))
            .and_then(|id| self.caches.get(id))
            .map(|c| c.cur);
        match binding {
            Some(b) if b.cache_type == CacheType::Local => RouteLookup::new(RouteType::Local),
            Some(b) if b.cache_type >= CacheType::Dynamic => match b.peer.and_then(|p| self.peer_ref(p)) {
                Some(peer) => RouteLookup {
                    route_type: RouteType::NbmaNexthop,
                    prefix: None,
                    peer: Some(peer),
                },
                None => RouteLookup::new(RouteType::Blackhole),
            },
            _ => RouteLookup::new(RouteType::Blackhole),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{enabled_interface, ip, setup, IFINDEX};

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn test_local_address() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let lookup = nhrp.route_address(Some(IFINDEX), ip("10.0.0.1"));
        assert_eq!(lookup.route_type, RouteType::Local);
    }

    #[test]
    fn test_no_route_is_blackhole() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let lookup = nhrp.route_address(None, ip("10.9.9.9"));
        assert_eq!(lookup.route_type, RouteType::Blackhole);
        assert!(lookup.peer.is_none());
    }

    #[test]
    fn test_nexthop_through_hub() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        let hub = ip("10.0.0.254");
        nhrp.map_static(IFINDEX, hub, ip("192.0.2.254")).unwrap();
        nhrp.route_update(prefix("10.0.0.0/24"), Some(RibEntry::connected(IFINDEX)));
        nhrp.route_update(prefix("10.1.0.0/16"), Some(RibEntry::via(IFINDEX, hub)));

        let lookup = nhrp.route_address(None, ip("10.1.2.3"));
        assert_eq!(lookup.route_type, RouteType::NbmaNexthop);
        let peer = lookup.peer.unwrap();
        assert_eq!(nhrp.peer(peer).unwrap().remote_nbma, ip("192.0.2.254"));
        assert_eq!(nhrp.peer(peer).unwrap().refcount(), 2);
        nhrp.peer_unref(peer);
    }

    #[test]
    fn test_off_nbma() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.route_update(prefix("0.0.0.0/0"), Some(RibEntry::via(2, ip("198.51.100.1"))));
        let lookup = nhrp.route_address(Some(IFINDEX), ip("203.0.113.5"));
        assert_eq!(lookup.route_type, RouteType::OffNbma);
        assert_eq!(lookup.prefix, Some(prefix("0.0.0.0/0")));
    }

    #[test]
    fn test_blackhole_route() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.route_update(prefix("10.2.0.0/16"), Some(RibEntry::blackhole()));
        assert_eq!(
            nhrp.route_address(None, ip("10.2.0.1")).route_type,
            RouteType::Blackhole
        );
    }

    #[test]
    fn test_unresolved_nexthop_is_blackhole() {
        let (mut nhrp, _rx) = setup();
        enabled_interface(&mut nhrp);
        nhrp.route_update(prefix("10.0.0.0/24"), Some(RibEntry::connected(IFINDEX)));
        assert_eq!(
            nhrp.route_address(None, ip("10.0.0.77")).route_type,
            RouteType::Blackhole
        );
    }
}
