//! Route entries and destination classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// How a destination is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteType {
    /// Unroutable, or explicitly discarded
    Blackhole,
    /// One of this node's own addresses
    Local,
    /// Reachable through a peer on an NHRP interface
    NbmaNexthop,
    /// Routed somewhere outside the NBMA network
    OffNbma,
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteType::Blackhole => "blackhole",
            RouteType::Local => "local",
            RouteType::NbmaNexthop => "nbma-nexthop",
            RouteType::OffNbma => "off-nbma",
        };
        f.write_str(name)
    }
}

/// A route learned from the routing subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibEntry {
    /// Outgoing interface, if any
    pub ifindex: Option<u32>,
    /// Gateway, `None` for connected routes
    pub nexthop: Option<IpAddr>,
    /// Discard route
    #[serde(default)]
    pub blackhole: bool,
}

impl RibEntry {
    /// Connected route on an interface
    pub fn connected(ifindex: u32) -> Self {
        Self {
            ifindex: Some(ifindex),
            nexthop: None,
            blackhole: false,
        }
    }

    /// Route through a gateway on an interface
    pub fn via(ifindex: u32, nexthop: IpAddr) -> Self {
        Self {
            ifindex: Some(ifindex),
            nexthop: Some(nexthop),
            blackhole: false,
        }
    }

    /// Discard route
    pub fn blackhole() -> Self {
        Self {
            ifindex: None,
            nexthop: None,
            blackhole: true,
        }
    }
}
