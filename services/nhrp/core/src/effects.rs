//! Outbound requests to the collaborators around the control plane.
//!
//! The core never performs I/O. Everything it wants done (route and
//! neighbour programming, packet transmission, security negotiation, name
//! resolution and event export) is emitted as an [`Effect`] on an unbounded
//! channel drained by the host.

use bytes::Bytes;
use nhrp_routing::Prefix;
use nhrp_wire::Afi;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::types::CacheType;

/// Route announcement towards the routing subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Install (`true`) or withdraw
    pub add: bool,
    /// Binding type behind the route
    pub cache_type: CacheType,
    /// Destination
    pub prefix: Prefix,
    /// Outgoing interface
    pub ifindex: Option<u32>,
    /// Gateway
    pub nexthop: Option<IpAddr>,
}

/// Side effect requested by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Announce or withdraw a route
    Route(RouteRequest),
    /// Program (`Some`) or remove the kernel neighbour binding of an address
    Neighbor {
        /// Interface
        ifindex: u32,
        /// Protocol address
        protocol: IpAddr,
        /// NBMA address to bind
        nbma: Option<IpAddr>,
    },
    /// Transmit a packet to an NBMA address
    Send {
        /// Interface
        ifindex: u32,
        /// Destination NBMA address
        nbma: IpAddr,
        /// Complete packet
        packet: Bytes,
    },
    /// Ask the security negotiator for a connection
    RequestVc {
        /// Protection profile
        profile: String,
        /// Local NBMA address
        local: IpAddr,
        /// Remote NBMA address
        remote: IpAddr,
        /// Priority request
        prio: bool,
    },
    /// Resolve a host name; answer with [`crate::Nhrp::resolve_result`]
    Resolve {
        /// Resolver request id
        id: u32,
        /// Wanted family
        afi: Afi,
        /// Name or literal address
        hostname: String,
    },
    /// Export an event; answer with [`crate::Nhrp::event_reply`] if `id` is set
    Event {
        /// Event request id
        id: Option<u32>,
        /// Event name
        name: String,
        /// Ordered key/value pairs
        fields: Vec<(String, String)>,
    },
}

impl Effect {
    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Route(_) => "route",
            Effect::Neighbor { .. } => "neighbor",
            Effect::Send { .. } => "send",
            Effect::RequestVc { .. } => "request-vc",
            Effect::Resolve { .. } => "resolve",
            Effect::Event { .. } => "event",
        }
    }
}

/// Sending half of the effect channel
#[derive(Debug, Clone)]
pub struct EffectSink {
    tx: mpsc::UnboundedSender<Effect>,
}

impl EffectSink {
    /// Wrap a channel sender
    pub fn new(tx: mpsc::UnboundedSender<Effect>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Effect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue an effect
    pub fn emit(&self, effect: Effect) {
        let kind = effect.kind();
        if let Err(e) = self.tx.send(effect) {
            error!("Failed to emit {} effect: {}", kind, e);
        } else {
            debug!("Emitted {} effect", kind);
        }
    }
}
