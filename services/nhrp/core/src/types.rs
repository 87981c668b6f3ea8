//! Identifiers, entity kinds and the events exchanged between subsystems.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub(crate) u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Peer handle
    PeerId,
    "peer#"
);
entity_id!(
    /// Cache entry handle
    CacheId,
    "cache#"
);
entity_id!(
    /// Shortcut handle
    ShortcutId,
    "shortcut#"
);
entity_id!(
    /// Security association handle
    VcId,
    "vc#"
);
entity_id!(
    /// Next hop server handle
    NhsId,
    "nhs#"
);
entity_id!(
    /// NHS registration handle
    RegId,
    "reg#"
);

/// Binding type of a cache entry or shortcut, in increasing authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// No binding
    Invalid,
    /// Resolution in flight
    Incomplete,
    /// Resolution failed; cached to rate-limit retries
    Negative,
    /// Learned from a resolution reply
    Cached,
    /// Learned from a registration
    Dynamic,
    /// Binding of a next hop server
    Nhs,
    /// Administratively configured
    Static,
    /// One of this node's own addresses
    Local,
}

impl CacheType {
    /// All types, in order
    pub const ALL: [CacheType; 8] = [
        CacheType::Invalid,
        CacheType::Incomplete,
        CacheType::Negative,
        CacheType::Cached,
        CacheType::Dynamic,
        CacheType::Nhs,
        CacheType::Static,
        CacheType::Local,
    ];

    /// Whether the binding resolves to a usable next hop
    pub fn is_up(self) -> bool {
        self >= CacheType::Cached
    }

    /// Administrator or self bindings that never expire
    pub fn is_permanent(self) -> bool {
        self >= CacheType::Static
    }

    /// Index into per-type counters
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short name as used in events and listings
    pub fn name(self) -> &'static str {
        match self {
            CacheType::Invalid => "invalid",
            CacheType::Incomplete => "incomplete",
            CacheType::Negative => "negative",
            CacheType::Cached => "cached",
            CacheType::Dynamic => "dynamic",
            CacheType::Nhs => "nhs",
            CacheType::Static => "static",
            CacheType::Local => "local",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Per-interface behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InterfaceFlags: u32 {
        /// Act on traffic indications by building shortcuts
        const SHORTCUT = 0x0001;
        /// Send traffic indications for hairpinned traffic
        const REDIRECT = 0x0002;
        /// Register without the unique flag
        const REG_NO_UNIQUE = 0x0100;
    }
}

/// State change announced through notifier lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    /// Interface became enabled
    InterfaceUp,
    /// Interface became disabled
    InterfaceDown,
    /// Interface protocol or NAT address changed
    InterfaceAddressChanged,
    /// Interface NBMA address changed
    InterfaceNbmaChanged,
    /// Protection profile changed
    InterfaceIpsecChanged,
    /// Security association gained its first or lost its last child SA
    VcIpsecChanged,
    /// Peer came online
    PeerUp,
    /// Peer went offline
    PeerDown,
    /// Peer's interface configuration changed
    PeerIfconfigChanged,
    /// Cache entry became usable
    CacheUp,
    /// Cache entry stopped being usable
    CacheDown,
    /// Cache entry is about to be released
    CacheDelete,
    /// Traffic used a cache entry
    CacheUsed,
    /// Cache binding replaced
    CacheBindingChange,
}

/// Entity owning a notifier list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifierOwner {
    /// Interface by ifindex
    Interface(u32),
    /// Security association
    Vc(VcId),
    /// Peer
    Peer(PeerId),
    /// Cache entry
    Cache(CacheId),
}

/// Subscription held by an entity on some notifier list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// Peer watching its interface and security association
    Peer(PeerId),
    /// Cache entry watching its current peer
    Cache(CacheId),
    /// Cache entry waiting for its pending peer
    CachePending(CacheId),
    /// Shortcut watching its cache entry
    Shortcut(ShortcutId),
    /// Registration watching its NHS peer
    Registration(RegId),
}

/// What a shortcut timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    /// Two thirds of the holding time elapsed
    Expire,
    /// Remove the shortcut
    Purge,
}

/// What a registration timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAction {
    /// Send a registration request
    Send,
    /// No reply arrived in time
    Timeout,
}

/// Timer tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Security negotiation did not complete in time
    PeerFallback(PeerId),
    /// Settle delay before announcing a peer up
    PeerNotifyUp(PeerId),
    /// Current binding expired
    CacheTimeout(CacheId),
    /// Release an invalid entry
    CacheFree(CacheId),
    /// Binding authorization timed out
    CacheAuth(CacheId),
    /// Shortcut expiry or purge
    Shortcut(ShortcutId, ShortcutAction),
    /// Registration send or timeout
    Registration(RegId, RegAction),
    /// Re-resolve an NHS name
    NhsResolve(NhsId),
}

/// Completion token of an outstanding packet request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketWaiter {
    /// Resolution request of a shortcut
    Shortcut(ShortcutId),
    /// Registration request
    Registration(RegId),
}

/// How hard [`crate::Nhrp::peer_check`] tries to bring a peer online
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Establish {
    /// Only report the current state
    No,
    /// Request security negotiation if needed
    Yes,
    /// Request negotiation at priority, skipping the fallback profile
    Priority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_type_classes() {
        let down: Vec<_> = CacheType::ALL.iter().filter(|t| !t.is_up()).collect();
        assert_eq!(
            down,
            vec![&CacheType::Invalid, &CacheType::Incomplete, &CacheType::Negative]
        );
        assert!(CacheType::Static.is_permanent());
        assert!(CacheType::Local.is_permanent());
        assert!(!CacheType::Nhs.is_permanent());
        assert!(CacheType::Dynamic > CacheType::Cached);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PeerId(3).to_string(), "peer#3");
        assert_eq!(CacheType::Nhs.to_string(), "nhs");
    }
}
