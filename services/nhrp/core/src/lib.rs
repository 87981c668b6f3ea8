//! NHRP control plane.
//!
//! This crate holds the state machines of an NHRP agent on a dynamic
//! multipoint tunnel: interfaces, security associations, peers, the
//! address resolution cache, shortcut routes and next hop server
//! registration. Everything lives in one [`Nhrp`] context driven by method
//! calls, and every side effect leaves as an [`Effect`].
//!
//! ## Features
//!
//! - **Single-threaded core**: no locks, deterministic timers
//! - **Two-phase bindings**: learned bindings wait for peer and authorization
//! - **Notifier lists**: entities observe each other without ownership cycles
//! - **Request correlation**: replies, resolver answers and event replies by id
//!
//! ## Architecture
//!
//! ```text
//! +-----------+   +-------+   +------+   +-------+   +----------+
//! | interface |-->| vc/   |-->| peer |-->| cache |-->| shortcut |
//! |           |   | peer  |   |      |   |       |   |          |
//! +-----------+   +-------+   +------+   +-------+   +----------+
//!       |                        ^           ^
//!       v                        |           |
//! +-----------+             +---------+  +----------+
//! |    nhs    |------------>| dispatch|->|  event   |
//! +-----------+             +---------+  +----------+
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use nhrp_core::{CoreConfig, EffectSink, Nhrp};
//! use nhrp_wire::Afi;
//! use std::time::Instant;
//!
//! let (sink, mut effects) = EffectSink::channel();
//! let mut nhrp = Nhrp::new(CoreConfig::default(), sink, Instant::now());
//! nhrp.interface_add(7, "gre1")?;
//! nhrp.interface_set_up(7, true)?;
//! nhrp.interface_set_nbma(7, Some("192.0.2.1".parse()?))?;
//! nhrp.interface_set_address(7, Afi::Ipv4, Some("10.0.0.1".parse()?))?;
//! nhrp.nhs_add(7, Afi::Ipv4, None, "hub.example.net")?;
//!
//! nhrp.run_timers(Instant::now());
//! while let Ok(effect) = effects.try_recv() {
//!     println!("{:?}", effect);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod effects;
pub mod error;
pub mod event;
pub mod interface;
pub mod nhrp;
pub mod nhs;
pub mod notifier;
pub mod peer;
pub mod reqid;
pub mod route;
pub mod shortcut;
pub mod timer;
pub mod types;
pub mod vc;

#[cfg(test)]
mod test_util;

// Re-export main types
pub use cache::{Binding, BindingStatus, BindingUpdate, CacheCounts, CacheEntry, CacheSnapshot};
pub use config::{CoreConfig, DEFAULT_HOLDTIME};
pub use effects::{Effect, EffectSink, RouteRequest};
pub use error::{NhrpError, Result};
pub use interface::{Interface, InterfaceSnapshot};
pub use nhrp::Nhrp;
pub use nhs::{Nhs, NhsSnapshot, Registration, RegistrationSnapshot};
pub use peer::{Peer, PeerSnapshot};
pub use route::RouteLookup;
pub use shortcut::{Shortcut, ShortcutSnapshot};
pub use types::{
    CacheId, CacheType, Establish, InterfaceFlags, NhsId, NotifyEvent, PeerId, RegId, ShortcutId,
    VcId,
};
pub use vc::{Vc, VcEndpoint};
