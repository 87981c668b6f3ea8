//! Prefixes, longest-prefix-match tables and route classification for NHRP.
//!
//! This crate mirrors the parts of the routing information base the NHRP
//! agent needs: which prefixes are routed where, and how a destination is
//! classified (local, reachable over the NBMA network, or off it).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod prefix;
pub mod route;
pub mod table;

pub use error::*;
pub use prefix::*;
pub use route::*;
pub use table::*;
