//! Routing error types

use thiserror::Error;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Prefix length wider than the address
    #[error("prefix length {len} exceeds {max}")]
    PrefixLength {
        /// Requested length
        len: u8,
        /// Address width in bits
        max: u8,
    },

    /// Unparsable prefix text
    #[error("invalid prefix: {0}")]
    Parse(String),
}
