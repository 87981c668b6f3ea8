//! Control plane error types.

use nhrp_wire::WireError;
use thiserror::Error;

/// Control plane errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NhrpError {
    /// Malformed packet
    #[error("decode error: {0}")]
    Decode(#[from] WireError),

    /// Address family or binding address does not match
    #[error("protocol address mismatch")]
    AddressMismatch,

    /// Pool or table full
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Interface unknown or not an NHRP interface
    #[error("unsupported interface {0}")]
    UnsupportedInterface(u32),

    /// Interface lacks NBMA or protocol configuration
    #[error("NHRP not enabled on interface {0}")]
    NotEnabled(u32),

    /// No matching entry
    #[error("entry not found")]
    NotFound,

    /// Conflicting entry already configured
    #[error("entry exists")]
    EntryExists,

    /// A binding of higher authority is in place
    #[error("binding refused")]
    Refused,
}

/// Result alias for control plane operations
pub type Result<T> = std::result::Result<T, NhrpError>;
