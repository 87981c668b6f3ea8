//! Timer settings of the control plane.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default holding time advertised for own bindings, in seconds
pub const DEFAULT_HOLDTIME: u16 = 7200;

/// Control plane timing and behaviour settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Wait for security negotiation before giving up (or trying the fallback)
    pub vc_fallback: Duration,
    /// Shorter first wait used when a fallback profile is configured
    pub vc_fallback_first: Duration,
    /// Delay before announcing a peer that came online to its subscribers
    pub peer_settle: Duration,
    /// Wait for a binding authorization reply
    pub auth_timeout: Duration,
    /// Delay before releasing an invalidated cache entry
    pub cache_free_delay: Duration,
    /// Lifetime of a shortcut whose resolution never completes
    pub shortcut_purge: Duration,
    /// Lifetime of a shortcut after its resolution finished or failed
    pub shortcut_settle: Duration,
    /// Grace period after a covering route changed
    pub shortcut_soft_purge: Duration,
    /// Purge delay after a covering route was withdrawn
    pub shortcut_hard_purge: Duration,
    /// Delay of the first registration after an NHS resolves
    pub reg_initial_delay: Duration,
    /// Delay of an immediate registration retry
    pub reg_flush_delay: Duration,
    /// Retry interval while the NHS peer is unreachable
    pub reg_link_wait: Duration,
    /// Retry after a failed NHS name resolution
    pub resolve_retry: Duration,
    /// Refresh interval of resolved NHS names
    pub resolve_refresh: Duration,
    /// Delay of the first NHS name resolution
    pub resolve_initial: Duration,
    /// Whether an event consumer is attached and must authorize bindings
    pub event_consumer: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            vc_fallback: Duration::from_secs(30),
            vc_fallback_first: Duration::from_secs(15),
            peer_settle: Duration::from_millis(50),
            auth_timeout: Duration::from_secs(60),
            cache_free_delay: Duration::from_millis(10),
            shortcut_purge: Duration::from_secs(30),
            shortcut_settle: Duration::from_secs(1),
            shortcut_soft_purge: Duration::from_secs(3),
            shortcut_hard_purge: Duration::from_millis(5),
            reg_initial_delay: Duration::from_millis(50),
            reg_flush_delay: Duration::from_millis(10),
            reg_link_wait: Duration::from_secs(120),
            resolve_retry: Duration::from_secs(5),
            resolve_refresh: Duration::from_secs(2 * 60 * 60),
            resolve_initial: Duration::from_secs(1),
            event_consumer: false,
        }
    }
}
