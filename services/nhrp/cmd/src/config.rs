//! Daemon configuration.
//!
//! The configuration is read from a YAML file and then overridden by
//! environment variables (`NHRP_LISTEN`, `NHRP_NBMA_PORT`,
//! `NHRP_EVENT_SOCKET`) and finally by command line arguments.

use anyhow::{bail, Context, Result};
use nhrp_core::{CoreConfig, InterfaceFlags};
use nhrp_routing::Prefix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default UDP port carrying encapsulated NHRP packets
pub const DEFAULT_NBMA_PORT: u16 = 4500;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NhrpConfig {
    /// Local address of the encapsulation socket
    pub listen: SocketAddr,
    /// Destination port used when sending to an NBMA address
    pub nbma_port: u16,
    /// Unix socket of the event consumer authorizing bindings
    pub event_socket: Option<PathBuf>,
    /// Timer overrides, e.g. `vc_fallback: 45s`
    pub timers: HashMap<String, String>,
    /// NHRP interfaces
    pub interfaces: Vec<InterfaceConfig>,
    /// Routes mirrored into the control plane
    pub routes: Vec<RouteConfig>,
}

/// One NHRP interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name
    pub name: String,
    /// Interface index
    pub ifindex: u32,
    /// Local NBMA address
    pub nbma: Option<IpAddr>,
    /// Protocol addresses, at most one per family
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    /// Advertised holding time, seconds
    pub holdtime: Option<u16>,
    /// Advertised MTU
    pub mtu: Option<u16>,
    /// NBMA network id
    #[serde(default)]
    pub network_id: u32,
    /// Build shortcuts from traffic indications
    #[serde(default)]
    pub shortcut: bool,
    /// Send traffic indications
    #[serde(default)]
    pub redirect: bool,
    /// Register without the unique flag
    #[serde(default)]
    pub registration_no_unique: bool,
    /// Protection profile
    pub protection: Option<String>,
    /// Fallback protection profile
    pub fallback_protection: Option<String>,
    /// Next hop servers
    #[serde(default)]
    pub nhs: Vec<NhsConfig>,
    /// Static protocol to NBMA mappings
    #[serde(default)]
    pub maps: Vec<MapConfig>,
}

/// Next hop server of an interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NhsConfig {
    /// Server protocol address; learned from the registration reply when absent
    pub protocol: Option<IpAddr>,
    /// NBMA host name or address
    pub nbma: String,
}

/// Static mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Protocol address
    pub protocol: IpAddr,
    /// NBMA address
    pub nbma: IpAddr,
}

/// Route mirrored from the routing subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination
    pub prefix: Prefix,
    /// Outgoing interface name
    pub interface: Option<String>,
    /// Gateway
    pub via: Option<IpAddr>,
    /// Discard route
    #[serde(default)]
    pub blackhole: bool,
}

impl Default for NhrpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_NBMA_PORT)),
            nbma_port: DEFAULT_NBMA_PORT,
            event_socket: None,
            timers: HashMap::new(),
            interfaces: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl InterfaceConfig {
    /// Behaviour flags of the interface
    pub fn flags(&self) -> InterfaceFlags {
        let mut flags = InterfaceFlags::empty();
        flags.set(InterfaceFlags::SHORTCUT, self.shortcut);
        flags.set(InterfaceFlags::REDIRECT, self.redirect);
        flags.set(InterfaceFlags::REG_NO_UNIQUE, self.registration_no_unique);
        flags
    }
}

impl NhrpConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final configuration: listen={}, nbma_port={}, interfaces={}, event_socket={:?}",
            config.listen,
            config.nbma_port,
            config.interfaces.len(),
            config.event_socket
        );
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("NHRP_LISTEN") {
            match listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring NHRP_LISTEN={}: {}", listen, e),
            }
        }

        if let Ok(port) = std::env::var("NHRP_NBMA_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.nbma_port = port;
                    info!("NBMA port overridden by environment: {}", port);
                }
                Err(e) => warn!("Ignoring NHRP_NBMA_PORT={}: {}", port, e),
            }
        }

        if let Ok(path) = std::env::var("NHRP_EVENT_SOCKET") {
            info!("Event socket overridden by environment: {}", path);
            self.event_socket = (!path.is_empty()).then(|| PathBuf::from(path));
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for iface in &self.interfaces {
            if let Some(other) = seen.insert(iface.ifindex, &iface.name) {
                bail!("Interfaces {} and {} share ifindex {}", other, iface.name, iface.ifindex);
            }
        }
        for route in &self.routes {
            if let Some(name) = &route.interface {
                if self.ifindex(name).is_none() {
                    bail!("Route {} uses unknown interface {}", route.prefix, name);
                }
            }
        }
        self.core_config()?;
        Ok(())
    }

    /// Interface index by name
    pub fn ifindex(&self, name: &str) -> Option<u32> {
        self.interfaces
            .iter()
            .find(|iface| iface.name == name)
            .map(|iface| iface.ifindex)
    }

    /// Control plane settings with timer overrides applied
    pub fn core_config(&self) -> Result<CoreConfig> {
        let mut core = CoreConfig {
            event_consumer: self.event_socket.is_some(),
            ..CoreConfig::default()
        };
        for (key, value) in &self.timers {
            let duration: Duration = humantime::parse_duration(value)
                .with_context(|| format!("Invalid duration for timer {}: {}", key, value))?;
            let slot = match key.as_str() {
                "vc_fallback" => &mut core.vc_fallback,
                "vc_fallback_first" => &mut core.vc_fallback_first,
                "peer_settle" => &mut core.peer_settle,
                "auth_timeout" => &mut core.auth_timeout,
                "cache_free_delay" => &mut core.cache_free_delay,
                "shortcut_purge" => &mut core.shortcut_purge,
                "shortcut_settle" => &mut core.shortcut_settle,
                "shortcut_soft_purge" => &mut core.shortcut_soft_purge,
                "shortcut_hard_purge" => &mut core.shortcut_hard_purge,
                "reg_initial_delay" => &mut core.reg_initial_delay,
                "reg_flush_delay" => &mut core.reg_flush_delay,
                "reg_link_wait" => &mut core.reg_link_wait,
                "resolve_retry" => &mut core.resolve_retry,
                "resolve_refresh" => &mut core.resolve_refresh,
                "resolve_initial" => &mut core.resolve_initial,
                other => bail!("Unknown timer {}", other),
            };
            *slot = duration;
        }
        Ok(core)
    }
}
