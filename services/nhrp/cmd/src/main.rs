//! NHRP agent daemon.
//!
//! Runs the control plane on a single-threaded runtime. Encapsulated NHRP
//! packets arrive on a UDP socket standing in for the tunnel's packet
//! socket, NHS names are resolved with the system resolver, and binding
//! authorizations are exchanged with an optional event consumer. Route,
//! neighbour and security requests are logged for the host to act on.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use nhrp_core::{Effect, EffectSink, Nhrp, RouteRequest};
use nhrp_routing::RibEntry;
use nhrp_wire::Afi;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod events;
mod logging;

use config::NhrpConfig;
use events::EventSocket;
use logging::NhrpLogFormatter;

/// Largest datagram accepted on the encapsulation socket
const MAX_PACKET: usize = 65535;

/// NHRP agent for dynamic multipoint tunnels
#[derive(Parser, Debug)]
#[command(name = "nhrpd", version, about = "Next Hop Resolution Protocol agent")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "nhrpd.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Encapsulation socket address, e.g. 0.0.0.0:4500
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Destination UDP port for NBMA peers
    #[arg(long)]
    nbma_port: Option<u16>,
}

/// Apply the configured interfaces, mappings, servers and routes
fn provision(nhrp: &mut Nhrp, config: &NhrpConfig) -> Result<()> {
    for iface in &config.interfaces {
        let ifindex = iface.ifindex;
        nhrp.interface_add(ifindex, &iface.name)?;
        nhrp.interface_set_flags(ifindex, iface.flags())?;
        if let Some(holdtime) = iface.holdtime {
            nhrp.interface_set_holdtime(ifindex, holdtime)?;
        }
        if let Some(mtu) = iface.mtu {
            nhrp.interface_set_mtu(ifindex, mtu)?;
        }
        nhrp.interface_set_network_id(ifindex, iface.network_id)?;
        nhrp.interface_set_protection(
            ifindex,
            iface.protection.clone(),
            iface.fallback_protection.clone(),
        )?;
        nhrp.interface_set_nbma(ifindex, iface.nbma)?;
        for addr in &iface.addresses {
            nhrp.interface_set_address(ifindex, Afi::of(addr), Some(*addr))?;
        }
        nhrp.interface_set_up(ifindex, true)?;

        for map in &iface.maps {
            nhrp.map_static(ifindex, map.protocol, map.nbma)
                .with_context(|| format!("{}: map {} {}", iface.name, map.protocol, map.nbma))?;
        }
        for nhs in &iface.nhs {
            let afi = nhs
                .protocol
                .as_ref()
                .map(Afi::of)
                .or_else(|| iface.addresses.first().map(Afi::of))
                .unwrap_or(Afi::Ipv4);
            nhrp.nhs_add(ifindex, afi, nhs.protocol, &nhs.nbma)
                .with_context(|| format!("{}: nhs {}", iface.name, nhs.nbma))?;
        }
        component_info!("if", "Interface {} ({}) configured", iface.name, ifindex);
    }

    for route in &config.routes {
        let ifindex = route.interface.as_deref().and_then(|name| config.ifindex(name));
        let entry = if route.blackhole {
            RibEntry::blackhole()
        } else {
            RibEntry {
                ifindex,
                nexthop: route.via,
                blackhole: false,
            }
        };
        nhrp.route_update(route.prefix, Some(entry));
    }
    Ok(())
}

/// Interface an encapsulated packet from `from` belongs to
fn ingress_ifindex(nhrp: &Nhrp, config: &NhrpConfig, from: IpAddr) -> Option<u32> {
    config
        .interfaces
        .iter()
        .map(|iface| iface.ifindex)
        .find(|ifindex| nhrp.peer_lookup(*ifindex, from).is_some())
        .or_else(|| {
            config
                .interfaces
                .iter()
                .find(|iface| iface.nbma.is_some_and(|nbma| Afi::of(&nbma) == Afi::of(&from)))
                .map(|iface| iface.ifindex)
        })
}

fn log_route(route: &RouteRequest) {
    let action = if route.add { "add" } else { "del" };
    match (route.nexthop, route.ifindex) {
        (Some(nexthop), _) => component_info!(
            "route",
            "Route {} {} via {} ({})",
            action,
            route.prefix,
            nexthop,
            route.cache_type
        ),
        (None, Some(ifindex)) => component_info!(
            "route",
            "Route {} {} dev {} ({})",
            action,
            route.prefix,
            ifindex,
            route.cache_type
        ),
        (None, None) => component_info!(
            "route",
            "Route {} {} ({})",
            action,
            route.prefix,
            route.cache_type
        ),
    }
}

/// Resolve an NHS name off the event loop
fn spawn_resolve(id: u32, afi: Afi, hostname: String, results: mpsc::UnboundedSender<(u32, Vec<IpAddr>)>) {
    tokio::spawn(async move {
        let addrs = match hostname.parse::<IpAddr>() {
            Ok(addr) => vec![addr],
            Err(_) => match tokio::net::lookup_host((hostname.as_str(), 0)).await {
                Ok(found) => {
                    let mut addrs: Vec<IpAddr> = found
                        .map(|sa| sa.ip())
                        .filter(|ip| Afi::of(ip) == afi)
                        .collect();
                    addrs.dedup();
                    addrs
                }
                Err(e) => {
                    component_warn!("nhs", "Failed to resolve {}: {}", hostname, e);
                    Vec::new()
                }
            },
        };
        component_debug!("nhs", "{} resolved to {:?}", hostname, addrs);
        let _ = results.send((id, addrs));
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("nhrpd={}", args.log_level).parse()?)
        .add_directive(format!("nhrp_core={}", args.log_level).parse()?)
        .add_directive(format!("nhrp_wire={}", args.log_level).parse()?)
        .add_directive(format!("nhrp_routing={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(NhrpLogFormatter::new("nhrpd"))
        .init();

    info!("Starting nhrpd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NhrpConfig::load_from_file(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(port) = args.nbma_port {
        config.nbma_port = port;
    }

    let (sink, mut effects) = EffectSink::channel();
    let mut nhrp = Nhrp::new(config.core_config()?, sink, Instant::now());
    provision(&mut nhrp, &config)?;

    let socket = UdpSocket::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("Listening for encapsulated NHRP on {}", config.listen);

    let (resolved_tx, mut resolved_rx) = mpsc::unbounded_channel::<(u32, Vec<IpAddr>)>();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<(u32, String)>();
    let mut event_socket = match &config.event_socket {
        Some(path) => match EventSocket::connect(path, replies_tx).await {
            Ok(socket) => socket,
            Err(e) => {
                component_error!("event", "{:#}; authorizations will time out", e);
                EventSocket::disconnected()
            }
        },
        None => EventSocket::disconnected(),
    };

    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        nhrp.run_timers(Instant::now());
        tokio::select! {
            _ = sleep_until(nhrp.next_deadline()) => {
                nhrp.run_timers(Instant::now());
            }

            received = socket.recv_from(&mut buf) => {
                nhrp.run_timers(Instant::now());
                match received {
                    Ok((len, from)) => match ingress_ifindex(&nhrp, &config, from.ip()) {
                        Some(ifindex) => {
                            nhrp.recv_packet(ifindex, from.ip(), Bytes::copy_from_slice(&buf[..len]))
                        }
                        None => component_debug!("packet", "No interface for packet from {}", from),
                    },
                    Err(e) => component_warn!("packet", "Receive failed: {}", e),
                }
            }

            Some(effect) = effects.recv() => {
                match effect {
                    Effect::Send { ifindex, nbma, packet } => {
                        let to = SocketAddr::new(nbma, config.nbma_port);
                        if let Err(e) = socket.send_to(&packet, to).await {
                            component_warn!("packet", "Send to {} on {} failed: {}", to, ifindex, e);
                        }
                    }
                    Effect::Route(route) => log_route(&route),
                    Effect::Neighbor { ifindex, protocol, nbma } => match nbma {
                        Some(nbma) => component_info!("cache", "Neighbor {} lladdr {} dev {}", protocol, nbma, ifindex),
                        None => component_info!("cache", "Neighbor {} dev {} removed", protocol, ifindex),
                    },
                    Effect::RequestVc { profile, local, remote, prio } => {
                        component_info!(
                            "vc",
                            "Protection {} requested for {} -> {}{}",
                            profile,
                            local,
                            remote,
                            if prio { " (priority)" } else { "" }
                        );
                    }
                    Effect::Resolve { id, afi, hostname } => {
                        spawn_resolve(id, afi, hostname, resolved_tx.clone());
                    }
                    Effect::Event { id, name, fields } => {
                        event_socket.send(id, &name, &fields).await;
                    }
                }
            }

            Some((id, addrs)) = resolved_rx.recv() => {
                nhrp.run_timers(Instant::now());
                nhrp.resolve_result(id, &addrs);
            }

            Some((id, result)) = replies_rx.recv() => {
                nhrp.run_timers(Instant::now());
                nhrp.event_reply(id, &result);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
        }
    }

    for iface in &config.interfaces {
        if let Err(e) = nhrp.interface_delete(iface.ifindex) {
            component_warn!("if", "Failed to remove {}: {}", iface.name, e);
        }
    }
    while let Ok(effect) = effects.try_recv() {
        if let Effect::Route(route) = &effect {
            log_route(route);
        }
    }
    info!("nhrpd stopped");
    Ok(())
}
