//! Fixtures shared by the unit tests.

use nhrp_wire::Afi;
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::CoreConfig;
use crate::effects::{Effect, EffectSink};
use crate::types::{NotifierOwner, NotifyEvent};
use crate::Nhrp;

pub const IFINDEX: u32 = 7;
pub const LOCAL_NBMA: &str = "192.0.2.1";
pub const LOCAL_ADDR: &str = "10.0.0.1";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn setup() -> (Nhrp, UnboundedReceiver<Effect>) {
    setup_with(CoreConfig::default())
}

pub fn setup_with(config: CoreConfig) -> (Nhrp, UnboundedReceiver<Effect>) {
    let (sink, rx) = EffectSink::channel();
    (Nhrp::new(config, sink, Instant::now()), rx)
}

/// Interface `IFINDEX`, up, with NBMA and IPv4 addresses
pub fn enabled_interface(nhrp: &mut Nhrp) {
    nhrp.interface_add(IFINDEX, "gre7").unwrap();
    nhrp.interface_set_up(IFINDEX, true).unwrap();
    nhrp.interface_set_nbma(IFINDEX, Some(ip(LOCAL_NBMA))).unwrap();
    nhrp.interface_set_address(IFINDEX, Afi::Ipv4, Some(ip(LOCAL_ADDR))).unwrap();
}

pub fn drain(rx: &mut UnboundedReceiver<Effect>) -> Vec<Effect> {
    let mut out = Vec::new();
    while let Ok(effect) = rx.try_recv() {
        out.push(effect);
    }
    out
}

/// Sent packets, in order
pub fn sent(effects: &[Effect]) -> Vec<(IpAddr, bytes::Bytes)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Send { nbma, packet, .. } => Some((*nbma, packet.clone())),
            _ => None,
        })
        .collect()
}

/// Announcements of `event` by `owner` since the log was last cleared
pub fn announced(nhrp: &Nhrp, owner: NotifierOwner, event: NotifyEvent) -> usize {
    nhrp.announced
        .iter()
        .filter(|(o, e)| *o == owner && *e == event)
        .count()
}
