//! Interface-level egress address comparison.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Source addresses the kernel would pick for outbound traffic
#[async_trait]
pub trait EgressProbe: Send + Sync {
    async fn local_egress(&self) -> (Option<IpAddr>, Option<IpAddr>);
}

/// Asks the routing table via an unsent UDP connect
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteEgressProbe;

const V4_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
const V6_TARGET: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
    53,
);

async fn source_for(bind: SocketAddr, target: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[async_trait]
impl EgressProbe for RouteEgressProbe {
    async fn local_egress(&self) -> (Option<IpAddr>, Option<IpAddr>) {
        let v4 = source_for((Ipv4Addr::UNSPECIFIED, 0).into(), V4_TARGET).await;
        let v6 = source_for((Ipv6Addr::UNSPECIFIED, 0).into(), V6_TARGET).await;
        (v4, v6)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressReport {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub ipv4_in_tunnel: bool,
    pub ipv6_in_tunnel: bool,
    /// IPv6 leaves outside every tunnel
    pub ipv6_exposed: bool,
}

impl EgressReport {
    pub fn compare(ipv4: Option<IpAddr>, ipv6: Option<IpAddr>, tunnels: &[String]) -> Self {
        let inside = |ip: Option<IpAddr>| ip.is_some_and(|ip| tunnels.iter().any(|c| cidr_contains(c, ip)));
        let ipv6_in_tunnel = inside(ipv6);
        Self {
            ipv4,
            ipv6,
            ipv4_in_tunnel: inside(ipv4),
            ipv6_in_tunnel,
            ipv6_exposed: ipv6.is_some() && !ipv6_in_tunnel,
        }
    }
}

/// `10.0.0.2/24` style containment; a bare address is a host route
pub(crate) fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let (addr, prefix) = match cidr.trim().split_once('/') {
        Some((a, p)) => (a, p.parse::<u32>().ok()),
        None => (cidr.trim(), None),
    };
    let Ok(net) = addr.parse::<IpAddr>() else {
        return false;
    };
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let bits = prefix.unwrap_or(32).min(32);
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let bits = prefix.unwrap_or(128).min(128);
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}
