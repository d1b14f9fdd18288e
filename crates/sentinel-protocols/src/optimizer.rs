//! Resource Optimizer
//!
//! Derives per-protocol network tuning from host topology. [`optimize`] is
//! a pure function; [`HostTopology::probe`] is the only part that touches
//! the system and is called on start and on interface topology changes,
//! never from a polling loop.

use crate::model::{OptimizationFlags, ProtocolKind};
use std::path::Path;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::debug;

/// Congestion control forced for eligible proxy cores
pub const PREFERRED_CONGESTION_CONTROL: &str = "bbr";

/// Host facts the optimizer depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTopology {
    pub cpu_count: usize,
    pub interface_max_queues: usize,
}

impl HostTopology {
    /// Read CPU count and the uplink's RX queue count from the running host
    pub fn probe(interface: &str) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()),
        );
        let cpu_count = system.cpus().len().max(1);
        let interface_max_queues = count_rx_queues(Path::new("/sys/class/net"), interface).unwrap_or(1);

        debug!(
            "Host topology: {} CPUs, {} has {} RX queues",
            cpu_count, interface, interface_max_queues
        );
        Self {
            cpu_count,
            interface_max_queues,
        }
    }
}

/// Count `rx-*` entries under `<sysfs>/<iface>/queues`
pub fn count_rx_queues(sysfs_net: &Path, interface: &str) -> Option<usize> {
    let entries = std::fs::read_dir(sysfs_net.join(interface).join("queues")).ok()?;
    let count = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("rx-"))
        .count();
    (count > 0).then_some(count)
}

/// Which tuning knobs apply to a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Eligibility {
    pub multiqueue: bool,
    pub fast_open: bool,
    pub congestion_control: bool,
}

impl Eligibility {
    pub fn for_kind(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Wireguard | ProtocolKind::Amneziawg => Self {
                multiqueue: true,
                ..Self::default()
            },
            ProtocolKind::Xray | ProtocolKind::SingBox => Self {
                fast_open: true,
                congestion_control: true,
                ..Self::default()
            },
            ProtocolKind::Shadowsocks | ProtocolKind::Trojan => Self {
                fast_open: true,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

/// Compute tuning flags for one protocol
pub fn optimize(topology: HostTopology, eligibility: Eligibility) -> OptimizationFlags {
    let queue_count = if eligibility.multiqueue {
        topology.cpu_count.min(topology.interface_max_queues).max(1)
    } else {
        1
    };
    OptimizationFlags {
        queue_count: u32::try_from(queue_count).unwrap_or(u32::MAX),
        fast_open: eligibility.fast_open,
        congestion_control: eligibility
            .congestion_control
            .then(|| PREFERRED_CONGESTION_CONTROL.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_count_is_capped_by_cpus() {
        let topology = HostTopology {
            cpu_count: 4,
            interface_max_queues: 8,
        };
        let flags = optimize(topology, Eligibility::for_kind(ProtocolKind::Wireguard));
        assert_eq!(flags.queue_count, 4);
        assert!(!flags.fast_open);
    }

    #[test]
    fn test_queue_count_is_capped_by_interface() {
        let topology = HostTopology {
            cpu_count: 16,
            interface_max_queues: 2,
        };
        let flags = optimize(topology, Eligibility::for_kind(ProtocolKind::Amneziawg));
        assert_eq!(flags.queue_count, 2);
    }

    #[test]
    fn test_proxy_flags() {
        let topology = HostTopology {
            cpu_count: 4,
            interface_max_queues: 8,
        };
        let flags = optimize(topology, Eligibility::for_kind(ProtocolKind::Xray));
        assert_eq!(flags.queue_count, 1);
        assert!(flags.fast_open);
        assert_eq!(flags.congestion_control.as_deref(), Some("bbr"));

        let tor = optimize(topology, Eligibility::for_kind(ProtocolKind::Tor));
        assert_eq!(tor, OptimizationFlags::default());
    }

    #[test]
    fn test_count_rx_queues() {
        let dir = tempfile::tempdir().unwrap();
        let queues = dir.path().join("eth0").join("queues");
        for q in ["rx-0", "rx-1", "rx-2", "tx-0", "tx-1"] {
            std::fs::create_dir_all(queues.join(q)).unwrap();
        }
        assert_eq!(count_rx_queues(dir.path(), "eth0"), Some(3));
        assert_eq!(count_rx_queues(dir.path(), "eth1"), None);
    }

    #[test]
    fn test_probe_is_sane() {
        let topology = HostTopology::probe("definitely-not-an-interface");
        assert!(topology.cpu_count >= 1);
        assert_eq!(topology.interface_max_queues, 1);
    }
}
