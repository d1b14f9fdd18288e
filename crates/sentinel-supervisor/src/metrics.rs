//! Per-daemon RSS and CPU sampling.

use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// One reading for one process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
}

/// Keeps one `System` alive so CPU usage is measured between consecutive
/// refreshes; the first reading of a new pid reports 0%.
pub struct ProcessSampler {
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(RefreshKind::nothing()),
        }
    }

    /// Sample the given pids; pids that no longer exist are omitted
    pub fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ProcessSample> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let targets: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::everything(),
        );

        pids.iter()
            .filter_map(|&pid| {
                let process = self.system.process(Pid::from_u32(pid))?;
                Some((
                    pid,
                    ProcessSample {
                        pid,
                        rss_bytes: process.memory(),
                        cpu_percent: process.cpu_usage(),
                    },
                ))
            })
            .collect()
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
