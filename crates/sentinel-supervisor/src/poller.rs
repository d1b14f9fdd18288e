//! Poller thread: periodic liveness and resource sampling.

use crate::message::Command;
use crate::metrics::ProcessSampler;
use crate::supervisor::Registry;
use crossbeam_channel::{Sender, bounded, select, tick};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) struct PollerHandle {
    shutdown: Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl PollerHandle {
    pub fn stop(self) {
        drop(self.shutdown);
        let _ = self.thread.join();
    }
}

/// Spawn the poller. Every `interval` it samples all running instances and
/// hands each worker a `Sample` command; the worker decides what an exit
/// means.
pub(crate) fn spawn_poller(
    interval: Duration,
    registry: Registry,
) -> std::io::Result<PollerHandle> {
    let (shutdown, shutdown_rx) = bounded::<()>(0);

    let thread = thread::Builder::new()
        .name("supervisor-poller".to_string())
        .spawn(move || {
            info!("Poller started ({:?} interval)", interval);
            let ticker = tick(interval);
            let mut sampler = ProcessSampler::new();

            loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(ticker) -> _ => poll_once(&registry, &mut sampler),
                }
            }

            info!("Poller stopped");
        })?;

    Ok(PollerHandle { shutdown, thread })
}

fn poll_once(registry: &Registry, sampler: &mut ProcessSampler) {
    let targets: Vec<(Sender<Command>, Option<u32>)> = {
        let instances = match registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        instances
            .values()
            .filter_map(|handle| {
                let (running, pid) = {
                    let status = handle.status.read().ok()?;
                    (status.state.is_running(), status.pid)
                };
                running.then(|| (handle.tx.clone(), pid))
            })
            .collect()
    };
    if targets.is_empty() {
        return;
    }

    let pids: Vec<u32> = targets.iter().filter_map(|(_, pid)| *pid).collect();
    let samples = sampler.sample(&pids);
    debug!("Polled {} instances", targets.len());

    for (tx, pid) in targets {
        let sample = pid.and_then(|p| samples.get(&p).copied());
        let _ = tx.send(Command::Sample { sample });
    }
}
