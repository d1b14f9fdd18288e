//! Instance worker thread with panic isolation.
//!
//! One worker owns one instance: its child process, its cgroup leaf and
//! the published [`RuntimeStatus`]. Commands are handled strictly in
//! order, so two concurrent starts can never spawn two daemons.

use crate::SupervisorConfig;
use crate::error::{ResourceLimitError, StartCause, StartError, StopCause, StopError};
use crate::limits::CgroupLimiter;
use crate::message::{Command, StartOutcome, StopOutcome, SupervisorEvent};
use crate::metrics::ProcessSample;
use crate::process::{self, CommandFailure, ManagedProcess};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use sentinel_protocols::{
    LaunchMode, LaunchSpec, MetricsSnapshot, ResourceLimits, RuntimeState, RuntimeStatus,
};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

/// What is currently up for this instance
enum Running {
    Daemon(ManagedProcess),
    /// Kernel tunnel configured by a setup command
    Oneshot {
        down: Vec<String>,
        probe: PathBuf,
        env: Vec<(String, String)>,
    },
}

pub(crate) struct Worker {
    name: String,
    config: Arc<SupervisorConfig>,
    limiter: Arc<CgroupLimiter>,
    status: Arc<RwLock<RuntimeStatus>>,
    events: Sender<SupervisorEvent>,
    running: Option<Running>,
    last_launch: Option<(LaunchSpec, ResourceLimits)>,
    retries_used: u32,
}

/// Spawn the worker thread for `name`
pub(crate) fn spawn_worker(
    name: String,
    config: Arc<SupervisorConfig>,
    limiter: Arc<CgroupLimiter>,
    status: Arc<RwLock<RuntimeStatus>>,
    events: Sender<SupervisorEvent>,
    rx: Receiver<Command>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("instance-{name}"))
        .spawn(move || {
            let mut worker = Worker {
                name,
                config,
                limiter,
                status,
                events,
                running: None,
                last_launch: None,
                retries_used: 0,
            };
            debug!("Worker {} started", worker.name);
            worker.run(rx);
            debug!("Worker {} stopped", worker.name);
        })
}

impl Worker {
    fn run(&mut self, rx: Receiver<Command>) {
        while let Ok(cmd) = rx.recv() {
            if matches!(cmd, Command::Shutdown) {
                self.shutdown();
                break;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.handle(cmd)));
            if let Err(panic_info) = result {
                let error_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("Worker {} panicked: {}", self.name, error_msg);
                self.with_status(|s| s.last_error = Some(format!("internal error: {error_msg}")));
                self.emit(SupervisorEvent::WorkerPanicked {
                    instance: self.name.clone(),
                    error: error_msg,
                });
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                spec,
                limits,
                reply,
            } => {
                let result = self.start(spec, limits);
                self.reply_start(reply, result);
            }
            Command::Stop { reply } => {
                let result = self.stop();
                let _ = reply.send(result);
            }
            Command::Restart {
                spec,
                limits,
                reply,
            } => {
                let result = match self.stop() {
                    Ok(_) => self.start(spec, limits).map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                if reply.send(result).is_err() {
                    self.abandon();
                }
            }
            Command::Sample { sample } => self.check(sample),
            Command::Shutdown => {}
        }
    }

    fn reply_start(
        &mut self,
        reply: Sender<Result<StartOutcome, StartError>>,
        result: Result<StartOutcome, StartError>,
    ) {
        let started = matches!(result, Ok(StartOutcome::Started { .. }));
        if reply.send(result).is_err() && started {
            self.abandon();
        }
    }

    /// The caller stopped waiting; don't leave a half-acknowledged daemon up
    fn abandon(&mut self) {
        warn!("{}: start was abandoned by its caller, stopping", self.name);
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }

    /// Explicit start; resets the automatic retry budget
    fn start(
        &mut self,
        spec: LaunchSpec,
        limits: ResourceLimits,
    ) -> Result<StartOutcome, StartError> {
        if self.running.is_some() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.retries_used = 0;
        self.with_status(|s| s.restarts = 0);
        let pid = self.launch(&spec, &limits)?;
        self.last_launch = Some((spec, limits));
        Ok(StartOutcome::Started { pid })
    }

    fn launch(
        &mut self,
        spec: &LaunchSpec,
        limits: &ResourceLimits,
    ) -> Result<Option<u32>, StartError> {
        self.transition(RuntimeState::Starting);
        self.with_status(|s| s.last_error = None);

        match self.bring_up(spec, limits) {
            Ok((running, pid)) => {
                self.running = Some(running);
                self.with_status(|s| s.pid = pid);
                self.transition(RuntimeState::Running);
                info!("{} running ({})", self.name, spec.command_line());
                Ok(pid)
            }
            Err(cause) => {
                let err = StartError {
                    instance: self.name.clone(),
                    cause,
                };
                error!("{}", err);
                let message = err.to_string();
                self.with_status(|s| {
                    s.pid = None;
                    s.last_error = Some(message);
                });
                self.transition(RuntimeState::Error);
                Err(err)
            }
        }
    }

    fn bring_up(
        &self,
        spec: &LaunchSpec,
        limits: &ResourceLimits,
    ) -> Result<(Running, Option<u32>), StartCause> {
        process::write_files(&spec.files)?;

        match &spec.mode {
            LaunchMode::Daemon => {
                let plan = self.limiter.prepare(&self.name, limits)?;
                let mut proc = process::spawn_daemon(spec, plan)?;
                thread::sleep(self.config.liveness_grace);
                let exited = match proc.try_exit() {
                    Ok(status) => status.map(|s| s.to_string()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(status) = exited {
                    let _ = proc.terminate(self.config.stop_timeout);
                    if let Some(leaf) = proc.take_cgroup() {
                        self.limiter.release(leaf);
                    }
                    return Err(StartCause::ExitedEarly { status });
                }
                let pid = proc.pid();
                Ok((Running::Daemon(proc), Some(pid)))
            }
            LaunchMode::Oneshot { down, probe } => {
                if !limits.is_unconstrained() {
                    return Err(ResourceLimitError::Unsupported(
                        "kernel tunnels cannot be resource limited".to_string(),
                    )
                    .into());
                }
                process::run_command(
                    &spec.program,
                    &spec.args,
                    &spec.env,
                    self.config.operation_timeout,
                )
                .map_err(|failure| match failure {
                    CommandFailure::Spawn(source) => StartCause::Spawn {
                        program: spec.program.clone(),
                        source,
                    },
                    CommandFailure::Failed { status, stderr } => {
                        StartCause::SetupFailed { status, stderr }
                    }
                    CommandFailure::TimedOut => StartCause::SetupTimeout,
                })?;
                Ok((
                    Running::Oneshot {
                        down: down.clone(),
                        probe: probe.clone(),
                        env: spec.env.clone(),
                    },
                    None,
                ))
            }
        }
    }

    /// Stop whatever is running; a stopped instance is a no-op
    fn stop(&mut self) -> Result<StopOutcome, StopError> {
        let Some(running) = self.running.take() else {
            if self.current_state() == RuntimeState::Error {
                self.transition(RuntimeState::Stopped);
            }
            return Ok(StopOutcome::AlreadyStopped);
        };

        self.transition(RuntimeState::Stopping);
        let result = self.tear_down(running);
        self.with_status(|s| {
            s.pid = None;
            s.metrics = None;
        });

        match result {
            Ok(outcome) => {
                self.transition(RuntimeState::Stopped);
                info!("{} stopped ({:?})", self.name, outcome);
                Ok(outcome)
            }
            Err(cause) => {
                let err = StopError {
                    instance: self.name.clone(),
                    cause,
                };
                error!("{}", err);
                let message = err.to_string();
                self.with_status(|s| s.last_error = Some(message));
                self.transition(RuntimeState::Error);
                Err(err)
            }
        }
    }

    fn tear_down(&self, running: Running) -> Result<StopOutcome, StopCause> {
        match running {
            Running::Daemon(mut proc) => {
                let result = proc.terminate(self.config.stop_timeout);
                if let Some(leaf) = proc.take_cgroup() {
                    self.limiter.release(leaf);
                }
                result
            }
            Running::Oneshot { down, env, .. } => {
                let Some((program, args)) = down.split_first() else {
                    return Ok(StopOutcome::Stopped);
                };
                process::run_command(program, args, &env, self.config.operation_timeout)
                    .map(|()| StopOutcome::Stopped)
                    .map_err(|failure| match failure {
                        CommandFailure::Spawn(e) => StopCause::Wait(e),
                        CommandFailure::Failed { status, stderr } => {
                            StopCause::Teardown { status, stderr }
                        }
                        CommandFailure::TimedOut => StopCause::TeardownTimeout,
                    })
            }
        }
    }

    /// Poller tick: liveness plus metrics
    fn check(&mut self, sample: Option<ProcessSample>) {
        let exit_reason = match &mut self.running {
            None => return,
            Some(Running::Daemon(proc)) => match proc.try_exit() {
                Ok(None) => {
                    let pid = proc.pid();
                    if let Some(sample) = sample.filter(|s| s.pid == pid) {
                        self.with_status(|s| {
                            s.metrics = Some(MetricsSnapshot {
                                pid: sample.pid,
                                rss_bytes: sample.rss_bytes,
                                cpu_percent: sample.cpu_percent,
                                updated_at: Utc::now(),
                            })
                        });
                    }
                    return;
                }
                Ok(Some(status)) => format!("process exited ({status})"),
                Err(e) => {
                    warn!("{}: liveness check failed: {}", self.name, e);
                    return;
                }
            },
            Some(Running::Oneshot { probe, .. }) => {
                if probe.exists() {
                    return;
                }
                format!("{} disappeared", probe.display())
            }
        };
        self.on_unexpected_exit(exit_reason);
    }

    fn on_unexpected_exit(&mut self, reason: String) {
        warn!("{}: {}", self.name, reason);
        if let Some(Running::Daemon(mut proc)) = self.running.take() {
            if let Some(leaf) = proc.take_cgroup() {
                self.limiter.release(leaf);
            }
        }
        let last_error = reason.clone();
        self.with_status(|s| {
            s.pid = None;
            s.last_error = Some(last_error);
        });
        self.transition(RuntimeState::Error);
        self.emit(SupervisorEvent::UnexpectedExit {
            instance: self.name.clone(),
            reason: reason.clone(),
        });

        let Some((spec, limits)) = self.last_launch.clone() else {
            return;
        };
        if self.retries_used >= self.config.max_auto_retries {
            self.park(reason);
            return;
        }

        self.retries_used += 1;
        let attempt = self.retries_used;
        self.with_status(|s| s.restarts = attempt);
        self.emit(SupervisorEvent::Retrying {
            instance: self.name.clone(),
            attempt,
        });
        info!("{}: automatic restart, attempt {}", self.name, attempt);
        if let Err(e) = self.launch(&spec, &limits) {
            self.park(e.to_string());
        }
    }

    fn park(&self, reason: String) {
        error!("{} parked in error: {}", self.name, reason);
        self.emit(SupervisorEvent::Parked {
            instance: self.name.clone(),
            reason,
        });
    }

    fn shutdown(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                error!("{}", e);
            }
        }
    }

    fn current_state(&self) -> RuntimeState {
        self.status
            .read()
            .map(|s| s.state)
            .unwrap_or(RuntimeState::Error)
    }

    fn with_status(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        match self.status.write() {
            Ok(mut status) => f(&mut status),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn transition(&self, next: RuntimeState) {
        let from = self.current_state();
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!("{}: unexpected transition {} -> {}", self.name, from, next);
        }
        self.force_state(next);
    }

    fn force_state(&self, next: RuntimeState) {
        let from = self.current_state();
        self.with_status(|s| s.state = next);
        debug!("{}: {} -> {}", self.name, from, next);
        self.emit(SupervisorEvent::StateChanged {
            instance: self.name.clone(),
            from,
            to: next,
        });
    }

    /// Events are best effort; a full queue drops them
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.try_send(event);
    }
}
