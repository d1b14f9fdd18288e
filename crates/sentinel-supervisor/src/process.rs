//! Spawning and terminating daemon process groups.

use crate::error::{StartCause, StopCause};
use crate::limits::{CgroupLeaf, LimitPlan};
use crate::message::StopOutcome;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sentinel_protocols::{LaunchSpec, RenderedFile};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WAIT_STEP: Duration = Duration::from_millis(20);

/// `ioprio_set(IOPRIO_WHO_PROCESS, 0, ..)` targets the caller
const IOPRIO_WHO_PROCESS: libc::c_int = 1;

/// Write rendered config files with owner-only permissions
pub(crate) fn write_files(files: &[RenderedFile]) -> Result<(), StartCause> {
    for file in files {
        let write = || -> io::Result<()> {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&file.path)?;
            out.set_permissions(fs::Permissions::from_mode(0o600))?;
            out.write_all(file.contents.as_bytes())
        };
        write().map_err(|source| StartCause::WriteConfig {
            path: file.path.clone(),
            source,
        })?;
    }
    Ok(())
}

/// A daemon running in its own process group
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    child: Child,
    pid: u32,
    cgroup: Option<CgroupLeaf>,
}

/// Spawn `spec` as the leader of a new process group with `plan` applied
/// before exec.
pub(crate) fn spawn_daemon(spec: &LaunchSpec, plan: LimitPlan) -> Result<ManagedProcess, StartCause> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);

    let procs_fd = plan.cgroup.as_ref().map(|leaf| leaf.procs().as_raw_fd());
    let address_space = plan.address_space;
    let ioprio = plan.ioprio;
    // SAFETY: the hook only issues raw syscalls on values captured by copy.
    unsafe {
        cmd.pre_exec(move || enter_limits(procs_fd, address_space, ioprio));
    }

    let child = cmd.spawn().map_err(|source| StartCause::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!("Spawned {} as pid {}", spec.program, pid);

    Ok(ManagedProcess {
        child,
        pid,
        cgroup: plan.cgroup,
    })
}

/// Runs in the forked child; async-signal-safe calls only
fn enter_limits(
    procs_fd: Option<libc::c_int>,
    address_space: Option<u64>,
    ioprio: Option<i32>,
) -> io::Result<()> {
    if let Some(fd) = procs_fd {
        let me = b"0";
        // SAFETY: fd is an open descriptor inherited from the parent.
        if unsafe { libc::write(fd, me.as_ptr().cast(), me.len()) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(bytes) = address_space {
        let limit = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: bytes as libc::rlim_t,
        };
        // SAFETY: plain syscall on a stack value.
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(value) = ioprio {
        // SAFETY: plain syscall, no pointers involved.
        if unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, value) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGTERM the group, escalate to SIGKILL after `timeout`
    pub fn terminate(&mut self, timeout: Duration) -> Result<StopOutcome, StopCause> {
        if self.child.try_wait()?.is_some() {
            // Leader is gone; sweep anything left in its group
            signal_group(self.pid, Signal::SIGKILL)?;
            return Ok(StopOutcome::Stopped);
        }

        signal_group(self.pid, Signal::SIGTERM)?;
        if wait_deadline(&mut self.child, timeout)?.is_some() {
            signal_group(self.pid, Signal::SIGKILL)?;
            return Ok(StopOutcome::Stopped);
        }

        warn!(
            "pid {} ignored SIGTERM for {:?}, sending SIGKILL",
            self.pid, timeout
        );
        signal_group(self.pid, Signal::SIGKILL)?;
        self.child.wait()?;
        Ok(StopOutcome::Killed)
    }

    pub fn take_cgroup(&mut self) -> Option<CgroupLeaf> {
        self.cgroup.take()
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(Errno::EINVAL);
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Poll for exit until `timeout` elapses
pub(crate) fn wait_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_STEP);
    }
}

/// Why a short-lived setup/teardown command failed
#[derive(Debug)]
pub(crate) enum CommandFailure {
    Spawn(io::Error),
    Failed { status: String, stderr: String },
    TimedOut,
}

/// Run a setup or teardown command to completion
pub(crate) fn run_command(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<(), CommandFailure> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(CommandFailure::Spawn)?;

    let status = match wait_deadline(&mut child, timeout).map_err(CommandFailure::Spawn)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandFailure::TimedOut);
        }
    };
    if status.success() {
        return Ok(());
    }

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    Err(CommandFailure::Failed {
        status: status.to_string(),
        stderr: stderr.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_protocols::LaunchMode;
    use tempfile::TempDir;

    fn daemon(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            files: Vec::new(),
            mode: LaunchMode::Daemon,
        }
    }

    #[test]
    fn test_write_files_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/wg-home.conf");
        write_files(&[RenderedFile {
            path: path.clone(),
            contents: "[Interface]\n".to_string(),
        }])
        .unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Interface]\n");
    }

    #[test]
    fn test_terminate_graceful() {
        let mut proc = spawn_daemon(&daemon("sleep", &["30"]), LimitPlan::default()).unwrap();
        assert!(proc.try_exit().unwrap().is_none());
        let outcome = proc.terminate(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
    }

    #[test]
    fn test_terminate_escalates() {
        let spec = daemon("sh", &["-c", "trap '' TERM; sleep 30"]);
        let mut proc = spawn_daemon(&spec, LimitPlan::default()).unwrap();
        // Let the shell install its trap
        thread::sleep(Duration::from_millis(200));
        let outcome = proc.terminate(Duration::from_millis(300)).unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
    }

    #[test]
    fn test_spawn_missing_binary() {
        let err = spawn_daemon(
            &daemon("/nonexistent/sentinel-daemon", &[]),
            LimitPlan::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StartCause::Spawn { .. }));
    }

    #[test]
    fn test_run_command_reports_stderr() {
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        match run_command("sh", &args, &[], Duration::from_secs(5)) {
            Err(CommandFailure::Failed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_run_command_timeout() {
        let args = vec!["5".to_string()];
        assert!(matches!(
            run_command("sleep", &args, &[], Duration::from_millis(100)),
            Err(CommandFailure::TimedOut)
        ));
    }
}
