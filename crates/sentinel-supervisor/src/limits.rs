//! Resource Limits
//!
//! Each daemon gets its own cgroup v2 leaf under the supervisor root:
//!
//! ```text
//! /sys/fs/cgroup/               cgroup.controllers, cgroup.subtree_control
//!   └── sentinel/               cgroup.subtree_control (+memory +cpu)
//!         ├── xray-main/        memory.max, cpu.max, cgroup.procs
//!         └── tor/              ...
//! ```
//!
//! The child joins its leaf between fork and exec, so it never runs
//! outside of its limits. Without cgroup v2 a memory ceiling falls back
//! to `RLIMIT_AS`; a CPU quota has no fallback and aborts the start.

use crate::error::ResourceLimitError;
use sentinel_protocols::{IoClass, ResourceLimits};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default cgroup subtree owned by the supervisor
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/sentinel";

/// cpu.max period in microseconds
const CPU_PERIOD_US: u64 = 100_000;

const IOPRIO_CLASS_SHIFT: i32 = 13;
const IOPRIO_CLASS_BE: i32 = 2;
const IOPRIO_CLASS_IDLE: i32 = 3;

/// A prepared cgroup leaf; `procs` is opened before fork
#[derive(Debug)]
pub struct CgroupLeaf {
    path: PathBuf,
    procs: File,
}

impl CgroupLeaf {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn procs(&self) -> &File {
        &self.procs
    }
}

/// What the spawner must apply to the child
#[derive(Debug, Default)]
pub struct LimitPlan {
    pub cgroup: Option<CgroupLeaf>,
    /// `RLIMIT_AS` fallback in bytes
    pub address_space: Option<u64>,
    /// Raw `ioprio_set` value
    pub ioprio: Option<i32>,
}

/// Creates and removes per-instance cgroup leaves
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    root: PathBuf,
}

impl CgroupLimiter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Controllers the parent hierarchy offers, or `None` without cgroup v2
    fn available_controllers(&self) -> Option<Vec<String>> {
        let parent = self.root.parent()?;
        let raw = fs::read_to_string(parent.join("cgroup.controllers")).ok()?;
        Some(raw.split_whitespace().map(str::to_string).collect())
    }

    /// Prepare everything needed to start `instance` under `limits`
    pub fn prepare(
        &self,
        instance: &str,
        limits: &ResourceLimits,
    ) -> Result<LimitPlan, ResourceLimitError> {
        let mut plan = LimitPlan {
            ioprio: ioprio_value(limits),
            ..LimitPlan::default()
        };

        let mut wanted = Vec::new();
        if limits.memory_max_bytes.is_some() {
            wanted.push("memory");
        }
        if limits.cpu_quota_percent.is_some() {
            wanted.push("cpu");
        }
        if wanted.is_empty() {
            return Ok(plan);
        }

        let Some(available) = self.available_controllers() else {
            if limits.cpu_quota_percent.is_some() {
                return Err(ResourceLimitError::Unsupported(
                    "CPU quota requires cgroup v2".to_string(),
                ));
            }
            warn!(
                "cgroup v2 unavailable, limiting {} with RLIMIT_AS",
                instance
            );
            plan.address_space = limits.memory_max_bytes;
            return Ok(plan);
        };

        if let Some(missing) = wanted
            .iter()
            .find(|c| !available.iter().any(|a| a == *c))
        {
            return Err(ResourceLimitError::ControllerUnavailable(
                missing.to_string(),
            ));
        }

        let enable = wanted
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(parent) = self.root.parent() {
            write_knob(&parent.join("cgroup.subtree_control"), &enable)?;
        }
        fs::create_dir_all(&self.root).map_err(|source| ResourceLimitError::Cgroup {
            path: self.root.clone(),
            source,
        })?;
        write_knob(&self.root.join("cgroup.subtree_control"), &enable)?;

        let leaf = self.root.join(instance);
        fs::create_dir_all(&leaf).map_err(|source| ResourceLimitError::Cgroup {
            path: leaf.clone(),
            source,
        })?;
        if let Some(bytes) = limits.memory_max_bytes {
            write_knob(&leaf.join("memory.max"), &bytes.to_string())?;
        }
        if let Some(percent) = limits.cpu_quota_percent {
            let quota = u64::from(percent) * CPU_PERIOD_US / 100;
            write_knob(&leaf.join("cpu.max"), &format!("{quota} {CPU_PERIOD_US}"))?;
        }

        let procs_path = leaf.join("cgroup.procs");
        let procs = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&procs_path)
            .map_err(|source| ResourceLimitError::Cgroup {
                path: procs_path,
                source,
            })?;

        debug!("Prepared cgroup {}", leaf.display());
        plan.cgroup = Some(CgroupLeaf { path: leaf, procs });
        Ok(plan)
    }

    /// Remove a leaf once its process is gone
    pub fn release(&self, leaf: CgroupLeaf) {
        let CgroupLeaf { path, procs } = leaf;
        drop(procs);
        if let Err(e) = fs::remove_dir(&path) {
            debug!("Could not remove cgroup {}: {}", path.display(), e);
        }
    }
}

fn write_knob(path: &Path, value: &str) -> Result<(), ResourceLimitError> {
    let write = || -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(value.as_bytes())
    };
    write().map_err(|source| ResourceLimitError::Cgroup {
        path: path.to_path_buf(),
        source,
    })
}

fn ioprio_value(limits: &ResourceLimits) -> Option<i32> {
    let level = i32::from(limits.io_level.min(7));
    match limits.io_class {
        IoClass::Inherit => None,
        IoClass::BestEffort => Some((IOPRIO_CLASS_BE << IOPRIO_CLASS_SHIFT) | level),
        IoClass::Idle => Some(IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_hierarchy(controllers: Option<&str>) -> (TempDir, CgroupLimiter) {
        let dir = TempDir::new().unwrap();
        if let Some(list) = controllers {
            fs::write(dir.path().join("cgroup.controllers"), list).unwrap();
        }
        let limiter = CgroupLimiter::new(dir.path().join("sentinel"));
        (dir, limiter)
    }

    #[test]
    fn test_unconstrained_needs_nothing() {
        let (_dir, limiter) = fake_hierarchy(None);
        let plan = limiter.prepare("wg0", &ResourceLimits::default()).unwrap();
        assert!(plan.cgroup.is_none());
        assert!(plan.address_space.is_none());
        assert!(plan.ioprio.is_none());
    }

    #[test]
    fn test_writes_leaf_knobs() {
        let (dir, limiter) = fake_hierarchy(Some("cpuset cpu io memory pids"));
        let limits = ResourceLimits {
            memory_max_bytes: Some(512 * 1024 * 1024),
            cpu_quota_percent: Some(50),
            ..ResourceLimits::default()
        };
        let plan = limiter.prepare("xray-main", &limits).unwrap();

        let leaf = dir.path().join("sentinel/xray-main");
        assert_eq!(
            fs::read_to_string(leaf.join("memory.max")).unwrap(),
            "536870912"
        );
        assert_eq!(
            fs::read_to_string(leaf.join("cpu.max")).unwrap(),
            "50000 100000"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("sentinel/cgroup.subtree_control")).unwrap(),
            "+memory +cpu"
        );
        assert_eq!(plan.cgroup.as_ref().unwrap().path(), leaf.as_path());
    }

    #[test]
    fn test_missing_controller_aborts() {
        let (_dir, limiter) = fake_hierarchy(Some("cpu io"));
        let limits = ResourceLimits {
            memory_max_bytes: Some(1 << 20),
            ..ResourceLimits::default()
        };
        let err = limiter.prepare("ss", &limits).unwrap_err();
        assert!(matches!(err, ResourceLimitError::ControllerUnavailable(c) if c == "memory"));
    }

    #[test]
    fn test_memory_falls_back_to_rlimit() {
        let (_dir, limiter) = fake_hierarchy(None);
        let limits = ResourceLimits {
            memory_max_bytes: Some(1 << 28),
            ..ResourceLimits::default()
        };
        let plan = limiter.prepare("ss", &limits).unwrap();
        assert!(plan.cgroup.is_none());
        assert_eq!(plan.address_space, Some(1 << 28));
    }

    #[test]
    fn test_cpu_without_cgroups_is_refused() {
        let (_dir, limiter) = fake_hierarchy(None);
        let limits = ResourceLimits {
            cpu_quota_percent: Some(25),
            ..ResourceLimits::default()
        };
        assert!(matches!(
            limiter.prepare("tor", &limits),
            Err(ResourceLimitError::Unsupported(_))
        ));
    }

    #[test]
    fn test_ioprio_encoding() {
        let mut limits = ResourceLimits {
            io_class: IoClass::BestEffort,
            io_level: 6,
            ..ResourceLimits::default()
        };
        assert_eq!(ioprio_value(&limits), Some((2 << 13) | 6));
        limits.io_class = IoClass::Idle;
        assert_eq!(ioprio_value(&limits), Some(3 << 13));
    }
}
