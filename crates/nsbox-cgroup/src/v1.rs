//! Legacy cgroup v1 driver over the split per-controller hierarchies

use log::{debug, info, warn};
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, Pid};
use nsbox_core::{Result, SandboxError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::driver::{CgroupDriver, CgroupLimits, CgroupStats};
use crate::parse::decimal_or_warn;

const CHILD_PREFIX: &str = "NSJAIL.";

/// cpu.cfs_period_us written alongside the quota, in microseconds.
const CFS_PERIOD_USEC: u64 = 1_000_000;

pub struct CgroupV1Driver {
    mount: PathBuf,
    limits: CgroupLimits,
}

fn write_cgroup_file(path: &Path, value: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(value.as_bytes())
}

impl CgroupV1Driver {
    pub fn new(mount: impl Into<PathBuf>, limits: CgroupLimits) -> Self {
        Self {
            mount: mount.into(),
            limits,
        }
    }

    fn controller_path(&self, controller: &str, pid: Pid) -> PathBuf {
        self.mount
            .join(controller)
            .join(format!("{}{}", CHILD_PREFIX, pid))
    }

    /// Create the per-child directory under one controller hierarchy and
    /// move the child into it.
    fn enter_controller(&self, controller: &str, pid: Pid) -> Result<PathBuf> {
        let dir = self.controller_path(controller, pid);
        debug!("creating '{}' for pid={}", dir.display(), pid);
        match mkdir(&dir, Mode::S_IRWXU) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(err) => {
                return Err(SandboxError::Cgroup(format!(
                    "mkdir('{}', 0700) failed: {}",
                    dir.display(),
                    err
                )))
            }
        }
        write_cgroup_file(&dir.join("cgroup.procs"), &pid.to_string()).map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not update '{}/cgroup.procs': {}",
                dir.display(),
                err
            ))
        })?;
        Ok(dir)
    }

    fn set_limit(&self, dir: &Path, resource: &str, value: &str) -> Result<()> {
        info!("setting '{}' to '{}'", resource, value);
        write_cgroup_file(&dir.join(resource), value).map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not write '{}' in '{}': {}",
                resource,
                dir.display(),
                err
            ))
        })
    }

    fn read_accounting(&self, path: &Path, what: &str) -> i64 {
        match fs::read_to_string(path) {
            Ok(content) => decimal_or_warn(&content, what, path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("'{}' not found, cgroup may already be gone", path.display());
                -1
            }
            Err(err) => {
                warn!("failed to read '{}': {}", path.display(), err);
                -1
            }
        }
    }

    fn remove_dir(&self, dir: &Path) {
        debug!("removing '{}'", dir.display());
        if let Err(err) = fs::remove_dir(dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("rmdir('{}') failed: {}", dir.display(), err);
            }
        }
    }
}

impl CgroupDriver for CgroupV1Driver {
    fn name(&self) -> &'static str {
        "cgroupv1"
    }

    fn setup(&mut self) -> Result<()> {
        let wanted: [(&str, bool); 3] = [
            ("memory", self.limits.needs_memory()),
            ("pids", self.limits.needs_pids()),
            ("cpu", self.limits.needs_cpu()),
        ];
        for (controller, needed) in wanted {
            let hierarchy = self.mount.join(controller);
            if needed && !hierarchy.is_dir() {
                return Err(SandboxError::Cgroup(format!(
                    "cgroup v1 hierarchy '{}' is not mounted; mount it or switch to \
                     a cgroup v2 mount",
                    hierarchy.display()
                )));
            }
        }
        Ok(())
    }

    fn init_child(&self, pid: Pid) -> Result<()> {
        if self.limits.needs_memory() {
            let dir = self.enter_controller("memory", pid)?;
            if self.limits.mem_max > 0 {
                self.set_limit(
                    &dir,
                    "memory.limit_in_bytes",
                    &self.limits.mem_max.to_string(),
                )?;
            }
            if self.limits.mem_memsw_max > 0 {
                self.set_limit(
                    &dir,
                    "memory.memsw.limit_in_bytes",
                    &self.limits.mem_memsw_max.to_string(),
                )?;
            }
        }
        if self.limits.needs_pids() {
            let dir = self.enter_controller("pids", pid)?;
            self.set_limit(&dir, "pids.max", &self.limits.pids_max.to_string())?;
        }
        if self.limits.needs_cpu() {
            let dir = self.enter_controller("cpu", pid)?;
            let quota = u64::from(self.limits.cpu_ms_per_sec) * 1000;
            self.set_limit(&dir, "cpu.cfs_period_us", &CFS_PERIOD_USEC.to_string())?;
            self.set_limit(&dir, "cpu.cfs_quota_us", &quota.to_string())?;
        }
        Ok(())
    }

    fn finish_child(&self, pid: Pid) -> Option<CgroupStats> {
        if !self.limits.any() {
            return None;
        }

        let mut memory_peak_bytes = -1;
        if self.limits.needs_memory() {
            let dir = self.controller_path("memory", pid);
            memory_peak_bytes = self.read_accounting(
                &dir.join("memory.max_usage_in_bytes"),
                "memory.max_usage_in_bytes",
            );
            self.remove_dir(&dir);
        }

        let mut cpu_total_usec = -1;
        if self.limits.needs_cpu() {
            let dir = self.controller_path("cpu", pid);
            let usage_ns = self.read_accounting(&dir.join("cpuacct.usage"), "cpuacct.usage");
            if usage_ns >= 0 {
                cpu_total_usec = usage_ns / 1000;
            }
            self.remove_dir(&dir);
        }

        if self.limits.needs_pids() {
            self.remove_dir(&self.controller_path("pids", pid));
        }

        info!(
            "cgroup stats: cpu_usec={} mem_peak_bytes={}",
            cpu_total_usec, memory_peak_bytes
        );

        // The split hierarchies cannot attribute user vs system time.
        Some(CgroupStats {
            memory_peak_bytes,
            cpu_user_usec: -1,
            cpu_system_usec: -1,
            cpu_total_usec,
        })
    }
}
