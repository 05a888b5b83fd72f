//! Cgroup v2 driver: controller delegation on the unified hierarchy

use log::{debug, info, warn};
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, Pid};
use nsbox_core::{Result, SandboxError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::driver::{CgroupDriver, CgroupLimits, CgroupStats};
use crate::parse::decimal_or_warn;

/// Per-child directory prefix under the v2 mount.
const CHILD_PREFIX: &str = "NSJAIL.";
/// Singleton directory the supervisor migrates itself into when the root
/// cgroup rejects subtree delegation over internal processes.
const SELF_PREFIX: &str = "NSJAIL_SELF.";

/// CPU bandwidth period written into `cpu.max`, in microseconds.
const CPU_PERIOD_USEC: u64 = 1_000_000;

pub struct CgroupV2Driver {
    mount: PathBuf,
    limits: CgroupLimits,
}

/// Single-shot write into an existing cgroup control file. The kernel
/// materializes these files, so creation is never wanted and a missing
/// file is an error.
fn write_cgroup_file(path: &Path, value: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(value.as_bytes())
}

fn create_cgroup(path: &Path) -> Result<()> {
    debug!("creating cgroup '{}'", path.display());
    match mkdir(path, Mode::S_IRWXU) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(err) => Err(SandboxError::Cgroup(format!(
            "mkdir('{}', 0700) failed: {}",
            path.display(),
            err
        ))),
    }
}

impl CgroupV2Driver {
    pub fn new(mount: impl Into<PathBuf>, limits: CgroupLimits) -> Self {
        Self {
            mount: mount.into(),
            limits,
        }
    }

    fn child_path(&self, pid: Pid) -> PathBuf {
        self.mount.join(format!("{}{}", CHILD_PREFIX, pid))
    }

    fn self_path(&self) -> PathBuf {
        self.mount
            .join(format!("{}{}", SELF_PREFIX, std::process::id()))
    }

    fn add_pid_to_procs(&self, cgroup: &Path, pid_value: &str) -> Result<()> {
        debug!("adding pid='{}' to {}/cgroup.procs", pid_value, cgroup.display());
        write_cgroup_file(&cgroup.join("cgroup.procs"), pid_value).map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not update '{}/cgroup.procs': {}",
                cgroup.display(),
                err
            ))
        })
    }

    /// Escape the "no internal processes" rule by moving the supervisor
    /// itself into a child cgroup of the mount root.
    fn migrate_self(&self) -> Result<()> {
        let path = self.self_path();
        info!(
            "moving the supervisor into its own child cgroup: {}",
            path.display()
        );
        create_cgroup(&path)?;
        self.add_pid_to_procs(&path, "0")
    }

    fn enable_subtree(&self, controller: &str) -> Result<()> {
        let ctl = self.mount.join("cgroup.subtree_control");
        let value = format!("+{}", controller);
        debug!("enabling '{}' in '{}'", value, ctl.display());

        let first = write_cgroup_file(&ctl, &value);
        let retry = match first {
            Ok(()) => return Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                self.migrate_self()?;
                write_cgroup_file(&ctl, &value)
            }
            Err(err) => Err(err),
        };

        retry.map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not apply '{}' to '{}': {}. The supervisor must run as root and \
                 the mount must refer to the host root cgroup hierarchy; under Docker, \
                 start the container with --cgroupns=host (or remount cgroup2)",
                value,
                ctl.display(),
                err
            ))
        })
    }

    fn set_limit(&self, cgroup: &Path, resource: &str, value: &str) -> Result<()> {
        info!("setting '{}' to '{}'", resource, value);
        write_cgroup_file(&cgroup.join(resource), value).map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not write '{}' in '{}': {}",
                resource,
                cgroup.display(),
                err
            ))
        })
    }

    fn read_memory_peak(&self, cgroup: &Path) -> i64 {
        let path = cgroup.join("memory.peak");
        match fs::read_to_string(&path) {
            Ok(content) => decimal_or_warn(&content, "memory.peak", &path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "'{}' not found, cgroup may already be gone",
                    path.display()
                );
                -1
            }
            Err(err) => {
                warn!("failed to read '{}': {}", path.display(), err);
                -1
            }
        }
    }

    /// Returns (user_usec, system_usec), each -1 when missing or malformed.
    fn read_cpu_stat(&self, cgroup: &Path) -> (i64, i64) {
        let path = cgroup.join("cpu.stat");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "'{}' not found, cgroup may already be gone",
                    path.display()
                );
                return (-1, -1);
            }
            Err(err) => {
                warn!("failed to read '{}': {}", path.display(), err);
                return (-1, -1);
            }
        };

        let mut user_usec = -1;
        let mut system_usec = -1;
        for line in content.lines() {
            if user_usec == -1 {
                if let Some(rest) = line.strip_prefix("user_usec ") {
                    user_usec = decimal_or_warn(rest, "user_usec", &path);
                    continue;
                }
            }
            if system_usec == -1 {
                if let Some(rest) = line.strip_prefix("system_usec ") {
                    system_usec = decimal_or_warn(rest, "system_usec", &path);
                }
            }
            if user_usec != -1 && system_usec != -1 {
                break;
            }
        }
        (user_usec, system_usec)
    }
}

impl CgroupDriver for CgroupV2Driver {
    fn name(&self) -> &'static str {
        "cgroupv2"
    }

    fn setup(&mut self) -> Result<()> {
        let ctl = self.mount.join("cgroup.subtree_control");
        let enabled = fs::read_to_string(&ctl).map_err(|err| {
            SandboxError::Cgroup(format!(
                "could not read root '{}': {}",
                ctl.display(),
                err
            ))
        })?;

        let wanted: [(&str, bool); 3] = [
            ("memory", self.limits.needs_memory()),
            ("pids", self.limits.needs_pids()),
            ("cpu", self.limits.needs_cpu()),
        ];
        for (controller, needed) in wanted {
            if needed && !enabled.contains(controller) {
                self.enable_subtree(controller)?;
            }
        }
        Ok(())
    }

    fn init_child(&self, pid: Pid) -> Result<()> {
        if !self.limits.any() {
            return Ok(());
        }

        let cgroup = self.child_path(pid);
        create_cgroup(&cgroup)?;
        self.add_pid_to_procs(&cgroup, &pid.to_string())?;

        if self.limits.needs_memory() {
            if self.limits.mem_max > 0 {
                self.set_limit(&cgroup, "memory.max", &self.limits.mem_max.to_string())?;
            }
            let swap_max = self.limits.derived_swap_max();
            if swap_max >= 0 {
                self.set_limit(&cgroup, "memory.swap.max", &swap_max.to_string())?;
            }
        }
        if self.limits.needs_pids() {
            self.set_limit(&cgroup, "pids.max", &self.limits.pids_max.to_string())?;
        }
        if self.limits.needs_cpu() {
            let quota = u64::from(self.limits.cpu_ms_per_sec) * 1000;
            self.set_limit(&cgroup, "cpu.max", &format!("{} {}", quota, CPU_PERIOD_USEC))?;
        }
        Ok(())
    }

    fn finish_child(&self, pid: Pid) -> Option<CgroupStats> {
        if !self.limits.any() {
            return None;
        }

        let cgroup = self.child_path(pid);
        let memory_peak_bytes = self.read_memory_peak(&cgroup);
        let (cpu_user_usec, cpu_system_usec) = self.read_cpu_stat(&cgroup);
        let cpu_total_usec = if cpu_user_usec >= 0 && cpu_system_usec >= 0 {
            cpu_user_usec + cpu_system_usec
        } else {
            warn!(
                "could not determine total CPU usage for '{}' (user_usec={}, system_usec={})",
                cgroup.display(),
                cpu_user_usec,
                cpu_system_usec
            );
            -1
        };

        info!(
            "cgroup stats: cpu_usec={} mem_peak_bytes={} (user={}, system={})",
            cpu_total_usec, memory_peak_bytes, cpu_user_usec, cpu_system_usec
        );

        debug!("removing '{}'", cgroup.display());
        if let Err(err) = fs::remove_dir(&cgroup) {
            warn!("rmdir('{}') failed: {}", cgroup.display(), err);
        }

        Some(CgroupStats {
            memory_peak_bytes,
            cpu_user_usec,
            cpu_system_usec,
            cpu_total_usec,
        })
    }
}
