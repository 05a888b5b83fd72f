//! Driver abstraction over the v1 and v2 cgroup hierarchies

use log::debug;
use nix::sys::statfs;
use nix::unistd::Pid;
use nsbox_core::Result;
use std::path::Path;

use crate::v1::CgroupV1Driver;
use crate::v2::CgroupV2Driver;

/// Resource caps applied to every spawned child.
///
/// Unset sentinels follow the kernel interface conventions: zero for the
/// byte/count caps, negative for the swap cap.
#[derive(Debug, Clone)]
pub struct CgroupLimits {
    /// memory.max in bytes, 0 = unset
    pub mem_max: u64,
    /// combined memory+swap cap in bytes, 0 = unset
    pub mem_memsw_max: u64,
    /// memory.swap.max in bytes, negative = unset
    pub mem_swap_max: i64,
    /// pids.max, 0 = unset
    pub pids_max: u64,
    /// CPU quota in milliseconds per wall-clock second, 0 = unset
    pub cpu_ms_per_sec: u32,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            mem_max: 0,
            mem_memsw_max: 0,
            mem_swap_max: -1,
            pids_max: 0,
            cpu_ms_per_sec: 0,
        }
    }
}

impl CgroupLimits {
    /// Effective swap cap. A combined memory+swap cap takes precedence and
    /// yields `mem_memsw_max - mem_max`; callers setting a combined cap
    /// must also set the memory cap, otherwise the memory side stays
    /// unlimited while only the swap share is constrained.
    pub fn derived_swap_max(&self) -> i64 {
        if self.mem_memsw_max > 0 {
            self.mem_memsw_max as i64 - self.mem_max as i64
        } else {
            self.mem_swap_max
        }
    }

    pub fn needs_memory(&self) -> bool {
        self.mem_max > 0 || self.derived_swap_max() >= 0
    }

    pub fn needs_pids(&self) -> bool {
        self.pids_max != 0
    }

    pub fn needs_cpu(&self) -> bool {
        self.cpu_ms_per_sec != 0
    }

    /// True when at least one controller has work to do; nothing is
    /// created or torn down otherwise.
    pub fn any(&self) -> bool {
        self.needs_memory() || self.needs_pids() || self.needs_cpu()
    }
}

/// Per-child accounting collected at teardown. -1 marks a value that
/// could not be read or parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupStats {
    pub memory_peak_bytes: i64,
    pub cpu_user_usec: i64,
    pub cpu_system_usec: i64,
    pub cpu_total_usec: i64,
}

/// Capability interface over one cgroup hierarchy flavor.
///
/// The supervisor picks one implementation at startup (from
/// [`detect_cgroupv2`]) and never branches on the flavor again.
pub trait CgroupDriver {
    fn name(&self) -> &'static str;

    /// Once-per-process hierarchy preparation. Failure is fatal for the
    /// supervisor: no child can ever be contained.
    fn setup(&mut self) -> Result<()>;

    /// Create and populate the per-child cgroup before the child is
    /// allowed to exec. Any failure aborts the spawn.
    fn init_child(&self, pid: Pid) -> Result<()>;

    /// Read accounting and remove the per-child cgroup, best-effort.
    /// Returns `None` when no controller was configured for the child.
    fn finish_child(&self, pid: Pid) -> Option<CgroupStats>;
}

/// Check whether `mount` is a cgroup2 filesystem. Non-fatal: a missing
/// path simply disables the v2 code path.
pub fn detect_cgroupv2(mount: &Path) -> bool {
    match statfs::statfs(mount) {
        Ok(fs) => fs.filesystem_type() == statfs::CGROUP2_SUPER_MAGIC,
        Err(err) => {
            debug!("statfs({}) failed: {}", mount.display(), err);
            false
        }
    }
}

/// Build the driver matching the detected hierarchy flavor.
pub fn driver_for(mount: &Path, limits: CgroupLimits, use_v2: bool) -> Box<dyn CgroupDriver> {
    if use_v2 {
        Box::new(CgroupV2Driver::new(mount, limits))
    } else {
        Box::new(CgroupV1Driver::new(mount, limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_limits_need_nothing() {
        let limits = CgroupLimits::default();
        assert!(!limits.needs_memory());
        assert!(!limits.needs_pids());
        assert!(!limits.needs_cpu());
        assert!(!limits.any());
    }

    #[test]
    fn memsw_cap_derives_swap() {
        let limits = CgroupLimits {
            mem_max: 100,
            mem_memsw_max: 150,
            ..Default::default()
        };
        assert_eq!(limits.derived_swap_max(), 50);
        assert!(limits.needs_memory());
    }

    #[test]
    fn explicit_swap_cap_used_directly() {
        let limits = CgroupLimits {
            mem_swap_max: 0,
            ..Default::default()
        };
        assert_eq!(limits.derived_swap_max(), 0);
        assert!(limits.needs_memory());
    }

    #[test]
    fn negative_derived_swap_disables_memory_when_unset() {
        let limits = CgroupLimits::default();
        assert_eq!(limits.derived_swap_max(), -1);
        assert!(!limits.needs_memory());
    }

    #[test]
    fn detect_rejects_non_cgroup_path() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!detect_cgroupv2(tmp.path()));
    }

    #[test]
    fn detect_rejects_missing_path() {
        assert!(!detect_cgroupv2(&PathBuf::from("/nonexistent/cgroup2")));
    }

    #[test]
    fn driver_for_dispatches_on_flavor() {
        let tmp = tempfile::tempdir().unwrap();
        let v2 = driver_for(tmp.path(), CgroupLimits::default(), true);
        let v1 = driver_for(tmp.path(), CgroupLimits::default(), false);
        assert_eq!(v2.name(), "cgroupv2");
        assert_eq!(v1.name(), "cgroupv1");
    }
}
