//! Sandbox configuration

use nsbox_cgroup::CgroupLimits;
use nsbox_core::{Result, SandboxError};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::spawn::clone::CLONE_NEWTIME;

/// How the target process is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Spawn a supervised child via the clone engine
    #[default]
    Clone,
    /// unshare(2) the requested namespaces and exec in place, replacing
    /// the launcher process
    Execve,
}

/// Namespaces created for every child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    pub mount: bool,
    pub pid: bool,
    pub net: bool,
    pub ipc: bool,
    pub uts: bool,
    pub user: bool,
    pub cgroup: bool,
    pub time: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            net: true,
            ipc: true,
            uts: true,
            user: true,
            cgroup: true,
            time: false,
        }
    }
}

impl NamespaceSet {
    /// No namespace creation at all (the child still gets its own cgroup
    /// and limits).
    pub fn none() -> Self {
        Self {
            mount: false,
            pid: false,
            net: false,
            ipc: false,
            uts: false,
            user: false,
            cgroup: false,
            time: false,
        }
    }

    pub fn all() -> Self {
        Self {
            time: true,
            ..Default::default()
        }
    }

    /// Kernel clone flag set for the enabled namespaces
    pub fn clone_flags(&self) -> u64 {
        let mut flags = 0u64;
        if self.mount {
            flags |= libc::CLONE_NEWNS as u64;
        }
        if self.pid {
            flags |= libc::CLONE_NEWPID as u64;
        }
        if self.net {
            flags |= libc::CLONE_NEWNET as u64;
        }
        if self.ipc {
            flags |= libc::CLONE_NEWIPC as u64;
        }
        if self.uts {
            flags |= libc::CLONE_NEWUTS as u64;
        }
        if self.user {
            flags |= libc::CLONE_NEWUSER as u64;
        }
        if self.cgroup {
            flags |= libc::CLONE_NEWCGROUP as u64;
        }
        if self.time {
            flags |= CLONE_NEWTIME;
        }
        flags
    }

    pub fn enabled_count(&self) -> usize {
        [
            self.mount,
            self.pid,
            self.net,
            self.ipc,
            self.uts,
            self.user,
            self.cgroup,
            self.time,
        ]
        .iter()
        .filter(|&&on| on)
        .count()
    }
}

/// Immutable description of one sandbox launch
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub mode: RunMode,
    pub namespaces: NamespaceSet,
    /// cgroup v2 mount (or the v1 hierarchy root on legacy systems)
    pub cgroup_mount: PathBuf,
    /// Derived from mount detection at supervisor startup
    pub use_cgroupv2: bool,
    pub limits: CgroupLimits,
    /// Wall-clock budget in seconds, 0 = unlimited
    pub time_limit_secs: u64,
    /// RLIMIT_CPU applied in the child (soft and hard), seconds
    pub rlimit_cpu_secs: Option<u64>,
    /// Target executable path
    pub exec_file: PathBuf,
    /// Pre-opened executable descriptor for the execveat path
    pub exec_fd: Option<RawFd>,
    pub use_execveat: bool,
    /// Full argument vector including argv[0]; exec_file is used as
    /// argv[0] when empty
    pub argv: Vec<String>,
    /// KEY=VALUE entries applied in the child
    pub envs: Vec<String>,
    /// Keep the caller environment instead of starting from a clean one
    pub keep_env: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            namespaces: NamespaceSet::default(),
            cgroup_mount: PathBuf::from("/sys/fs/cgroup"),
            use_cgroupv2: false,
            limits: CgroupLimits::default(),
            time_limit_secs: 0,
            rlimit_cpu_secs: None,
            exec_file: PathBuf::new(),
            exec_fd: None,
            use_execveat: false,
            argv: Vec::new(),
            envs: Vec::new(),
            keep_env: false,
        }
    }
}

impl SandboxConfig {
    pub fn builder(program: impl AsRef<Path>) -> SandboxBuilder {
        SandboxBuilder::new(program)
    }

    pub fn validate(&self) -> Result<()> {
        if self.exec_file.as_os_str().is_empty() {
            return Err(SandboxError::ConfigInvalid(
                "No executable configured".to_string(),
            ));
        }
        if self.use_execveat && self.exec_fd.is_none() {
            return Err(SandboxError::ConfigInvalid(
                "execveat requested without a pre-opened executable descriptor".to_string(),
            ));
        }
        if self.limits.mem_memsw_max > 0 && self.limits.derived_swap_max() < 0 {
            return Err(SandboxError::ConfigInvalid(
                "memory+swap cap is smaller than the memory cap".to_string(),
            ));
        }
        for env in &self.envs {
            if !env.contains('=') {
                return Err(SandboxError::ConfigInvalid(format!(
                    "Environment entry '{}' is not KEY=VALUE",
                    env
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`SandboxConfig`]
pub struct SandboxBuilder {
    config: SandboxConfig,
}

impl SandboxBuilder {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            config: SandboxConfig {
                exec_file: program.as_ref().to_path_buf(),
                ..Default::default()
            },
        }
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn namespaces(mut self, set: NamespaceSet) -> Self {
        self.config.namespaces = set;
        self
    }

    pub fn cgroup_mount(mut self, mount: impl AsRef<Path>) -> Self {
        self.config.cgroup_mount = mount.as_ref().to_path_buf();
        self
    }

    /// Memory cap in bytes
    pub fn mem_max(mut self, bytes: u64) -> Self {
        self.config.limits.mem_max = bytes;
        self
    }

    /// Combined memory+swap cap in bytes
    pub fn mem_memsw_max(mut self, bytes: u64) -> Self {
        self.config.limits.mem_memsw_max = bytes;
        self
    }

    /// Swap cap in bytes
    pub fn mem_swap_max(mut self, bytes: i64) -> Self {
        self.config.limits.mem_swap_max = bytes;
        self
    }

    pub fn pids_max(mut self, count: u64) -> Self {
        self.config.limits.pids_max = count;
        self
    }

    /// CPU quota in milliseconds of CPU time per wall-clock second
    pub fn cpu_ms_per_sec(mut self, ms: u32) -> Self {
        self.config.limits.cpu_ms_per_sec = ms;
        self
    }

    /// Wall-clock budget in seconds, 0 = unlimited
    pub fn time_limit(mut self, secs: u64) -> Self {
        self.config.time_limit_secs = secs;
        self
    }

    /// RLIMIT_CPU in seconds, applied as both soft and hard limit
    pub fn rlimit_cpu(mut self, secs: u64) -> Self {
        self.config.rlimit_cpu_secs = Some(secs);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a KEY=VALUE entry to the child environment
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.config.envs.push(entry.into());
        self
    }

    pub fn keep_env(mut self, keep: bool) -> Self {
        self.config.keep_env = keep;
        self
    }

    /// Exec through a pre-opened descriptor instead of the path
    pub fn exec_fd(mut self, fd: RawFd) -> Self {
        self.config.exec_fd = Some(fd);
        self.config.use_execveat = true;
        self
    }

    pub fn build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_namespaces_skip_time() {
        let set = NamespaceSet::default();
        assert!(set.mount && set.pid && set.user);
        assert!(!set.time);
        assert_eq!(NamespaceSet::all().enabled_count(), 8);
        assert_eq!(NamespaceSet::none().enabled_count(), 0);
    }

    #[test]
    fn clone_flags_reflect_enabled_namespaces() {
        let mut set = NamespaceSet::none();
        assert_eq!(set.clone_flags(), 0);
        set.pid = true;
        set.net = true;
        assert_eq!(
            set.clone_flags(),
            libc::CLONE_NEWPID as u64 | libc::CLONE_NEWNET as u64
        );
        set.time = true;
        assert_ne!(set.clone_flags() & CLONE_NEWTIME, 0);
    }

    #[test]
    fn builder_collects_limits_and_argv() {
        let config = SandboxConfig::builder("/bin/echo")
            .arg("/bin/echo")
            .arg("hi")
            .mem_max(1024)
            .pids_max(4)
            .cpu_ms_per_sec(100)
            .time_limit(5)
            .rlimit_cpu(2)
            .env("FOO=bar")
            .build()
            .unwrap();
        assert_eq!(config.exec_file, PathBuf::from("/bin/echo"));
        assert_eq!(config.argv, vec!["/bin/echo", "hi"]);
        assert_eq!(config.limits.mem_max, 1024);
        assert_eq!(config.limits.pids_max, 4);
        assert_eq!(config.limits.cpu_ms_per_sec, 100);
        assert_eq!(config.time_limit_secs, 5);
        assert_eq!(config.rlimit_cpu_secs, Some(2));
    }

    #[test]
    fn validate_rejects_empty_program() {
        let config = SandboxConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_execveat_without_fd() {
        let mut config = SandboxConfig::builder("/bin/true").build().unwrap();
        config.use_execveat = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_memsw_cap() {
        let result = SandboxConfig::builder("/bin/true")
            .mem_max(200)
            .mem_memsw_max(100)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_malformed_env() {
        let result = SandboxConfig::builder("/bin/true").env("NOVALUE").build();
        assert!(result.is_err());
    }
}
