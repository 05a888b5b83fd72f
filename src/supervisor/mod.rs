//! Single-threaded spawn/reap supervisor

pub mod registry;
mod reaper;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use nsbox_core::{Result, SandboxError};
use nsbox_cgroup::{detect_cgroupv2, driver_for, CgroupDriver};
use std::os::unix::io::RawFd;

use crate::config::{RunMode, SandboxConfig};
use crate::hooks::{BaseHooks, Hooks};
use crate::spawn::child::{self, BootstrapCtx, ExecImage};
use crate::spawn::clone::{clone_flags_to_str, spawn_process};
use crate::spawn::handshake::{Channel, Token};
use crate::spawn::Stdio;
use self::registry::{ProcessRecord, Registry};

/// Owns every live child: spawns them through the clone engine, primes
/// their namespaces and cgroup from the parent side, and reaps them with
/// accounting. Strictly single-threaded; the registry has one writer.
pub struct Supervisor {
    cfg: SandboxConfig,
    hooks: Box<dyn Hooks>,
    driver: Box<dyn CgroupDriver>,
    registry: Registry,
}

impl Supervisor {
    pub fn new(cfg: SandboxConfig) -> Result<Self> {
        Self::with_hooks(cfg, Box::new(BaseHooks))
    }

    pub fn with_hooks(mut cfg: SandboxConfig, hooks: Box<dyn Hooks>) -> Result<Self> {
        cfg.validate()?;
        cfg.use_cgroupv2 = detect_cgroupv2(&cfg.cgroup_mount);
        info!(
            "cgroup v2 {} at '{}'",
            if cfg.use_cgroupv2 {
                "detected"
            } else {
                "not detected, using the legacy hierarchy"
            },
            cfg.cgroup_mount.display()
        );
        let driver = driver_for(&cfg.cgroup_mount, cfg.limits.clone(), cfg.use_cgroupv2);
        Ok(Self {
            cfg,
            hooks,
            driver,
            registry: Registry::default(),
        })
    }

    /// Once-per-process cgroup hierarchy preparation. Failing here is
    /// fatal for the launcher: no child could ever be contained.
    pub fn setup(&mut self) -> Result<()> {
        if self.cfg.limits.any() {
            self.driver.setup()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.cfg
    }

    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Launch one child. Returns `None` when the connection gate declined
    /// the spawn, otherwise the child's PID once it is registered and its
    /// parent-side setup completed.
    pub fn spawn(&mut self, io: Stdio, net_fd: Option<RawFd>) -> Result<Option<Pid>> {
        if !self.hooks.limit_conns(&self.cfg, net_fd) {
            return Ok(None);
        }

        let flags = self.cfg.namespaces.clone_flags();
        let image = ExecImage::from_config(&self.cfg)?;

        if self.cfg.mode == RunMode::Execve {
            return self.run_in_place(flags, &image, io);
        }

        debug!(
            "creating child with clone flags:{} exit_signal:SIGCHLD",
            clone_flags_to_str(flags)
        );

        let (mut parent_chan, mut child_chan) = Channel::pair()?;
        let parent_raw = parent_chan.as_raw_fd();
        let ctx = BootstrapCtx {
            cfg: &self.cfg,
            hooks: &*self.hooks,
            driver: &*self.driver,
            image: &image,
            io,
        };

        let pid = spawn_process(flags, libc::SIGCHLD, move || {
            // Close the copy of the parent's endpoint so that parent death
            // is observable as EOF on ours.
            unsafe { libc::close(parent_raw) };
            let err = match child::run(&ctx, Some(&mut child_chan)) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            log::error!("launching the child process failed: {}", err);
            let _ = child_chan.send(Token::Error);
            unsafe { libc::_exit(0xff) }
        })?;

        // Register before DONE: the child stays parked on the handshake,
        // so no SIGCHLD for this PID can be observed before the record
        // exists.
        let (remote_txt, remote_addr) = self.hooks.conn_to_text(net_fd);
        self.registry.add(ProcessRecord::new(
            pid,
            remote_txt,
            remote_addr,
            self.cfg.rlimit_cpu_secs,
        ));

        if let Err(err) = self.init_parent(pid, &mut parent_chan) {
            warn!("parent-side setup for pid={} failed: {}", pid, err);
            self.abort_spawn(pid);
            return Err(err);
        }

        match parent_chan.recv() {
            Ok(Token::Error) => {
                warn!(
                    "received an error from child pid={} before it was executed",
                    pid
                );
                Err(SandboxError::ChildAborted)
            }
            // EOF here is the success signal: both handshake endpoints are
            // close-on-exec.
            _ => Ok(Some(pid)),
        }
    }

    /// Standalone mode: unshare the requested namespaces and become the
    /// target. Only returns on failure.
    fn run_in_place(&self, flags: u64, image: &ExecImage, io: Stdio) -> Result<Option<Pid>> {
        debug!("unshare(flags: {})", clone_flags_to_str(flags));
        if unsafe { libc::unshare(flags as libc::c_int) } == -1 {
            return Err(SandboxError::KernelRefused(format!(
                "unshare({}): {}",
                clone_flags_to_str(flags),
                nix::errno::Errno::last()
            )));
        }
        let ctx = BootstrapCtx {
            cfg: &self.cfg,
            hooks: &*self.hooks,
            driver: &*self.driver,
            image,
            io,
        };
        let err: SandboxError = match child::run(&ctx, None) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        Err(err)
    }

    /// Network, cgroup and uid/gid-map setup the child cannot do for
    /// itself, finished off by the DONE token.
    fn init_parent(&mut self, pid: Pid, chan: &mut Channel) -> Result<()> {
        self.hooks.net_init_from_parent(&self.cfg, pid)?;
        self.driver.init_child(pid)?;
        self.hooks.user_init_from_parent(&self.cfg, pid)?;
        chan.send(Token::Done)
    }

    /// Force-kill a half-set-up child and reap it synchronously.
    fn abort_spawn(&mut self, pid: Pid) {
        let _ = kill(pid, Signal::SIGKILL);
        self.reap_one(pid, true);
        if self.registry.get(pid).is_some() {
            self.driver.finish_child(pid);
            self.registry.remove(pid);
        }
    }

    /// Send `signal` to every tracked child and reap each one, blocking.
    pub fn kill_all(&mut self, signal: Signal) {
        while let Some(pid) = self.registry.pids().into_iter().next() {
            if kill(pid, signal).is_ok() {
                self.reap_one(pid, true);
            }
            if self.registry.get(pid).is_some() {
                // Already gone or unreapable: drop the record, cleaning
                // up its cgroup best-effort.
                self.driver.finish_child(pid);
                self.registry.remove(pid);
            }
        }
    }

    /// Log the live children with their runtime and remaining budget.
    pub fn log_status(&self) {
        info!("total number of spawned children: {}", self.registry.count());
        for record in self.registry.iter() {
            let age = record.age().as_secs();
            let left = if self.cfg.time_limit_secs > 0 {
                format!("{}", self.cfg.time_limit_secs.saturating_sub(age))
            } else {
                "unlimited".to_string()
            };
            info!(
                "pid={}, remote host: '{}', run time: {} sec. (time left: {} s.)",
                record.pid, record.remote_txt, age, left
            );
        }
    }

}
