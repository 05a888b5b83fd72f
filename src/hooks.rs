//! Collaborator seams around the spawn lifecycle
//!
//! The supervisor drives these as opaque steps: network and uid/gid map
//! setup from the parent side, stdio/containment/policy from inside the
//! child. [`BaseHooks`] performs the minimal real work; embedders override
//! the seams they care about.

use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{dup2, Pid};
use nsbox_core::{Result, SandboxError};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::config::SandboxConfig;
use crate::spawn::Stdio;

pub trait Hooks {
    /// Gate a new spawn when driven by an accepting socket. Returning
    /// false declines the connection and prevents the spawn.
    fn limit_conns(&self, _cfg: &SandboxConfig, _net_fd: Option<RawFd>) -> bool {
        true
    }

    /// Parent-side network namespace setup for the child. Failure aborts
    /// the spawn.
    fn net_init_from_parent(&self, _cfg: &SandboxConfig, _pid: Pid) -> Result<()> {
        Ok(())
    }

    /// Describe the remote peer behind `net_fd`. Empty when the spawn is
    /// not socket-driven.
    fn conn_to_text(&self, _net_fd: Option<RawFd>) -> (String, Option<SocketAddr>) {
        (String::new(), None)
    }

    /// Parent-side uid/gid map configuration for the child. Must run
    /// before the handshake completes.
    fn user_init_from_parent(&self, _cfg: &SandboxConfig, _pid: Pid) -> Result<()> {
        Ok(())
    }

    /// In-child: route stdio to the caller-supplied descriptors.
    fn setup_fds(&self, _cfg: &SandboxConfig, io: &Stdio) -> Result<()> {
        let map_err = |call: &str, err: nix::errno::Errno| {
            SandboxError::KernelRefused(format!("{}: {}", call, err))
        };
        if io.stdin != libc::STDIN_FILENO {
            dup2(io.stdin, libc::STDIN_FILENO).map_err(|e| map_err("dup2(stdin)", e))?;
        }
        if io.stdout != libc::STDOUT_FILENO {
            dup2(io.stdout, libc::STDOUT_FILENO).map_err(|e| map_err("dup2(stdout)", e))?;
        }
        if io.stderr != libc::STDERR_FILENO {
            dup2(io.stderr, libc::STDERR_FILENO).map_err(|e| map_err("dup2(stderr)", e))?;
        }
        Ok(())
    }

    /// In-child containment: filesystem setup, capability drop, rlimit
    /// application. The default applies the configured CPU rlimit.
    fn contain(&self, cfg: &SandboxConfig) -> Result<()> {
        if let Some(secs) = cfg.rlimit_cpu_secs {
            setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(|err| {
                SandboxError::KernelRefused(format!("setrlimit(RLIMIT_CPU, {}): {}", secs, err))
            })?;
        }
        Ok(())
    }

    /// Final security policy installation (seccomp). Must stay the last
    /// step before exec: a policy may forbid the exec syscalls themselves.
    fn apply_policy(&self, _cfg: &SandboxConfig) -> Result<()> {
        Ok(())
    }
}

/// Default collaborator set: stdio redirection and rlimits only.
pub struct BaseHooks;

impl Hooks for BaseHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_hooks_accept_everything() {
        let cfg = SandboxConfig::builder("/bin/true").build().unwrap();
        let hooks = BaseHooks;
        assert!(hooks.limit_conns(&cfg, None));
        assert!(hooks.net_init_from_parent(&cfg, Pid::from_raw(1)).is_ok());
        assert!(hooks.user_init_from_parent(&cfg, Pid::from_raw(1)).is_ok());
        assert!(hooks.apply_policy(&cfg).is_ok());
        let (txt, addr) = hooks.conn_to_text(None);
        assert!(txt.is_empty());
        assert!(addr.is_none());
    }

    #[test]
    fn setup_fds_is_a_noop_for_inherited_stdio() {
        let cfg = SandboxConfig::builder("/bin/true").build().unwrap();
        assert!(BaseHooks.setup_fds(&cfg, &Stdio::inherit()).is_ok());
    }

    #[test]
    fn contain_without_rlimit_succeeds() {
        let cfg = SandboxConfig::builder("/bin/true").build().unwrap();
        assert!(BaseHooks.contain(&cfg).is_ok());
    }
}
