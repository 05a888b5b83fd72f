//! In-child bootstrap between clone and exec

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{execve, getpid};
use nsbox_core::{Result, SandboxError};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use crate::config::SandboxConfig;
use crate::hooks::Hooks;
use crate::spawn::handshake::{Channel, Token};
use crate::spawn::Stdio;
use nsbox_cgroup::CgroupDriver;

/// Signals the supervisor overrides; the child restores the default
/// disposition for each of them before exec.
pub const HANDLED_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGALRM,
    Signal::SIGCHLD,
    Signal::SIGTERM,
    Signal::SIGPIPE,
];

/// argv/envp prepared in the parent so the child allocates as little as
/// possible between clone and exec.
pub struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ExecImage {
    pub fn from_config(cfg: &SandboxConfig) -> Result<Self> {
        let to_cstring = |s: &str| {
            CString::new(s).map_err(|_| {
                SandboxError::ConfigInvalid(format!("embedded NUL byte in '{}'", s))
            })
        };

        let path = CString::new(cfg.exec_file.as_os_str().as_bytes()).map_err(|_| {
            SandboxError::ConfigInvalid("embedded NUL byte in executable path".to_string())
        })?;

        let argv = if cfg.argv.is_empty() {
            vec![path.clone()]
        } else {
            cfg.argv
                .iter()
                .map(|a| to_cstring(a))
                .collect::<Result<Vec<_>>>()?
        };

        let mut entries: Vec<String> = Vec::new();
        if cfg.keep_env {
            let overridden = |key: &str| {
                cfg.envs
                    .iter()
                    .any(|e| e.split('=').next() == Some(key))
            };
            for (key, value) in std::env::vars() {
                if !overridden(&key) {
                    entries.push(format!("{}={}", key, value));
                }
            }
        }
        entries.extend(cfg.envs.iter().cloned());
        let envp = entries
            .iter()
            .map(|e| to_cstring(e))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { path, argv, envp })
    }
}

fn reset_signals() -> Result<()> {
    for sig in HANDLED_SIGNALS {
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(|err| {
            SandboxError::KernelRefused(format!("signal({}, SIG_DFL): {}", sig, err))
        })?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|err| SandboxError::KernelRefused(format!("sigprocmask(SIG_SETMASK): {}", err)))
}

fn exec_image(cfg: &SandboxConfig, image: &ExecImage) -> SandboxError {
    if cfg.use_execveat {
        let Some(fd) = cfg.exec_fd else {
            return SandboxError::ConfigInvalid(
                "execveat requested without a pre-opened descriptor".to_string(),
            );
        };
        let mut argv_ptrs: Vec<*const libc::c_char> =
            image.argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> =
            image.envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        unsafe {
            libc::syscall(
                libc::SYS_execveat,
                fd,
                c"".as_ptr(),
                argv_ptrs.as_ptr(),
                envp_ptrs.as_ptr(),
                libc::AT_EMPTY_PATH,
            );
        }
        SandboxError::KernelRefused(format!("execveat(fd={}): {}", fd, Errno::last()))
    } else {
        let err = match execve(&image.path, &image.argv, &image.envp) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        SandboxError::KernelRefused(format!(
            "execve('{}') failed: {}",
            cfg.exec_file.display(),
            err
        ))
    }
}

/// Everything the child needs between clone and exec.
pub struct BootstrapCtx<'a> {
    pub cfg: &'a SandboxConfig,
    pub hooks: &'a dyn Hooks,
    pub driver: &'a dyn CgroupDriver,
    pub image: &'a ExecImage,
    pub io: Stdio,
}

/// Run the bootstrap sequence. On success the target image replaces this
/// process; every return is a failure.
pub fn run(ctx: &BootstrapCtx<'_>, channel: Option<&mut Channel>) -> Result<Infallible> {
    ctx.hooks.setup_fds(ctx.cfg, &ctx.io)?;
    reset_signals()?;

    match channel {
        // Unshared-only mode: there is no parent to prime our user and
        // cgroup namespaces, do it ourselves.
        None => {
            let pid = getpid();
            ctx.hooks.user_init_from_parent(ctx.cfg, pid)?;
            ctx.driver.init_child(pid)?;
        }
        // The parent holds privileges we lack; nothing containment-related
        // may happen until it reports completion.
        Some(chan) => match chan.recv()? {
            Token::Done => {}
            Token::Error => {
                return Err(SandboxError::PeerLost(
                    "parent signalled an error during setup".to_string(),
                ))
            }
        },
    }

    ctx.hooks.contain(ctx.cfg)?;

    debug!(
        "executing '{}' with {} args",
        ctx.cfg.exec_file.display(),
        ctx.image.argv.len()
    );

    // Must stay last: the policy may forbid exec itself.
    ctx.hooks.apply_policy(ctx.cfg)?;

    Err(exec_image(ctx.cfg, ctx.image))
}
