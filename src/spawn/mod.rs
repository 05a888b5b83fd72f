//! Process creation: clone engine, handshake channel, child bootstrap

pub mod child;
pub mod clone;
pub mod handshake;
pub mod helper;

pub use helper::run_helper;

use std::os::unix::io::RawFd;

/// Caller-supplied standard streams for the child
#[derive(Debug, Clone, Copy)]
pub struct Stdio {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

impl Stdio {
    /// Pass the supervisor's own standard streams through
    pub fn inherit() -> Self {
        Self {
            stdin: libc::STDIN_FILENO,
            stdout: libc::STDOUT_FILENO,
            stderr: libc::STDERR_FILENO,
        }
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Self::inherit()
    }
}
