//! Synchronous execution of helper programs
//!
//! Used for optional hook programs around the sandbox lifecycle. The
//! sentinel pipe is close-on-exec: a byte arriving on it means the exec
//! itself failed, an immediate EOF means the helper is running.

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{fork, pipe2, ForkResult};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};

/// Run a helper program to completion.
///
/// Returns 0 for a clean zero exit, 1 for a clean non-zero exit, 2 when
/// the helper was killed by a signal, and -1 when it could not be started
/// at all (fork or exec failure).
pub fn run_helper(args: &[String], env: &[String]) -> i32 {
    let Some(argv) = to_cstrings(args) else {
        return -1;
    };
    if argv.is_empty() {
        warn!("helper invocation without a program");
        return -1;
    }
    let Some(envp) = to_cstrings(env) else {
        return -1;
    };

    let (read_end, write_end) = match pipe2(OFlag::O_CLOEXEC) {
        Ok(ends) => ends,
        Err(err) => {
            warn!("pipe2(O_CLOEXEC) failed: {}", err);
            return -1;
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(read_end);
            let _ = nix::unistd::execve(&argv[0], &argv, &envp);
            // Only reached when exec failed; report it through the pipe.
            let mut sentinel = File::from(write_end);
            let _ = sentinel.write_all(b"A");
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_end);
            let mut buf = [0u8; 1];
            let exec_failed = matches!(File::from(read_end).read(&mut buf), Ok(n) if n > 0);
            if exec_failed {
                warn!("could not execute helper '{}'", args[0]);
            }

            loop {
                let mut status: libc::c_int = 0;
                let ret = unsafe {
                    libc::wait4(child.as_raw(), &mut status, libc::__WALL, std::ptr::null_mut())
                };
                if ret == -1 {
                    if Errno::last() == Errno::EINTR {
                        continue;
                    }
                    warn!("wait4(pid={}) failed: {}", child, Errno::last());
                    return -1;
                }
                if libc::WIFEXITED(status) {
                    let code = libc::WEXITSTATUS(status);
                    debug!("helper pid={} exited with code {}", child, code);
                    if exec_failed {
                        return -1;
                    }
                    return if code == 0 { 0 } else { 1 };
                }
                if libc::WIFSIGNALED(status) {
                    warn!(
                        "helper pid={} killed by signal {}",
                        child,
                        libc::WTERMSIG(status)
                    );
                    return 2;
                }
            }
        }
        Err(err) => {
            warn!("fork() failed: {}", err);
            -1
        }
    }
}

fn to_cstrings(items: &[String]) -> Option<Vec<CString>> {
    items
        .iter()
        .map(|s| CString::new(s.as_str()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn helper_reports_clean_exit() {
        let _guard = serial_guard();
        assert_eq!(run_helper(&strings(&["/bin/true"]), &[]), 0);
    }

    #[test]
    fn helper_reports_nonzero_exit() {
        let _guard = serial_guard();
        assert_eq!(run_helper(&strings(&["/bin/false"]), &[]), 1);
    }

    #[test]
    fn helper_reports_exec_failure() {
        let _guard = serial_guard();
        assert_eq!(
            run_helper(&strings(&["/nonexistent/helper-program"]), &[]),
            -1
        );
    }

    #[test]
    fn helper_rejects_empty_argv() {
        assert_eq!(run_helper(&[], &[]), -1);
    }

    #[test]
    fn helper_passes_environment() {
        let _guard = serial_guard();
        let rv = run_helper(
            &strings(&["/bin/sh", "-c", "test \"$NSBOX_HELPER_VAR\" = set"]),
            &strings(&["NSBOX_HELPER_VAR=set", "PATH=/bin:/usr/bin"]),
        );
        assert_eq!(rv, 0);
    }
}
