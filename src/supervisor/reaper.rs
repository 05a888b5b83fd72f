//! Reaping, accounting and timeout enforcement

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use super::Supervisor;

fn signal_name(sig: i32) -> &'static str {
    Signal::try_from(sig).map(Signal::as_str).unwrap_or("UNKNOWN")
}

impl Supervisor {
    /// One non-blocking drain pass followed by the timeout sweep.
    /// Returns the exit status of the last child reaped (0 when none).
    pub fn reap(&mut self) -> i32 {
        let mut rv = 0;
        loop {
            // WNOWAIT leaves the child waitable: its /proc entry must
            // still be readable for the SIGSYS diagnostics below.
            let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT | WaitPidFlag::WEXITED;
            let status = match waitid(Id::All, flags) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => status,
                Err(_) => break,
            };
            let Some(pid) = status.pid() else {
                break;
            };
            if let WaitStatus::Signaled(_, Signal::SIGSYS, _) = status {
                self.log_seccomp_violation(pid);
            }
            rv = self.reap_one(pid, false);
        }

        self.sweep_timeouts();
        rv
    }

    /// Consume one child's exit status together with its resource usage,
    /// tear down its cgroup and drop its record.
    pub(super) fn reap_one(&mut self, pid: Pid, blocking: bool) -> i32 {
        let (remote_txt, rlimit_cpu) = match self.registry.get(pid) {
            Some(record) => {
                if let Some((soft, hard)) = record.rlimit_cpu {
                    info!(
                        "pid={} configured RLIMIT_CPU: cur={}, max={}",
                        pid, soft, hard
                    );
                }
                (record.remote_txt.clone(), record.rlimit_cpu)
            }
            None => {
                warn!("pid={} not found in the registry during reap", pid);
                ("[unknown]".to_string(), None)
            }
        };

        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let options = if blocking { 0 } else { libc::WNOHANG };
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, options, &mut usage) };
        if ret != pid.as_raw() {
            if ret == -1 && Errno::last() != Errno::ECHILD {
                warn!("wait4(pid={}, blocking={}) failed: {}", pid, blocking, Errno::last());
            }
            return 0;
        }

        let user_sec = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1e6;
        let sys_sec = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1e6;
        let tot_sec = user_sec + sys_sec;
        info!(
            "pid={} CPU usage -> user: {:.6}s, sys: {:.6}s, total: {:.6}s",
            pid, user_sec, sys_sec, tot_sec
        );

        // Accounting is read (and the cgroup removed) strictly before the
        // record goes away.
        self.driver.finish_child(pid);
        let left = self.registry.count().saturating_sub(1);

        if libc::WIFEXITED(status) {
            let code = libc::WEXITSTATUS(status);
            info!(
                "pid={} ({}) exited with status: {}, (children left: {})",
                pid, remote_txt, code, left
            );
            self.registry.remove(pid);
            return code;
        }

        if libc::WIFSIGNALED(status) {
            let sig = libc::WTERMSIG(status);
            if sig == libc::SIGXCPU {
                info!(
                    "pid={} ({}) killed: CPU soft limit exceeded (SIGXCPU), (children left: {})",
                    pid, remote_txt, left
                );
            } else if sig == libc::SIGKILL {
                // Whole-second comparison: RLIMIT_CPU itself only has
                // second granularity.
                match rlimit_cpu {
                    Some((_, hard)) if tot_sec >= hard as f64 => info!(
                        "pid={} ({}) killed: CPU hard limit exceeded (SIGKILL), \
                         used={:.3}s, hard_limit={}s, (children left: {})",
                        pid, remote_txt, tot_sec, hard, left
                    ),
                    _ => info!(
                        "pid={} ({}) killed by SIGKILL, (children left: {})",
                        pid, remote_txt, left
                    ),
                }
            } else {
                info!(
                    "pid={} ({}) terminated with signal: {} ({}), (children left: {})",
                    pid,
                    remote_txt,
                    signal_name(sig),
                    sig,
                    left
                );
            }
            self.registry.remove(pid);
            return 128 + sig;
        }

        0
    }

    /// Report the syscall a child was killed over, read from the
    /// `/proc/<pid>/syscall` descriptor captured at spawn.
    fn log_seccomp_violation(&self, pid: Pid) {
        warn!(
            "pid={} committed a syscall/seccomp violation and exited with SIGSYS",
            pid
        );
        let Some(record) = self.registry.get(pid) else {
            warn!("no registry entry for violating pid={}", pid);
            return;
        };
        let Some(file) = record.syscall_fd.as_ref() else {
            warn!("pid={} has no syscall state descriptor", pid);
            return;
        };

        let mut buf = [0u8; 4096];
        let n = match file.read_at(&mut buf, 0) {
            Ok(n) if n > 0 => n,
            _ => {
                warn!("pid={}: syscall state no longer readable", pid);
                return;
            }
        };
        let content = String::from_utf8_lossy(&buf[..n]);

        let mut fields = content.split_whitespace();
        let number: Option<i64> = fields.next().and_then(|f| f.parse().ok());
        let rest: Vec<u64> = fields.map_while(parse_hex_field).collect();

        match (number, rest.len()) {
            (Some(nr), n) if n >= 8 => warn!(
                "pid={}, syscall number:{}, arguments:{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}, \
                 SP:{:#x}, PC:{:#x}",
                pid, nr, rest[0], rest[1], rest[2], rest[3], rest[4], rest[5], rest[6], rest[7]
            ),
            // A task blocked outside a syscall only exposes "-1 sp pc".
            (Some(nr), 2) => warn!(
                "pid={} was not inside a syscall (number:{}), SP:{:#x}, PC:{:#x}",
                pid, nr, rest[0], rest[1]
            ),
            _ => warn!(
                "pid={}: unparseable syscall state '{}' (see 'dmesg' or 'journalctl -ek' for a \
                 possible audit report)",
                pid,
                content.trim_end()
            ),
        }
    }

    /// Kill every child whose wall-clock budget is spent. SIGKILL alone
    /// cannot wake a namespaced process in the stopped state, so SIGCONT
    /// goes first.
    fn sweep_timeouts(&mut self) {
        if self.cfg.time_limit_secs == 0 {
            return;
        }
        let limit = Duration::from_secs(self.cfg.time_limit_secs);
        for record in self.registry.iter() {
            let age = record.age();
            if age < limit {
                continue;
            }
            info!(
                "pid={} run time >= time limit ({} >= {}) ({}). Killing it",
                record.pid,
                age.as_secs(),
                self.cfg.time_limit_secs,
                record.remote_txt
            );
            let _ = kill(record.pid, Signal::SIGCONT);
            let _ = kill(record.pid, Signal::SIGKILL);
        }
    }
}

fn parse_hex_field(field: &str) -> Option<u64> {
    u64::from_str_radix(field.trim_start_matches("0x"), 16).ok()
}
