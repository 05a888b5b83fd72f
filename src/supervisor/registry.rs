//! In-parent bookkeeping for live children

use log::debug;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};

/// Tracking state for one live child.
pub struct ProcessRecord {
    pub pid: Pid,
    pub start: Instant,
    /// Textual peer description; empty unless the spawn was socket-driven
    pub remote_txt: String,
    pub remote_addr: Option<SocketAddr>,
    /// `/proc/<pid>/syscall`, readable only while the task exists; used
    /// for seccomp violation diagnostics
    pub syscall_fd: Option<File>,
    /// (soft, hard) RLIMIT_CPU snapshot applied in the child
    pub rlimit_cpu: Option<(u64, u64)>,
}

impl ProcessRecord {
    pub fn new(
        pid: Pid,
        remote_txt: String,
        remote_addr: Option<SocketAddr>,
        rlimit_cpu_secs: Option<u64>,
    ) -> Self {
        let path = format!("/proc/{}/syscall", pid);
        let syscall_fd = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
        {
            Ok(file) => Some(file),
            Err(err) => {
                debug!("could not open '{}': {}", path, err);
                None
            }
        };
        Self {
            pid,
            start: Instant::now(),
            remote_txt,
            remote_addr,
            syscall_fd,
            rlimit_cpu: rlimit_cpu_secs.map(|secs| (secs, secs)),
        }
    }

    pub fn age(&self) -> Duration {
        self.start.elapsed()
    }
}

/// PID-keyed map of live children. Mutated only by the supervisor, so no
/// locking is involved; the accounting FD is owned by the record and
/// closes exactly once, when the record is dropped on removal.
#[derive(Default)]
pub struct Registry {
    records: HashMap<Pid, ProcessRecord>,
}

impl Registry {
    /// Track a freshly cloned child. A duplicate PID means the kernel
    /// reused it before we reaped the previous holder, which cannot
    /// happen; treat it as a programming error.
    pub fn add(&mut self, record: ProcessRecord) {
        let pid = record.pid;
        if self.records.contains_key(&pid) {
            panic!("pid={} is already tracked", pid);
        }
        debug!("added pid={} to the registry ('{}')", pid, record.remote_txt);
        self.records.insert(pid, record);
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRecord> {
        let record = self.records.remove(&pid);
        match &record {
            Some(r) => debug!(
                "removed pid={} from the registry ('{}', ran {:.1}s)",
                pid,
                r.remote_txt,
                r.age().as_secs_f64()
            ),
            None => debug!("pid={} was not tracked", pid),
        }
        record
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.records.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }
}
