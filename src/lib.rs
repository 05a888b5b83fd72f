//! nsbox: Linux process isolation launcher
//!
//! Spawns a target executable inside freshly created kernel namespaces,
//! caps it with cgroup v2 controllers, tracks its lifetime and reaps it
//! with CPU/memory accounting.
//!
//! # Modules
//!
//! - **config**: sandbox configuration and builder
//! - **spawn**: clone engine, parent/child handshake, child bootstrap
//! - **supervisor**: process registry, reaper and timeout enforcement
//! - **hooks**: collaborator seams (network, user mapping, containment,
//!   seccomp policy)
//!
//! # Example
//!
//! ```ignore
//! use nsbox::{SandboxConfig, Stdio, Supervisor};
//!
//! let cfg = SandboxConfig::builder("/bin/echo")
//!     .args(["echo", "hello"])
//!     .mem_max(256 * 1024 * 1024)
//!     .pids_max(16)
//!     .time_limit(30)
//!     .build()?;
//! let mut supervisor = Supervisor::new(cfg)?;
//! supervisor.setup()?;
//! supervisor.spawn(Stdio::inherit(), None)?;
//! while supervisor.count() > 0 {
//!     supervisor.reap();
//! }
//! ```

#![feature(never_type)]

pub mod config;
pub mod hooks;
pub mod spawn;
pub mod supervisor;

pub use config::{NamespaceSet, RunMode, SandboxBuilder, SandboxConfig};
pub use hooks::{BaseHooks, Hooks};
pub use nsbox_cgroup::{CgroupLimits, CgroupStats};
pub use nsbox_core::{Result, SandboxError};
pub use spawn::{run_helper, Stdio};
pub use supervisor::registry::ProcessRecord;
pub use supervisor::Supervisor;

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
