//! Clone engine: namespace-creating process creation
//!
//! clone3 is the preferred path; it is the only one that supports
//! CLONE_NEWTIME and CLONE_CLEAR_SIGHAND. Kernels without clone3 fall
//! back to clone(2) on a static stack (feature `legacy-clone`).

use log::{debug, warn};
use nix::errno::Errno;
use nix::unistd::Pid;
use nsbox_core::{Result, SandboxError};

/// Not exposed by the libc crate on all supported targets.
pub const CLONE_NEWTIME: u64 = 0x0000_0080;
/// Reset all signal dispositions in the child (Linux 5.5+).
const CLONE_CLEAR_SIGHAND: u64 = 0x1_0000_0000;

const CSIGNAL: i32 = 0xff;

/// clone_args from linux/sched.h
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

fn clone3(flags: u64, exit_signal: i32) -> libc::c_long {
    let args = CloneArgs {
        flags,
        exit_signal: exit_signal as u64,
        ..Default::default()
    };
    unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &args as *const CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    }
}

/// Render a clone flag set for logs.
pub fn clone_flags_to_str(flags: u64) -> String {
    const KNOWN: &[(u64, &str)] = &[
        (CLONE_NEWTIME, "CLONE_NEWTIME"),
        (libc::CLONE_VM as u64, "CLONE_VM"),
        (libc::CLONE_FS as u64, "CLONE_FS"),
        (libc::CLONE_FILES as u64, "CLONE_FILES"),
        (libc::CLONE_SIGHAND as u64, "CLONE_SIGHAND"),
        (libc::CLONE_PIDFD as u64, "CLONE_PIDFD"),
        (libc::CLONE_PTRACE as u64, "CLONE_PTRACE"),
        (libc::CLONE_VFORK as u64, "CLONE_VFORK"),
        (libc::CLONE_PARENT as u64, "CLONE_PARENT"),
        (libc::CLONE_THREAD as u64, "CLONE_THREAD"),
        (libc::CLONE_NEWNS as u64, "CLONE_NEWNS"),
        (libc::CLONE_SYSVSEM as u64, "CLONE_SYSVSEM"),
        (libc::CLONE_SETTLS as u64, "CLONE_SETTLS"),
        (libc::CLONE_PARENT_SETTID as u64, "CLONE_PARENT_SETTID"),
        (libc::CLONE_CHILD_CLEARTID as u64, "CLONE_CHILD_CLEARTID"),
        (libc::CLONE_DETACHED as u64, "CLONE_DETACHED"),
        (libc::CLONE_UNTRACED as u64, "CLONE_UNTRACED"),
        (libc::CLONE_CHILD_SETTID as u64, "CLONE_CHILD_SETTID"),
        (libc::CLONE_NEWCGROUP as u64, "CLONE_NEWCGROUP"),
        (libc::CLONE_NEWUTS as u64, "CLONE_NEWUTS"),
        (libc::CLONE_NEWIPC as u64, "CLONE_NEWIPC"),
        (libc::CLONE_NEWUSER as u64, "CLONE_NEWUSER"),
        (libc::CLONE_NEWPID as u64, "CLONE_NEWPID"),
        (libc::CLONE_NEWNET as u64, "CLONE_NEWNET"),
        (libc::CLONE_IO as u64, "CLONE_IO"),
        (CLONE_CLEAR_SIGHAND, "CLONE_CLEAR_SIGHAND"),
    ];

    let mut names: Vec<&str> = Vec::new();
    let mut known_mask = 0u64;
    for &(flag, name) in KNOWN {
        known_mask |= flag;
        if flags & flag != 0 {
            names.push(name);
        }
    }

    let mut out = names.join("|");
    let unknown = flags & !known_mask;
    if unknown != 0 {
        if !out.is_empty() {
            out.push('|');
        }
        out.push_str(&format!("{:#x}", unknown));
    }
    out
}

/// Create a new process running `child_fn` under the requested namespace
/// flags. Returns the child's PID in the parent; `child_fn` never returns.
pub fn spawn_process<F>(flags: u64, exit_signal: i32, child_fn: F) -> Result<Pid>
where
    F: FnOnce() -> !,
{
    if flags & libc::CLONE_VM as u64 != 0 {
        return Err(SandboxError::ConfigInvalid(
            "CLONE_VM is not supported: the child must own its address space".to_string(),
        ));
    }
    let exit_signal = exit_signal & CSIGNAL;

    let ret = clone3(flags | CLONE_CLEAR_SIGHAND, exit_signal);
    if ret == 0 {
        child_fn();
    }
    if ret > 0 {
        return Ok(Pid::from_raw(ret as libc::pid_t));
    }

    // CLONE_CLEAR_SIGHAND needs Linux 5.5 while clone3 itself appeared in
    // 5.3; retry without it before giving up on clone3.
    let ret = clone3(flags, exit_signal);
    if ret == 0 {
        child_fn();
    }
    if ret > 0 {
        return Ok(Pid::from_raw(ret as libc::pid_t));
    }
    let errno = Errno::last();
    if errno != Errno::ENOSYS {
        return Err(SandboxError::KernelRefused(format!(
            "clone3(flags={}): {}",
            clone_flags_to_str(flags),
            errno
        )));
    }

    if flags & CLONE_NEWTIME != 0 {
        return Err(SandboxError::ConfigInvalid(
            "CLONE_NEWTIME was requested but clone3 is not supported".to_string(),
        ));
    }

    #[cfg(feature = "legacy-clone")]
    {
        warn!("clone3 unavailable, falling back to clone(2)");
        legacy::clone_on_static_stack(flags, exit_signal, child_fn)
    }
    #[cfg(not(feature = "legacy-clone"))]
    {
        Err(SandboxError::KernelRefused(
            "clone3 is not supported and the legacy clone fallback is disabled".to_string(),
        ))
    }
}

#[cfg(feature = "legacy-clone")]
mod legacy {
    //! clone(2) fallback on a static stack.
    //!
    //! Single-entry invariant: the single-threaded supervisor performs one
    //! clone at a time, so the stack buffer is reused but never shared.

    use super::*;

    const STACK_SIZE: usize = 128 * 1024;

    #[repr(align(64))]
    struct CloneStack([u8; STACK_SIZE]);

    static mut CLONE_STACK: CloneStack = CloneStack([0; STACK_SIZE]);

    extern "C" fn trampoline<F>(arg: *mut libc::c_void) -> libc::c_int
    where
        F: FnOnce() -> !,
    {
        let payload = unsafe { &mut *(arg as *mut Option<F>) };
        if let Some(child_fn) = payload.take() {
            child_fn();
        }
        unsafe { libc::_exit(126) }
    }

    pub(super) fn clone_on_static_stack<F>(
        flags: u64,
        exit_signal: i32,
        child_fn: F,
    ) -> Result<Pid>
    where
        F: FnOnce() -> !,
    {
        debug!("cloning process with flags:{}", clone_flags_to_str(flags));

        let mut payload: Option<F> = Some(child_fn);
        // Hand the child the middle of the buffer so the stack growth
        // direction of the architecture does not matter.
        let stack = unsafe {
            (*std::ptr::addr_of_mut!(CLONE_STACK))
                .0
                .as_mut_ptr()
                .add(STACK_SIZE / 2)
        };
        let ret = unsafe {
            libc::clone(
                trampoline::<F>,
                stack as *mut libc::c_void,
                flags as libc::c_int | exit_signal,
                &mut payload as *mut Option<F> as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(SandboxError::KernelRefused(format!(
                "clone(flags={}): {}",
                clone_flags_to_str(flags),
                Errno::last()
            )));
        }
        Ok(Pid::from_raw(ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn rejects_clone_vm() {
        let err = spawn_process(libc::CLONE_VM as u64, libc::SIGCHLD, || unsafe {
            libc::_exit(0)
        })
        .unwrap_err();
        assert!(matches!(err, SandboxError::ConfigInvalid(_)));
    }

    #[test]
    fn spawns_child_without_namespaces() {
        let _guard = serial_guard();
        let pid = spawn_process(0, libc::SIGCHLD, || unsafe { libc::_exit(42) }).unwrap();
        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(reaped, code) => {
                assert_eq!(reaped, pid);
                assert_eq!(code, 42);
            }
            other => panic!("unexpected wait status: {:?}", other),
        }
    }

    #[test]
    fn formats_flag_sets() {
        assert_eq!(clone_flags_to_str(0), "");
        assert_eq!(
            clone_flags_to_str(libc::CLONE_NEWPID as u64),
            "CLONE_NEWPID"
        );
        let both = libc::CLONE_NEWPID as u64 | libc::CLONE_NEWNET as u64;
        let rendered = clone_flags_to_str(both);
        assert!(rendered.contains("CLONE_NEWPID"));
        assert!(rendered.contains("CLONE_NEWNET"));
        assert!(rendered.contains('|'));
    }

    #[test]
    fn formats_unknown_bits_as_hex() {
        let rendered = clone_flags_to_str(1 << 60);
        assert!(rendered.contains("0x1000000000000000"));
    }
}
