//! Integration tests for nsbox
//!
//! These tests exercise the spawn/reap lifecycle through the public API
//! without namespace creation, so they run unprivileged. Tests that need
//! root are marked with #[ignore] and can be run with:
//!   sudo cargo test -- --ignored

use nsbox::{NamespaceSet, SandboxConfig, SandboxError, Stdio, Supervisor};
use std::fs;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

fn unprivileged_builder(program: &str) -> nsbox::SandboxBuilder {
    SandboxConfig::builder(program).namespaces(NamespaceSet::none())
}

/// Drive the supervisor until every child is gone, returning the last
/// reaped exit status.
fn drain(supervisor: &mut Supervisor, budget: Duration) -> i32 {
    let deadline = Instant::now() + budget;
    let mut last = 0;
    while supervisor.count() > 0 {
        let before = supervisor.count();
        let rv = supervisor.reap();
        if supervisor.count() < before {
            last = rv;
        }
        assert!(
            Instant::now() < deadline,
            "children were not reaped within {:?}",
            budget
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    last
}

#[test]
fn plain_run_writes_output_and_exits_zero() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let tmp = tempfile::tempdir().unwrap();
    let out_path = tmp.path().join("out");
    let out = fs::File::create(&out_path).unwrap();

    let cfg = unprivileged_builder("/bin/echo")
        .args(["/bin/echo", "hi"])
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.setup().unwrap();

    let pid = supervisor
        .spawn(
            Stdio {
                stdin: 0,
                stdout: out.as_raw_fd(),
                stderr: 2,
            },
            None,
        )
        .unwrap()
        .unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(10));
    assert_eq!(rv, 0);

    let mut content = String::new();
    fs::File::open(&out_path)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "hi\n");

    // No per-child cgroup may remain after the reap.
    assert!(!std::path::Path::new(&format!("/sys/fs/cgroup/NSJAIL.{}", pid)).exists());
}

#[test]
fn exec_through_descriptor_matches_path_exec() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let tmp = tempfile::tempdir().unwrap();
    let out_path = tmp.path().join("out");
    let out = fs::File::create(&out_path).unwrap();
    let exe = fs::File::open("/bin/echo").unwrap();

    let cfg = unprivileged_builder("/bin/echo")
        .args(["/bin/echo", "fd-exec"])
        .exec_fd(exe.as_raw_fd())
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();

    supervisor
        .spawn(
            Stdio {
                stdin: 0,
                stdout: out.as_raw_fd(),
                stderr: 2,
            },
            None,
        )
        .unwrap()
        .unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(10));
    assert_eq!(rv, 0);

    let mut content = String::new();
    fs::File::open(&out_path)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "fd-exec\n");
}

#[test]
fn wall_time_limit_kills_the_child() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = unprivileged_builder("/bin/sleep")
        .args(["/bin/sleep", "60"])
        .time_limit(1)
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();

    let started = Instant::now();
    let rv = drain(&mut supervisor, Duration::from_secs(10));
    assert_eq!(rv, 128 + libc::SIGKILL);
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[test]
fn missing_program_reports_child_abort() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = unprivileged_builder("/nonexistent/program").build().unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();

    let err = supervisor.spawn(Stdio::inherit(), None).unwrap_err();
    assert!(matches!(err, SandboxError::ChildAborted));
    drain(&mut supervisor, Duration::from_secs(10));
}

#[test]
fn environment_reaches_the_child() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let tmp = tempfile::tempdir().unwrap();
    let out_path = tmp.path().join("out");
    let out = fs::File::create(&out_path).unwrap();

    let cfg = unprivileged_builder("/bin/sh")
        .args(["/bin/sh", "-c", "echo \"$NSBOX_MARKER\""])
        .env("NSBOX_MARKER=present")
        .env("PATH=/bin:/usr/bin")
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor
        .spawn(
            Stdio {
                stdin: 0,
                stdout: out.as_raw_fd(),
                stderr: 2,
            },
            None,
        )
        .unwrap()
        .unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(10));
    assert_eq!(rv, 0);

    let mut content = String::new();
    fs::File::open(&out_path)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "present\n");
}

#[test]
fn cpu_rlimit_kills_a_busy_loop() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = unprivileged_builder("/bin/sh")
        .args(["/bin/sh", "-c", "while :; do :; done"])
        .rlimit_cpu(1)
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();

    let started = Instant::now();
    let rv = drain(&mut supervisor, Duration::from_secs(30));
    // Equal soft and hard limits deliver SIGKILL at the hard boundary.
    assert!(rv == 128 + libc::SIGKILL || rv == 128 + libc::SIGXCPU);
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[test]
fn sequential_spawns_reuse_the_supervisor() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = unprivileged_builder("/bin/true").build().unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();

    for _ in 0..3 {
        supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();
        let rv = drain(&mut supervisor, Duration::from_secs(10));
        assert_eq!(rv, 0);
    }
    assert_eq!(supervisor.count(), 0);
}

#[test]
fn helper_exit_mapping() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let args = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    assert_eq!(nsbox::run_helper(&args(&["/bin/true"]), &[]), 0);
    assert_eq!(nsbox::run_helper(&args(&["/bin/false"]), &[]), 1);
    assert_eq!(nsbox::run_helper(&args(&["/no/such/helper"]), &[]), -1);
}

#[test]
fn builder_rejects_inconsistent_caps() {
    let result = SandboxConfig::builder("/bin/true")
        .mem_max(200)
        .mem_memsw_max(100)
        .build();
    assert!(result.is_err());
}

/// Full isolation with cgroup limits; requires root and a delegatable
/// cgroup v2 mount.
#[test]
#[ignore]
fn memory_capped_child_is_oom_killed() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = SandboxConfig::builder("/bin/sh")
        .args([
            "/bin/sh",
            "-c",
            "exec /usr/bin/head -c 10485760 /dev/zero | /usr/bin/tail",
        ])
        .namespaces(NamespaceSet::none())
        .mem_max(1024 * 1024)
        .time_limit(10)
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.setup().unwrap();
    supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(30));
    assert_eq!(rv, 128 + libc::SIGKILL);
    assert_eq!(supervisor.count(), 0);
}

/// Pids cap starves a forker; requires root.
#[test]
#[ignore]
fn pids_cap_limits_task_creation() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = SandboxConfig::builder("/bin/sh")
        .args([
            "/bin/sh",
            "-c",
            "for i in 1 2 3 4 5 6 7 8 9 10; do ( /bin/true ) ; done; exit 0",
        ])
        .namespaces(NamespaceSet::none())
        .pids_max(2)
        .time_limit(10)
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.setup().unwrap();
    supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(30));
    assert_eq!(rv, 0);
}

/// CPU quota throttling; requires root.
#[test]
#[ignore]
fn cpu_quota_throttles_a_busy_loop() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let cfg = SandboxConfig::builder("/bin/sh")
        .args(["/bin/sh", "-c", "while :; do :; done"])
        .namespaces(NamespaceSet::none())
        .cpu_ms_per_sec(100)
        .time_limit(5)
        .build()
        .unwrap();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.setup().unwrap();
    supervisor.spawn(Stdio::inherit(), None).unwrap().unwrap();

    let rv = drain(&mut supervisor, Duration::from_secs(30));
    assert_eq!(rv, 128 + libc::SIGKILL);
}
