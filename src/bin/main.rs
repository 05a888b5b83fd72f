//! nsbox launcher CLI

use clap::Parser;
use log::{info, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nsbox::{NamespaceSet, RunMode, SandboxConfig, Stdio, Supervisor};
use nsbox_core::utils::parse_memory_size;
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nsbox")]
#[command(about = "Launch a program inside namespaces with cgroup resource caps", long_about = None)]
struct Cli {
    /// Memory cap (e.g. 100M, 1G)
    #[arg(long)]
    mem_max: Option<String>,

    /// Combined memory+swap cap (e.g. 150M)
    #[arg(long)]
    mem_memsw_max: Option<String>,

    /// Swap cap (e.g. 0, 50M)
    #[arg(long)]
    mem_swap_max: Option<String>,

    /// Maximum number of tasks in the sandbox
    #[arg(long)]
    pids_max: Option<u64>,

    /// CPU quota in milliseconds per wall-clock second
    #[arg(long)]
    cpu_ms_per_sec: Option<u32>,

    /// Wall-clock limit in seconds (0 = unlimited)
    #[arg(short = 't', long, default_value_t = 0)]
    time_limit: u64,

    /// RLIMIT_CPU in seconds
    #[arg(long)]
    rlimit_cpu: Option<u64>,

    /// cgroup v2 mount point
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_mount: PathBuf,

    /// unshare and exec in place instead of supervising a child
    #[arg(long)]
    execve: bool,

    /// Pre-open the program and exec it through the descriptor
    #[arg(long)]
    execveat: bool,

    /// Keep the caller environment
    #[arg(long)]
    keep_env: bool,

    /// Environment entry for the child (KEY=VALUE, repeatable)
    #[arg(short = 'E', long = "env")]
    envs: Vec<String>,

    /// Do not create any namespaces (cgroup limits still apply)
    #[arg(long)]
    no_namespaces: bool,

    /// Program to run
    program: PathBuf,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_shutdown_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_term_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        if let Err(err) = unsafe { sigaction(sig, &action) } {
            warn!("sigaction({}) failed: {}", sig, err);
        }
    }
}

fn build_config(cli: &Cli) -> Result<SandboxConfig, Box<dyn std::error::Error>> {
    let mut builder = SandboxConfig::builder(&cli.program)
        .arg(cli.program.display().to_string())
        .args(cli.args.iter().cloned())
        .time_limit(cli.time_limit)
        .cgroup_mount(&cli.cgroup_mount)
        .keep_env(cli.keep_env);

    if let Some(ref size) = cli.mem_max {
        builder = builder.mem_max(parse_memory_size(size)?);
    }
    if let Some(ref size) = cli.mem_memsw_max {
        builder = builder.mem_memsw_max(parse_memory_size(size)?);
    }
    if let Some(ref size) = cli.mem_swap_max {
        builder = builder.mem_swap_max(parse_memory_size(size)? as i64);
    }
    if let Some(pids) = cli.pids_max {
        builder = builder.pids_max(pids);
    }
    if let Some(ms) = cli.cpu_ms_per_sec {
        builder = builder.cpu_ms_per_sec(ms);
    }
    if let Some(secs) = cli.rlimit_cpu {
        builder = builder.rlimit_cpu(secs);
    }
    if cli.execve {
        builder = builder.mode(RunMode::Execve);
    }
    if cli.execveat {
        // Deliberately left open until the exec consumes it.
        let exe = std::fs::File::open(&cli.program)?;
        builder = builder.exec_fd(exe.into_raw_fd());
    }
    if cli.no_namespaces {
        builder = builder.namespaces(NamespaceSet::none());
    }
    for env in &cli.envs {
        builder = builder.env(env.clone());
    }

    Ok(builder.build()?)
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let cfg = build_config(&cli)?;
    let mut supervisor = Supervisor::new(cfg)?;
    supervisor.setup()?;
    install_shutdown_handler();

    let Some(pid) = supervisor.spawn(Stdio::inherit(), None)? else {
        return Err("spawn was declined".into());
    };
    info!("supervising pid={}", pid);

    let mut last_rv = 0;
    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            warn!("shutdown requested, killing all children");
            supervisor.kill_all(Signal::SIGKILL);
            return Ok(128 + libc::SIGTERM);
        }

        let before = supervisor.count();
        let rv = supervisor.reap();
        if supervisor.count() < before {
            last_rv = rv;
        }
        if supervisor.count() == 0 {
            return Ok(last_rv);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}
