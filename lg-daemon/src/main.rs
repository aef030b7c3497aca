//! legion daemon (legiond)
//!
//! Privileged service exposing the Legion platform driver, the embedded
//! controller, WMI methods and the RAPL MMIO power limits to unprivileged
//! clients over two Unix domain sockets.
//!
//! # Security Model
//! - **Privilege**: Runs as root for /dev/port, /proc/acpi/call and MMIO access
//! - **Sockets**: World-accessible (0666), one client per socket, binary protocol
//! - **Audit**: Peer credentials logged on accept; every hardware write logged
//! - **Isolation**: Restrictive umask, working directory set to /
//!
//! # Hardening Measures
//! - Environment sanitization (clear dangerous env vars)
//! - Resource limits (RLIMIT_CORE, RLIMIT_NOFILE)
//! - Symlink attack prevention on socket creation
//! - PID file guarding against a second instance

mod reactor;

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context as _};
use lg_core::constants::{ipc, logging, paths};
use lg_core::{Context, DaemonConfig};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Security Hardening
// ============================================================================

/// Sanitize the process environment by removing dangerous variables
fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "LD_DEBUG",
        "LD_PROFILE",
        "MALLOC_CHECK_",
        "HOSTALIASES",
        "LOCALDOMAIN",
        "RES_OPTIONS",
        "TMPDIR",
        "IFS",
    ];

    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }

    // modprobe is looked up through PATH
    std::env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
    std::env::set_var("LC_ALL", "C");
    std::env::set_var("LANG", "C");
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: limit is a fully initialized rlimit and resource is one of the RLIMIT_* constants.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        eprintln!("Failed to set rlimit {}: {}", resource, std::io::Error::last_os_error());
    }
}

/// No core dumps (MMIO mappings and EC state must not leak to disk)
fn set_resource_limits() {
    set_rlimit(libc::RLIMIT_CORE, 0);
    set_rlimit(libc::RLIMIT_NOFILE, 256);
}

fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask of this process.
    unsafe { libc::umask(ipc::UMASK as libc::mode_t) };
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        eprintln!("Could not chdir to /");
    }
}

fn verify_privileges() -> anyhow::Result<()> {
    // SAFETY: geteuid and getuid have no preconditions.
    let euid = unsafe { libc::geteuid() };
    // SAFETY: as above.
    let uid = unsafe { libc::getuid() };

    if euid != 0 {
        bail!("legiond must run as root (euid=0) for hardware access");
    }
    if uid != 0 {
        warn!("Running as setuid root - this is not recommended");
    }
    info!("Running as root (uid={}, euid={})", uid, euid);
    Ok(())
}

// ============================================================================
// PID File Management
// ============================================================================

/// Write the PID file, refusing to start when another instance is alive
fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Ok(content) = std::fs::read_to_string(path) {
        if let Ok(old_pid) = content.trim().parse::<i32>() {
            // SAFETY: signal 0 only checks that the process exists.
            if old_pid > 0 && unsafe { libc::kill(old_pid, 0) } == 0 {
                bail!("another instance is running (PID {})", old_pid);
            }
        }
        debug!("Removing stale PID file {}", path.display());
        std::fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path.display());
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to remove PID file {}: {}", path.display(), e);
    }
}

// ============================================================================
// Kernel Modules
// ============================================================================

fn load_modules(modules: &[String]) {
    for module in modules {
        match Command::new(paths::MODPROBE).arg(module).output() {
            Ok(output) if output.status.success() => info!("Loaded kernel module {}", module),
            Ok(output) => warn!(
                "modprobe {} failed: {}",
                module,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Could not run {}: {}", paths::MODPROBE, e),
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
    notify_socket: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Run(Options),
    Help,
    Version,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Invocation, String> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .map(PathBuf::from)
                .ok_or_else(|| format!("{} requires a path argument", flag))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-v" | "--version" => return Ok(Invocation::Version),
            // always in the foreground; kept for service files
            "-f" | "--foreground" => {}
            "-c" | "--config" => options.config = Some(value("--config")?),
            "-s" | "--socket" => options.socket = Some(value("--socket")?),
            "-n" | "--notify-socket" => options.notify_socket = Some(value("--notify-socket")?),
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(Invocation::Run(options))
}

fn print_help() {
    eprintln!("legiond {} - Legion laptop hardware daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    legiond [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH          Configuration file (default {})", paths::CONFIG_FILE);
    eprintln!("    -s, --socket PATH          Request socket (default {})", paths::REQUEST_SOCKET);
    eprintln!("    -n, --notify-socket PATH   Notification socket (default {})", paths::NOTIFY_SOCKET);
    eprintln!("    -f, --foreground           Run in foreground (always on)");
    eprintln!("    -v, --version              Print version");
    eprintln!("    -h, --help                 Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}                Log filter (trace, debug, info, warn, error)", logging::DAEMON_ENV);
}

// ============================================================================
// Logging
// ============================================================================

/// journald when it is running, stdout otherwise
fn init_logging() -> &'static str {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = || {
        EnvFilter::try_from_env(logging::DAEMON_ENV).unwrap_or_else(|_| EnvFilter::new(logging::DAEMON_DEFAULT))
    };

    if Path::new(paths::JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(layer.with_syslog_identifier(logging::SYSLOG_IDENTIFIER.to_string()))
                    .with(filter())
                    .init();
                return "systemd journal";
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter())
        .init();
    "stdout"
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn load_config(options: Options) -> anyhow::Result<DaemonConfig> {
    let path = options.config.unwrap_or_else(|| PathBuf::from(paths::CONFIG_FILE));
    let mut config = DaemonConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;

    if let Some(socket) = options.socket {
        config.request_socket = socket;
    }
    if let Some(socket) = options.notify_socket {
        config.notify_socket = socket;
    }
    if config.request_socket == config.notify_socket {
        bail!("request and notification sockets must differ");
    }
    Ok(config)
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    load_modules(&config.load_modules);

    let mut ctx = Context::from_config(config)?;
    ctx.init();
    for name in ctx.manager().names() {
        debug!("Driver {}: {}", name, if ctx.manager().is_available(name) { "available" } else { "absent" });
    }
    ctx.apply_startup_limits().context("applying RAPL startup limits")?;

    reactor::Reactor::new(ctx)?.run().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // These must happen before ANY other code runs
    sanitize_environment();
    set_secure_umask();
    set_resource_limits();
    secure_working_directory();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Run(options)) => options,
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("legiond {}", VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let sink = init_logging();
    info!("STARTUP: legiond {} starting", VERSION);
    info!("STARTUP: Logging to {}", sink);

    verify_privileges()?;
    let config = load_config(options)?;

    let pid_file = Path::new(paths::PID_FILE);
    write_pid_file(pid_file)?;
    info!("STARTUP: PID: {}", std::process::id());

    let result = serve(config).await;
    remove_pid_file(pid_file);

    match &result {
        Ok(()) => info!("SHUTDOWN: legiond terminated gracefully"),
        Err(e) => error!("{:#}", e),
    }
    result
}
