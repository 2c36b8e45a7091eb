//! FanTuner Daemon (fantunerd)
//!
//! A privileged background service for desktop fan control. Polls sensors,
//! applies temperature-to-speed curves, enforces thermal safety invariants,
//! and serves a local Unix-socket IPC endpoint so a GUI/CLI collaborator
//! can observe state and reconfigure policy.
//!
//! # Security model
//! - Runs as root for `/sys` hardware access (skipped entirely under
//!   `--mock`, which touches no hardware).
//! - Socket: Unix domain socket with owner-only permissions (0600).
//! - Authentication: OS-level access control on the socket only — no
//!   additional client authentication, per this service's non-goals.

mod cancellation;
mod control_loop;
mod dto;
mod server;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cancellation::CancellationToken;
use fantuner_core::{ConfigStore, MockAdapter, RealAdapter, SafetySupervisor};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn get_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/fantuner.sock"
    } else {
        "/var/run/fantuner.sock"
    }
}

fn get_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/fantuner/config.json")
}

fn get_pid_file_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/fantunerd.pid"
    } else {
        "/var/run/fantunerd.pid"
    }
}

fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] =
        &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "LD_DEBUG", "LD_PROFILE", "TMPDIR", "IFS", "PATH"];
    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
    debug!("environment sanitized");
}

fn set_resource_limits() {
    set_rlimit(libc::RLIMIT_CORE as i32, 0, 0);
    set_rlimit(libc::RLIMIT_NOFILE as i32, 1024, 1024);
    debug!("resource limits applied");
}

fn set_rlimit(resource: i32, soft: u64, hard: u64) {
    let limit = libc::rlimit { rlim_cur: soft as libc::rlim_t, rlim_max: hard as libc::rlim_t };
    // SAFETY: setrlimit is safe given a known RLIMIT_* constant and an initialized rlimit struct.
    unsafe {
        #[allow(clippy::useless_conversion)]
        if libc::setrlimit(resource as libc::__rlimit_resource_t, &limit) != 0 {
            warn!("failed to set rlimit for resource {}", resource);
        }
    }
}

fn set_secure_umask() {
    // SAFETY: umask always succeeds; it only sets the file-creation mask for this process.
    unsafe { libc::umask(0o077) };
    debug!("umask set to 0077");
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("could not chdir to /");
    }
}

fn verify_privileges(mock: bool) -> Result<(), &'static str> {
    // SAFETY: geteuid is always safe; it just returns the process's effective user id.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 && !mock {
        return Err("daemon must run as root (euid=0) for hardware access; pass --mock to skip");
    }
    info!("running as euid={}{}", euid, if mock { " (mock mode)" } else { "" });
    Ok(())
}

fn write_pid_file() -> std::io::Result<()> {
    use std::io::Write;
    let path = get_pid_file_path();
    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only probes for process existence, it sends nothing.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance is running (pid {old_pid})"),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(())
}

fn cleanup(socket_path: &str) {
    if Path::new(socket_path).exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("failed to remove socket: {e}");
        }
    }
    let pid_file = get_pid_file_path();
    if Path::new(pid_file).exists() {
        let _ = std::fs::remove_file(pid_file);
    }
}

fn print_help() {
    eprintln!("fantunerd {VERSION} - FanTuner fan-control daemon");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fantunerd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    --mock          Use the mock hardware adapter instead of real hwmon sysfs");
    eprintln!("    -v, --version   Print version");
    eprintln!("    -h, --help      Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FANTUNER_LOG    Log level (trace, debug, info, warn, error)");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        eprintln!("PANIC at {}: {}", location.unwrap_or_else(|| "unknown".to_string()), info);
    }));

    sanitize_environment();
    set_secure_umask();
    set_resource_limits();
    secure_working_directory();

    let mut mock = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("fantunerd {VERSION}");
                return Ok(());
            }
            "--mock" => mock = true,
            other => {
                eprintln!("unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
    }

    let log_level = std::env::var("FANTUNER_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry().with(layer).with(tracing_subscriber::EnvFilter::new(&log_level)).init();
            }
            Err(e) => {
                eprintln!("failed to create journald layer: {e}, falling back to stdout");
                tracing_subscriber::fmt().with_target(false).with_env_filter(log_level.clone()).init();
            }
        }
    } else {
        tracing_subscriber::fmt().with_target(false).with_env_filter(log_level.clone()).init();
    }

    info!("fantunerd {VERSION} starting{}", if mock { " (mock mode)" } else { "" });

    if let Err(e) = verify_privileges(mock) {
        error!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = write_pid_file() {
        error!("could not write pid file: {e}");
        std::process::exit(1);
    }

    let socket_path = get_socket_path().to_string();
    let config_path = get_config_path();

    let config_store = Arc::new(ConfigStore::load(&config_path)?);
    let safety = Arc::new(SafetySupervisor::new(&config_store.current()));

    let adapter: Arc<dyn fantuner_core::HardwareAdapter> =
        if mock { Arc::new(MockAdapter::new()) } else { Arc::new(RealAdapter::new()) };
    adapter.initialize()?;

    let cancel = Arc::new(CancellationToken::new());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            cancel.cancel();
        });
    }

    let shared = Arc::new(control_loop::SharedState::new(config_store, safety, adapter.clone()));

    let loop_shared = shared.clone();
    let loop_cancel = cancel.clone();
    let control_handle = tokio::spawn(async move { control_loop::run(loop_shared, loop_cancel).await });

    // The listener is closed before the adapter is released, so no inbound
    // mutation can race the final `set_all_auto`.
    let server_result = server::run(&socket_path, shared.clone(), cancel.clone()).await;

    cancel.cancel();
    let _ = control_handle.await;

    info!("reverting all fans to automatic control");
    adapter.set_all_auto();

    cleanup(&socket_path);

    if let Err(e) = server_result {
        error!("server error: {e}");
        std::process::exit(1);
    }

    info!("fantunerd stopped");
    Ok(())
}
