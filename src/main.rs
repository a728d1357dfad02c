use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use usergate::auth::AuthGate;
use usergate::config::Config;
use usergate::healthcheck::HealthSweeper;
use usergate::process::InstanceManager;
use usergate::proxy::{GatewayContext, ProxyServer, PKG_NAME, VERSION};
use usergate::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("usergate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Load the registry mirror; surviving workers are re-validated by probe
    let registry = Registry::open(&config.server.registry_path);
    let manager = InstanceManager::new(registry, config.worker.clone());

    let auth = AuthGate::new(config.auth.clone());
    let ctx = GatewayContext::new(Arc::clone(&manager), auth, &config.server);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Spawn the health sweeper
    let sweeper = HealthSweeper::new(
        Arc::clone(&manager),
        config.worker.sweep_interval(),
        shutdown_rx.clone(),
    );
    tokio::spawn(sweeper.run());

    // Spawn the gateway server; a bind failure surfaces through the handle
    // and is the one fatal startup condition
    let server = ProxyServer::new(bind_addr, ctx, shutdown_rx.clone());
    let mut server_handle = tokio::spawn(server.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or an early server exit
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = &mut server_handle => {
                manager.shutdown_all();
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
                };
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut server_handle => {
                manager.shutdown_all();
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
                };
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Kill every tracked worker before exiting so no orphan holds a port
    info!("Terminating all workers...");
    manager.shutdown_all();

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), &mut server_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        route_prefix = %config.server.route_prefix,
        registry = %config.server.registry_path,
        "Server configuration"
    );
    info!(
        command = %config.worker.command,
        port_min = config.worker.port_min,
        port_max = config.worker.port_max,
        startup_timeout_secs = config.worker.startup_timeout_secs,
        shutdown_grace_period_secs = config.worker.shutdown_grace_period_secs,
        "Worker configuration"
    );
    info!(
        probe_timeout_secs = config.worker.probe_timeout_secs,
        sweep_interval_secs = config.worker.sweep_interval_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Health and timeout settings"
    );
}
