use relaygate::admin::{AdminServer, ApiState, PKG_NAME, VERSION};
use relaygate::config::Config;
use relaygate::coordinator::RestartCoordinator;
use relaygate::db::Database;
use relaygate::engine::ProcessEngine;
use relaygate::registry::InboundRegistry;
use relaygate::scheduler::RestartScheduler;
use relaygate::supervisor::{EngineSupervisor, PhaseTimeouts};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaygate=debug".parse()?),
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
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let db = Arc::new(Database::open(&config.database.path)?);
    let admin = db.ensure_admin(&config.server.admin_username, &config.server.admin_password)?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        warn!(token = %token, "No admin_token configured, generated one for this run");
        token
    });

    let registry = Arc::new(InboundRegistry::new(db.clone(), config.provisioning.clone()));
    let coordinator = Arc::new(RestartCoordinator::new(
        config.scheduler.min_restart_interval(),
    ));
    let engine = Arc::new(ProcessEngine::from_config(config.engine.clone())?);
    let supervisor = Arc::new(EngineSupervisor::new(
        engine,
        registry.clone(),
        coordinator.clone(),
        PhaseTimeouts::from(&config.engine),
    ));

    // Bring the engine up with whatever is stored; a failure leaves it stopped
    match supervisor.restart(true).await {
        Ok(report) => info!(?report, "Engine started"),
        Err(e) => error!(error = %e, "Initial engine start failed"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(RestartScheduler::new(
        coordinator.clone(),
        supervisor.clone(),
        config.scheduler.interval(),
    ));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(ApiState {
        db,
        registry,
        coordinator: coordinator.clone(),
        supervisor: supervisor.clone(),
        admin_token,
        admin_id: admin.id,
    });
    let admin_server = AdminServer::new(bind_addr, state, shutdown_rx);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Management API error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a re-sync
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, engine restart scheduled");
                    coordinator.mark_dirty();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = scheduler_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("Stopping engine...");
    if let Err(e) = supervisor.stop().await {
        warn!(error = %e, "Engine did not stop cleanly");
    }

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

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting inbound manager");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.path,
        "Management API configuration"
    );
    info!(
        interval_secs = config.scheduler.interval_secs,
        min_restart_interval_secs = config.scheduler.min_restart_interval_secs,
        "Restart scheduling"
    );
    info!(
        command = config.engine.command.as_deref().unwrap_or_default(),
        config_path = %config.engine.config_path,
        start_timeout_secs = config.engine.start_timeout_secs,
        shutdown_grace_period_secs = config.engine.shutdown_grace_period_secs,
        "Engine settings"
    );
    info!(
        enabled = config.provisioning.enabled,
        owner_match = ?config.provisioning.owner_match,
        "Account provisioning"
    );
}
