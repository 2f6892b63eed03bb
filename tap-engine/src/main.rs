//! Therapeutic Ambient Player engine (tap-engine) - entry point
//!
//! Runs a session headless: loads the session file, drives the timeline
//! against the in-memory output and logs every engine event. Also validates
//! session files without running them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tap_common::config::{ensure_directory, resolve_config_path, resolve_media_root, TomlConfig};
use tap_engine::playback::{FileResourceLoader, LoggingOutput, SimulatedLoader};
use tap_engine::ports::{ActivityFlag, PhaseStore, ResourceLoader, SystemClock};
use tap_engine::store::JsonFileStore;
use tap_engine::timeline::PhaseRegistry;
use tap_engine::{EnginePorts, EngineSettings, TimelineEngine};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tap-engine
#[derive(Parser, Debug)]
#[command(name = "tap-engine")]
#[command(about = "Timeline-driven multi-layer crossfade engine")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, global = true, env = "TAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a session until it ends or Ctrl+C
    Run {
        /// Session snapshot (phases and durations)
        #[arg(short, long)]
        session: Option<PathBuf>,

        /// Folder track ids resolve against
        #[arg(short, long, env = "TAP_MEDIA_ROOT")]
        media_root: Option<PathBuf>,

        /// Skip disk I/O, pretend every track loads in this many ms
        #[arg(long)]
        simulate_load_ms: Option<u64>,

        /// Write the final session snapshot here on exit
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Check a session file and print its phases
    Validate {
        #[arg(short, long)]
        session: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load_or_default(args.config.as_deref());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tap_engine={}", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = resolve_config_path(args.config.as_deref()) {
        info!("Config file: {}", path.display());
    }

    match args.command {
        Command::Run {
            session,
            media_root,
            simulate_load_ms,
            save,
        } => run(config, session, media_root, simulate_load_ms, save).await,
        Command::Validate { session } => validate(session).await,
    }
}

async fn run(
    config: TomlConfig,
    session: Option<PathBuf>,
    media_root: Option<PathBuf>,
    simulate_load_ms: Option<u64>,
    save: Option<PathBuf>,
) -> Result<()> {
    let settings = EngineSettings::from_table(config.engine.as_ref())
        .context("Invalid [engine] configuration")?;

    let loader: Arc<dyn ResourceLoader> = match simulate_load_ms {
        Some(ms) => {
            info!("Simulated loads ({}ms per track)", ms);
            Arc::new(SimulatedLoader::new(Duration::from_millis(ms)))
        }
        None => {
            let root = resolve_media_root(media_root.as_deref(), &config);
            ensure_directory(&root).context("Media root unavailable")?;
            info!("Media root: {}", root.display());
            Arc::new(FileResourceLoader::new(root))
        }
    };

    let output = settings.layers.iter().fold(LoggingOutput::new(), |output, layer| {
        output.with_source(&layer.id, layer.track.as_deref(), layer.volume)
    });

    let ports = EnginePorts {
        output: Arc::new(output),
        loader,
        activity: Arc::new(ActivityFlag::new(true)),
        clock: Arc::new(SystemClock::new()),
    };
    let engine = Arc::new(
        TimelineEngine::new(settings, ports).context("Failed to initialize timeline engine")?,
    );

    let session_path = session
        .or(config.session_file)
        .context("No session file given (--session or session_file in config)")?;
    engine
        .load_from(&JsonFileStore::new(&session_path))
        .await
        .with_context(|| format!("Failed to load session {}", session_path.display()))?
        .with_context(|| format!("Session file {} not found", session_path.display()))?;

    let mut events = engine.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(target: "tap_engine::events", "{}: {:?}", event.event_type(), event),
                Err(RecvError::Lagged(n)) => warn!("Event log lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.spawn_loops();
    engine.start(false);
    info!(
        "Session running ({})",
        tap_common::time::format_session_time(engine.session_duration_ms())
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = wait_for_session_end(&engine) => info!("Session complete"),
    }

    engine.shutdown().await;
    if let Some(path) = save {
        engine
            .save_to(&JsonFileStore::new(&path))
            .await
            .with_context(|| format!("Failed to save session to {}", path.display()))?;
    }
    logger.abort();
    Ok(())
}

async fn wait_for_session_end(engine: &TimelineEngine) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        engine.tick();
        if engine.progress_pct() >= 100.0 {
            engine.wait_for_transition().await;
            return;
        }
    }
}

async fn validate(session: PathBuf) -> Result<()> {
    let snapshot = JsonFileStore::new(&session)
        .load()
        .await
        .with_context(|| format!("Failed to read {}", session.display()))?;
    let Some(snapshot) = snapshot else {
        bail!("Session file {} not found", session.display());
    };

    let mut registry = PhaseRegistry::new();
    registry
        .update_phases(snapshot.phases)
        .context("Phase list rejected")?;

    println!(
        "{}: session {}, transitions {}ms, {} phases",
        session.display(),
        tap_common::time::format_session_time(snapshot.session_duration_ms),
        snapshot.transition_duration_ms,
        registry.len()
    );
    for phase in registry.phases() {
        let at_ms = (snapshot.session_duration_ms as f64 * phase.position / 100.0) as u64;
        println!(
            "  {:>6}  {:<9} {}{}{}",
            tap_common::time::format_percent(phase.position),
            tap_common::time::format_session_time(at_ms),
            phase.name,
            if phase.locked { " [entry]" } else { "" },
            if phase.is_label_only() { " (label)" } else { "" },
        );
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
