use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use threadlink_channels::{
    DiscordServer, EventBus, HealthMonitor, HttpAttachmentFetcher, MessengerClient,
};
use threadlink_core::{AttachmentFetcher, BridgeEvent, Router};
use threadlink_store::SqliteMappingStore;
use tokio::signal;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;

use admin::FlagChange;
use config::ThreadlinkConfig;

/// Inbound events buffered between the adapters and the router
const EVENT_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "threadlink")]
#[command(version)]
#[command(about = "Threadlink, a Messenger to Discord bridge")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge daemon
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// List thread to channel bindings
    Bindings,

    /// Resume relaying a bridged channel, or allow one user in it
    Allow {
        /// Discord channel id of the binding
        channel_id: String,
        /// Add this Messenger or Discord user id to the channel's allow list.
        /// Both networks share the list: once it has entries, everyone else
        /// on either side is no longer relayed.
        #[arg(long)]
        user: Option<String>,
    },

    /// Stop relaying a bridged channel, or deny one user in it
    Block {
        /// Discord channel id of the binding
        channel_id: String,
        /// Add this Messenger or Discord user id to the channel's deny list
        /// (shared by both networks)
        #[arg(long)]
        user: Option<String>,
    },

    /// Turn the global relay override on or off
    Global {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Import bindings and thread names from a legacy database
    Migrate {
        /// Path to the old SQLite file
        legacy_db: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --debug
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Bindings => cmd_bindings(&cli.config).await,
        Commands::Allow { channel_id, user } => {
            cmd_flags(&cli.config, &channel_id, FlagChange::new(true, user)).await
        }
        Commands::Block { channel_id, user } => {
            cmd_flags(&cli.config, &channel_id, FlagChange::new(false, user)).await
        }
        Commands::Global { state } => cmd_global(&cli.config, matches!(state, Toggle::On)),
        Commands::Migrate { legacy_db } => cmd_migrate(&cli.config, &legacy_db).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("threadlink initialized at {}", config_dir.display());
    println!(
        "Edit {} to set the Discord guild, admin and gateway details.",
        config_path.display()
    );
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ThreadlinkConfig::load(config_path)?;
    println!("{:#?}", cfg);
    Ok(())
}

fn open_store(cfg: &ThreadlinkConfig) -> Result<Arc<SqliteMappingStore>> {
    let db_path = config::expand_home(&cfg.store.db_path);
    let store = SqliteMappingStore::open(&db_path, cfg.store.cache_capacity)
        .with_context(|| format!("Failed to open mapping store at {}", db_path.display()))?;
    Ok(Arc::new(store))
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ThreadlinkConfig::load(config_path)?;
    cfg.validate()?;
    info!("Starting threadlink daemon...");

    let cancel = CancellationToken::new();
    let store = open_store(&cfg)?;
    let settings = Arc::new(cfg.bridge_settings());

    let fetcher: Arc<dyn AttachmentFetcher> = Arc::new(
        HttpAttachmentFetcher::new(settings.network_timeout)
            .context("Failed to initialize attachment fetcher")?,
    );

    let discord = Arc::new(
        DiscordServer::new(cfg.discord.token.clone(), &cfg.discord.guild_id)?
            .with_presence(cfg.discord.presence.clone())
            .with_cancel(cancel.clone()),
    );

    let messenger = Arc::new(
        MessengerClient::new(
            &cfg.messenger.base_url,
            cfg.messenger.token.clone(),
            cfg.app_state(),
            Duration::from_secs(cfg.messenger.poll_interval_secs.max(1)),
            settings.network_timeout,
        )?
        .with_cancel(cancel.clone()),
    );

    let router = Arc::new(Router::new(
        store,
        discord.clone(),
        messenger.clone(),
        fetcher,
        settings.clone(),
    ));
    info!(
        "Bridge '{}' routing into category '{}' (global relay {})",
        settings.bridge_name,
        settings.category_name,
        if settings.global_relay() { "on" } else { "off" }
    );

    let mut bus = EventBus::new(EVENT_BUFFER);
    bus.register(discord);
    bus.register(messenger.clone());
    bus.start_all().await?;
    info!("All event sources started");

    let health = HealthMonitor::new(
        Duration::from_secs(cfg.messenger.health_interval_secs.max(1)),
        cancel.clone(),
    )
    .spawn(messenger);

    #[cfg(unix)]
    let reload = spawn_reload_on_hangup(config_path.clone(), router.clone(), cancel.clone());

    println!("threadlink is running. Press Ctrl+C to stop.");

    let main_loop = tokio::spawn(run_event_loop(
        router,
        bus.into_receiver(),
        cancel.clone(),
        Duration::from_secs(cfg.bridge.housekeeping_interval_secs.max(1)),
        cfg.bridge.max_concurrent_events,
    ));

    // Wait for shutdown signal or a fatal adapter failure
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
        _ = cancel.cancelled() => error!("An adapter failed permanently, shutting down..."),
    }
    cancel.cancel();

    let _ = main_loop.await;
    let _ = health.await;
    #[cfg(unix)]
    let _ = reload.await;

    println!("threadlink stopped.");
    Ok(())
}

/// Dispatch events concurrently until cancelled, then drain in-flight work
async fn run_event_loop(
    router: Arc<Router>,
    mut incoming_rx: mpsc::Receiver<BridgeEvent>,
    cancel: CancellationToken,
    housekeeping_every: Duration,
    max_concurrent: usize,
) {
    // Semaphore to limit concurrent event processing
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut join_set = JoinSet::new();
    let mut housekeeping = tokio::time::interval(housekeeping_every);
    housekeeping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Event loop shutting down");
                break;
            }
            event = incoming_rx.recv() => {
                let Some(event) = event else {
                    info!("Event bus closed");
                    break;
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let router = router.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    router.dispatch(event).await;
                });
            }
            _ = housekeeping.tick() => {
                router.housekeeping();
            }
            Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                if let Err(e) = joined {
                    error!("Event task failed: {}", e);
                }
            }
        }
    }

    // Drain remaining tasks for graceful shutdown
    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!("Event task failed during shutdown: {}", e);
        }
    }
}

/// Re-read the config on SIGHUP and apply the global relay flag
#[cfg(unix)]
fn spawn_reload_on_hangup(
    config_path: Option<PathBuf>,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot listen for SIGHUP, config reload disabled: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = hangup.recv() => match ThreadlinkConfig::load(&config_path) {
                    Ok(cfg) => {
                        router.set_global_relay(cfg.bridge.global_relay);
                        info!("Configuration reloaded");
                    }
                    Err(e) => warn!("Config reload failed, keeping current settings: {:#}", e),
                },
            }
        }
    })
}

async fn cmd_bindings(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ThreadlinkConfig::load(config_path)?;
    let store = open_store(&cfg)?;
    let rows = admin::binding_rows(store.as_ref()).await?;
    print!("{}", admin::render_table(&rows));
    if !rows.is_empty() {
        println!("\n{} binding(s)", rows.len());
    }
    if cfg.bridge.global_relay {
        println!("Global relay is ON: per-channel flags are currently overridden.");
    }
    Ok(())
}

async fn cmd_flags(config_path: &Option<PathBuf>, channel_id: &str, change: FlagChange) -> Result<()> {
    let cfg = ThreadlinkConfig::load(config_path)?;
    let store = open_store(&cfg)?;
    let flags = admin::change_flags(store.as_ref(), channel_id, &change).await?;
    info!("Channel {} {}", channel_id, change);
    println!("Channel {}: {}", channel_id, admin::describe_flags(&flags));
    if matches!(change, FlagChange::AllowUser(_)) {
        if let Some(notice) = admin::allow_list_notice(&flags) {
            warn!("{}", notice);
        }
    }
    Ok(())
}

fn cmd_global(config_path: &Option<PathBuf>, enabled: bool) -> Result<()> {
    let path = config::config_path(config_path);
    config::write_global_relay(&path, enabled)?;
    println!(
        "Global relay {} in {}.",
        if enabled { "enabled" } else { "disabled" },
        path.display()
    );
    println!("Send SIGHUP to a running daemon to apply it without restarting.");
    Ok(())
}

async fn cmd_migrate(config_path: &Option<PathBuf>, legacy_db: &Path) -> Result<()> {
    let cfg = ThreadlinkConfig::load(config_path)?;
    let store = open_store(&cfg)?;
    let report = store
        .import_legacy(legacy_db)
        .await
        .with_context(|| format!("Failed to import {}", legacy_db.display()))?;
    println!(
        "Imported {} binding(s) ({} skipped) and {} thread name(s) from {}",
        report.bindings_imported,
        report.bindings_skipped,
        report.names_imported,
        legacy_db.display()
    );
    Ok(())
}
