use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mirror_relay_channels::telegram::TelegramChannel;
use mirror_relay_channels::{BotAdapter, RelayClient};
use mirror_relay_core::config::Config;
use mirror_relay_gateway::{BridgeClient, BridgeHub, RelayState};
use mirror_relay_host::HostSupervisor;

mod logging;

#[derive(Parser)]
#[command(
    name = "mirror-relay",
    about = "Mirror a desktop app's conversation surface to your phone and relay commands back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to the host and serve the local relay
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,

        /// Do not serve the phone UI
        #[arg(long)]
        no_ui: bool,
    },

    /// Run a public relay fed by inbound bridges
    Cloud {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the Telegram bot adapter
    Bot,

    /// Probe the host's debug endpoint once and print what was found
    Discover,

    /// Show relay status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
}

fn abort_on_errors(errors: &[String]) -> anyhow::Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for e in errors {
        error!("{e}");
    }
    anyhow::bail!("invalid configuration ({} errors)", errors.len())
}

/// Cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(%e, "Failed to listen for Ctrl-C"),
        }
        trigger.cancel();
    });
    token
}

fn with_relay_overrides(mut config: Config, port: Option<u16>, no_ui: bool) -> Config {
    if port.is_some() || no_ui {
        let relay = config.relay.get_or_insert_with(Default::default);
        if let Some(port) = port {
            relay.port = port;
        }
        if no_ui {
            relay.ui = false;
        }
    }
    config
}

async fn run_relay(state: Arc<RelayState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = mirror_relay_gateway::bind(&state).await?;
    #[allow(unused_mut)]
    let mut app = mirror_relay_gateway::build_router(state.clone());

    #[cfg(feature = "metrics")]
    {
        let handle = mirror_relay_gateway::metrics::install_prometheus_recorder()?;
        app = mirror_relay_gateway::server::with_metrics(app, handle);
        info!("Prometheus metrics at /metrics");
    }

    if state.config.ui_enabled() {
        info!("Mirror UI available at http://{}/", listener.local_addr()?);
    }
    mirror_relay_gateway::serve(listener, app, shutdown).await
}

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    let shutdown = shutdown_on_ctrl_c();
    let host_config = config.host();

    let host = HostSupervisor::new(&host_config);
    host.spawn(shutdown.clone());

    let state = Arc::new(RelayState::new(config.clone(), host.clone(), None));
    mirror_relay_gateway::spawn_capture_loop(
        state.clone(),
        host,
        Duration::from_millis(host_config.capture_interval_ms),
        shutdown.clone(),
    );

    if let Some(bridge) = config.bridge.as_ref() {
        if let (Some(url), Some(token)) = (bridge.url.clone(), bridge.resolve_token()) {
            info!(url = %url, "Bridging to public relay");
            BridgeClient::new(
                state.clone(),
                url,
                token,
                Duration::from_millis(bridge.reconnect_delay_ms),
            )
            .spawn(shutdown.clone());
        }
    }

    run_relay(state, shutdown).await
}

async fn cloud(config: Arc<Config>) -> anyhow::Result<()> {
    let token = config
        .bridge_token()
        .ok_or_else(|| anyhow::anyhow!("cloud mode needs bridge.token (or bridge.token_env)"))?;
    let bridge = config.bridge.clone().unwrap_or_default();

    let hub = Arc::new(BridgeHub::new(
        Some(token),
        Duration::from_millis(bridge.request_timeout_ms),
    ));
    let state = Arc::new(RelayState::new(config, hub.clone(), Some(hub)));
    info!("Cloud relay waiting for bridges on /bridge");
    run_relay(state, shutdown_on_ctrl_c()).await
}

async fn bot(config: &Config) -> anyhow::Result<()> {
    let bot = config
        .bot
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no `bot` section in config"))?;
    let telegram = bot
        .telegram
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no `bot.telegram` section in config"))?;
    let token = telegram
        .resolve_bot_token()
        .ok_or_else(|| anyhow::anyhow!("bot.telegram needs bot_token or bot_token_env"))?;

    let relay = Arc::new(RelayClient::from_config(&bot));
    let channel = Arc::new(TelegramChannel::new(&telegram, &token)?);
    info!(relay = %relay.base_url(), "Starting Telegram bot");

    BotAdapter::new(relay, channel, bot.recent_ids_capacity)
        .run(
            Duration::from_millis(bot.reconnect_delay_ms),
            shutdown_on_ctrl_c(),
        )
        .await
}

async fn discover(config: &Config) -> anyhow::Result<()> {
    let address = mirror_relay_host::discovery::discover(&config.host()).await?;
    println!("Port:      {}", address.port);
    println!("Target:    {}", address.target_id);
    println!("Title:     {}", address.title);
    println!("WebSocket: {}", address.ws_url);
    if !address.main {
        println!("(matched a fallback pattern only)");
    }
    Ok(())
}

async fn status(config: &Config, config_path: &std::path::Path) {
    println!("Mirror Relay v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Relay port: {}", config.relay_port());
    println!(
        "Auth: {}",
        if config.relay_password().is_some() {
            "password"
        } else {
            "local network only"
        }
    );

    let url = format!("http://127.0.0.1:{}/health", config.relay_port());
    let health = async {
        reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await
    };
    match health.await {
        Ok(body) => {
            println!("Status: running (v{})", body["version"].as_str().unwrap_or("?"));
            println!("Host connected: {}", body["host_connected"]);
            println!("Clients: {}", body["connections"]);
            println!("Snapshot: {}", body["fingerprint"].as_str().unwrap_or("none"));
            println!("Broadcasts: {}", body["broadcasts"]);
        }
        Err(_) => println!("Status: not running"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(config.logging.as_ref(), cli.verbose)?;

    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }

    match cli.command {
        Commands::Serve { port, no_ui } => {
            abort_on_errors(&errors)?;
            serve(Arc::new(with_relay_overrides(config, port, no_ui))).await?;
        }
        Commands::Cloud { port } => {
            abort_on_errors(&errors)?;
            cloud(Arc::new(with_relay_overrides(config, port, false))).await?;
        }
        Commands::Bot => bot(&config).await?,
        Commands::Discover => discover(&config).await?,
        Commands::Status => status(&config, &config_path).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at `{key}`"),
            },
        },
    }

    Ok(())
}
