use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use relaychat_core::config::{Config, LoggingConfig, Profile};
use relaychat_gateway::GatewayState;
use relaychat_runtime::{AgentRuntimeClient, HttpClientFactory};

#[derive(Parser)]
#[command(
    name = "relaychat",
    about = "Streaming chat gateway for hosted conversational agents",
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
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 8787)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// List the runtime's agents, or describe one
    Agents {
        /// Agent to describe
        #[arg(long)]
        id: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path (e.g. gateway.port)
    Get { key: String },
}

/// Level precedence: `RUST_LOG`, then `logging.level`, then `--verbose`.
fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let level = logging
        .and_then(|l| l.level.clone())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
        }
    }

    let writer = match logging.map(|l| l.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let layer = fmt::layer().with_writer(writer);
    let registry = tracing_subscriber::registry().with(filter);

    if logging.is_some_and(|l| l.format == "json") {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    init_logging(cli.verbose, config.logging.as_ref());

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.gateway_mut().port = port;
            }
            if let Some(bind) = bind {
                config.gateway_mut().bind = Some(bind);
            }
            tracing::info!(
                "Starting relaychat gateway on {}:{}",
                config.gateway_bind(),
                config.gateway_port()
            );

            let state = GatewayState::from_config(Arc::new(config))?;
            #[cfg(feature = "metrics")]
            let state = state.with_metrics(relaychat_gateway::metrics::install_prometheus_recorder()?);

            relaychat_gateway::start_gateway(Arc::new(state)).await?;
        }
        Commands::Agents { id } => {
            let runtime = config.runtime();
            let timeout = Duration::from_secs(config.runtime_timeout_secs());
            let factory = HttpClientFactory::new(&runtime, timeout)?;

            let output = match id {
                Some(id) => serde_json::to_value(factory.bind(&id).describe().await?)?,
                None => {
                    let client = factory.bind(runtime.default_agent_id.as_deref().unwrap_or_default());
                    serde_json::to_value(client.list_agents().await?)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
        },
        Commands::Status => {
            let runtime = config.runtime();
            println!("relaychat v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!(
                "Profile: {}",
                match config.profile {
                    Profile::Production => "production",
                    Profile::Development => "development",
                }
            );
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("Auth: {}", config.auth_mode());
            println!(
                "Runtime: {}",
                runtime.endpoint.as_deref().unwrap_or("(not configured)")
            );
            println!(
                "Default agent: {}",
                runtime.default_agent_id.as_deref().unwrap_or("(not configured)")
            );

            let host = match config.gateway_bind().as_str() {
                "0.0.0.0" | "::" => "127.0.0.1".to_string(),
                other => other.to_string(),
            };
            let url = format!("http://{host}:{}/health", config.gateway_port());
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()?;
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Status: running (cached sessions: {})", body["sessions"]);
                }
                _ => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
