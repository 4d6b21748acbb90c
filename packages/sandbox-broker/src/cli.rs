use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router, AppState, BrokerConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;

#[derive(Parser, Debug)]
#[command(name = "sandbox-broker", bin_name = "sandbox-broker")]
#[command(about = "Brokers coding-agent sessions between clients and ephemeral sandboxes")]
#[command(version, arg_required_else_help = true)]
pub struct BrokerCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session broker HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base URL of the sandbox provider's HTTP facade.
    #[arg(long, env = "SANDBOX_PROVIDER_URL")]
    provider_url: String,

    /// Shared secret for the sandbox provider, if it requires one.
    #[arg(long, env = "SANDBOX_PROVIDER_SECRET")]
    provider_secret: Option<String>,

    /// Base URL of the database of record.
    #[arg(long, env = "BROKER_DB_SITE_URL")]
    db_site_url: String,

    /// Path of the durable session store.
    #[arg(
        long,
        env = "BROKER_STATE_PATH",
        default_value = "/tmp/sandbox-broker/state.db"
    )]
    state_path: PathBuf,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_broker() -> Result<(), CliError> {
    let cli = BrokerCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = BrokerConfig {
        provider_base_url: args.provider_url.clone(),
        provider_api_secret: args.provider_secret.clone(),
        db_site_url: args.db_site_url.clone(),
        state_path: args.state_path.clone(),
    };

    let cors = build_cors_layer(&args.cors_allow_origin)?;
    let addr = format!("{}:{}", args.host, args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let state = AppState::new(config)
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        let router = build_router(Arc::new(state)).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "broker listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any);

    let mut origins = Vec::new();
    for origin in allowed_origins {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }
    Ok(cors)
}
