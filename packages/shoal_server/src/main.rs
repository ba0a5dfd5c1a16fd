use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{delete, get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod assistant;
mod config;
mod handlers;
mod presence;
mod rooms;
mod store;
mod ws;

use crate::assistant::{HttpGenerator, ReplyPipeline};
use crate::config::{FileConfig, load_config};
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMultiplexer;
use crate::store::{MemoryStore, MessageStore};

use shoal_client::EventStream;
use shoal_protocol::ClientEvent;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Real-time messaging synchronization server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.toml (defaults to cwd)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Server(ServerArgs),

    /// Connect to a running server and stream its live events
    Connect(ConnectArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Server address, host:port
    #[arg(short, long, default_value = "127.0.0.1:3500")]
    addr: String,

    /// Identity to connect as
    #[arg(short, long)]
    user_id: String,

    /// Conversation room to join on connect
    #[arg(short, long)]
    join: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub rooms: Arc<RoomMultiplexer>,
    pub presence: Arc<PresenceRegistry>,
    /// None when automated replies are disabled in config.
    pub pipeline: Option<Arc<ReplyPipeline>>,
    pub outbox_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Server(args) => run_server(args, &config_dir).await,
        Commands::Connect(args) => run_connect(args).await,
    }
}

async fn run_server(args: ServerArgs, config_dir: &std::path::Path) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "shoal=debug,tower_http=debug,info"
    } else {
        "shoal=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Shoal messaging server");

    let file_config: FileConfig = load_config(config_dir)
        .extract()
        .context("Failed to load configuration")?;

    let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
    let rooms = Arc::new(RoomMultiplexer::new());
    let presence = Arc::new(PresenceRegistry::new());

    let pipeline = if file_config.assistant.enabled {
        let base_url = file_config
            .assistant
            .base_url
            .as_deref()
            .context("assistant.enabled requires assistant.base_url")?;
        let runtime = file_config.assistant.to_runtime();
        let generator = Arc::new(HttpGenerator::new(base_url, runtime.timeout)?);
        info!(
            identity = %runtime.identity,
            daily_limit = runtime.daily_limit,
            "Automated replies enabled"
        );
        Some(Arc::new(ReplyPipeline::new(
            store.clone(),
            rooms.clone(),
            generator,
            runtime,
        )))
    } else {
        info!("Automated replies disabled (set SHOAL_ASSISTANT__ENABLED=true to enable)");
        None
    };

    let app_state = AppState {
        store,
        rooms,
        presence,
        pipeline,
        outbox_capacity: file_config.server.outbox_capacity,
    };

    let app = Router::new()
        .route("/ws", get(handlers::websocket_handler))
        .route(
            "/api/conversations/{id}/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        .route("/api/messages/{id}", delete(handlers::delete_message))
        .route("/api/messages/{id}/reactions", post(handlers::react))
        .route("/api/conversations/{id}/reads", post(handlers::read_receipts))
        .route(
            "/api/groups/{id}/membership",
            post(handlers::change_membership),
        )
        .route("/api/groups/{id}", delete(handlers::delete_group))
        .route("/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(3500);
    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Shoal listening on http://{}", listener.local_addr()?);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Minimal observer client: connect, optionally join a room, and print
/// every live event as one JSON line.
async fn run_connect(args: ConnectArgs) -> Result<()> {
    let url = format!("ws://{}/ws?user_id={}", args.addr, args.user_id);
    let mut stream = EventStream::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    if let Some(room_id) = args.join {
        stream.send(&ClientEvent::JoinRoom { room_id }).await?;
    }

    while let Some(event) = stream.next_event().await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
