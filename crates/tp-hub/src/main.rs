use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tp_query::engine::default_parallelism;
use tp_query::{Engine, EngineConfig, LiveBroadcaster};

mod api;
mod tail;
mod ws;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "tp-hub",
    version,
    about = "TIDEPOOL query server"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:9001")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "tp-hub.toml")]
    config: PathBuf,

    /// Log root directory (overrides the config file)
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Maximum number of log files scanned at once (overrides the config file)
    #[arg(long)]
    max_parallelism: Option<usize>,

    /// Emit search results as soon as they are found, unordered
    #[arg(long)]
    skip_sort: bool,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tail: Vec<tail::TailConfig>,
}

#[derive(Deserialize, Clone)]
pub struct EngineSection {
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,
    #[serde(default)]
    pub skip_sort: bool,
    #[serde(default = "default_search_buffer")]
    pub search_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            log_root: default_log_root(),
            max_parallelism: default_parallelism(),
            skip_sort: false,
            search_buffer: default_search_buffer(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_min_query_length")]
    pub min_query_length: usize,
    #[serde(default = "default_live_queue")]
    pub live_queue_capacity: usize,
    /// Hostname stamped on tailed lines; falls back to `$HOSTNAME`.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_query_length: default_min_query_length(),
            live_queue_capacity: default_live_queue(),
            hostname: None,
        }
    }
}

fn default_log_root() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_search_buffer() -> usize {
    tp_query::engine::DEFAULT_SEARCH_BUFFER
}
fn default_min_query_length() -> usize {
    6
}
fn default_live_queue() -> usize {
    tp_query::live::DEFAULT_QUEUE_CAPACITY
}

impl Config {
    fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path).map(|content| toml::from_str::<Config>(&content)) {
            Ok(Ok(config)) => config,
            Ok(Err(e)) => {
                tracing::warn!("Ignoring invalid config {:?}: {}", path, e);
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Could not read config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(root) = &args.log_root {
            self.engine.log_root = root.clone();
        }
        if let Some(n) = args.max_parallelism {
            self.engine.max_parallelism = n;
        }
        if args.skip_sort {
            self.engine.skip_sort = true;
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            log_root: self.engine.log_root.clone(),
            max_parallelism: self.engine.max_parallelism,
            skip_sort: self.engine.skip_sort,
            search_buffer: self.engine.search_buffer,
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub engine: Engine,
    pub live: Arc<LiveBroadcaster>,
    pub config: Config,
    pub start_time: Instant,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tp_hub=info,tp_query=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config);
    config.apply_args(&args);

    let engine = Engine::new(config.engine_config());
    let live = Arc::new(LiveBroadcaster::new(config.server.live_queue_capacity));
    let shutdown = CancellationToken::new();

    let hostname = config
        .server
        .hostname
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".into());
    for entry in config.tail.clone() {
        tracing::info!("Tailing {:?} as source '{}'", entry.path, entry.source);
        tokio::spawn(tail::follow(
            entry,
            live.clone(),
            hostname.clone(),
            shutdown.child_token(),
        ));
    }

    let state = Arc::new(AppState {
        engine,
        live: live.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/", get(api::status))
        .route("/query", get(api::query))
        .route("/query-for-lines", get(api::query_for_lines))
        .route("/ingest/:source", post(api::ingest))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address '{}': {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  TIDEPOOL v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Query:      http://{}/query?q=", addr);
    tracing::info!("  Live tail:  ws://{}/ws", addr);
    tracing::info!("  Log root:   {:?}", config.engine.log_root);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Exit signal received, closing...");
            signal.cancel();
        })
        .await;

    shutdown.cancel();
    live.shutdown().await;
    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
