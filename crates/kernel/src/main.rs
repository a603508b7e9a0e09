//! Quorum — governed tabular data platform.
//!
//! HTTP server for the change-request pipeline over versioned datasets.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use quorum_kernel::config::Config;
use quorum_kernel::models::{CreateUser, User};
use quorum_kernel::state::AppState;
use quorum_kernel::sweeper::Sweeper;
use quorum_kernel::{catalog, routes};

/// How often the background sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "quorum", about = "Quorum governed data platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default).
    Serve,
    /// Administrative commands.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Create a user account.
    CreateUser {
        /// Email address.
        email: String,
        /// Display name.
        name: String,
        /// Password.
        password: String,
        /// Grant platform admin rights.
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve) => run_server().await,
        Some(Commands::Admin { action }) => run_admin_command(action).await,
    }
}

/// Run the HTTP server.
async fn run_server() -> Result<()> {
    info!("Starting Quorum kernel");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(port = config.port, "Configuration loaded");

    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    info!("Database connection established");

    // Background sweeper for deferred staging cleanup
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if config.disable_worker {
        info!("Background sweeper disabled by configuration");
    } else {
        let sweeper = Sweeper::new(
            state.db().clone(),
            state.staging().clone(),
            state.audit().clone(),
        );
        sweeper.spawn(SWEEP_INTERVAL, shutdown_rx);
    }

    let cors = build_cors_layer(&config);

    // Build the router
    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::auth::router())
        .merge(routes::admin::router())
        .merge(routes::projects::router())
        .merge(routes::datasets::router())
        .merge(routes::changes::router())
        .merge(routes::audit::router())
        .merge(routes::snapshots::router())
        .merge(routes::notifications::router())
        // Middleware layers (last added = first executed in request flow):
        // TraceLayer → CORS → timeout → authenticate → routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            quorum_kernel::middleware::authenticate,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_seconds,
        )))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(listener, app).await.context("server error")?;

    shutdown_tx.send(true).ok();

    Ok(())
}

/// Run an admin CLI command with a minimal context (pool only).
async fn run_admin_command(action: AdminAction) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let pool = catalog::connect(&config)
        .await
        .context("failed to open the catalog store")?;

    match action {
        AdminAction::CreateUser {
            email,
            name,
            password,
            admin,
        } => {
            let user = User::create(
                &pool,
                CreateUser {
                    email: email.trim().to_lowercase(),
                    name,
                    password,
                },
            )
            .await
            .context("failed to create user")?;

            if admin {
                sqlx::query("UPDATE users SET is_admin = TRUE WHERE id = $1")
                    .bind(user.id)
                    .execute(&pool)
                    .await
                    .context("failed to grant admin")?;
            }

            println!("Created user {} ({})", user.email, user.id);
        }
    }

    Ok(())
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if config.cors_allowed_origins.len() == 1 && config.cors_allowed_origins[0] == "*" {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(true)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
