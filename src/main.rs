use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use bridge_sso::{
    cli,
    client::{BridgeClient, SsoApi},
    config::{self, CliArgs, ClientConfig, Command, Config, ServeArgs},
    http_client::AwsHttpClient,
    middleware,
    oidc::SsoOidcClient,
    routes::{self, AppState},
    store::SsoStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::parse_args();

    // Initialize logging with the configured level
    let log_level = args.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    match &args.command {
        None => serve(&args, &args.serve).await,
        Some(Command::Serve(serve_args)) => serve(&args, serve_args).await,
        Some(command) => run_client(&args, command).await,
    }
}

/// Run one client command against the Bridge API
async fn run_client(args: &CliArgs, command: &Command) -> Result<()> {
    let client_config = ClientConfig::from_cli(args);
    tracing::debug!("Using Bridge API at {}", client_config.api_url);
    let api: Arc<dyn SsoApi> = Arc::new(BridgeClient::new(&client_config)?);

    match command {
        Command::Serve(_) => anyhow::bail!("serve is not a client command"),
        Command::Login => cli::login(api).await,
        Command::Sessions => cli::sessions(api).await,
        Command::Sync { name } => cli::sync(api, name).await,
        Command::Map { session, query } => cli::map(api, session, query.clone()).await,
        Command::Unmap { context } => cli::unmap(api, context).await,
        Command::Mappings => cli::mappings(api).await,
        Command::Status { start_url } => cli::status(api, start_url).await,
    }
}

/// Run the API server until Ctrl+C or SIGTERM
async fn serve(args: &CliArgs, serve_args: &ServeArgs) -> Result<()> {
    let config = Config::load(args, serve_args)?;
    config.validate()?;

    tracing::info!("🚀 Bridge SSO starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    let store = Arc::new(
        SsoStore::open(&config.db_file)
            .with_context(|| format!("Failed to open {}", config.db_file.display()))?,
    );
    let sessions = store.list_sessions()?;
    tracing::info!("✅ Session store ready ({} sessions)", sessions.len());

    let http = AwsHttpClient::new(
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?;
    let oidc = Arc::new(SsoOidcClient::new(
        http,
        config.endpoints.clone(),
        config.client_name.clone(),
        config.scopes.clone(),
    ));
    tracing::info!(
        "✅ AWS SSO client initialized (client name: {})",
        config.client_name
    );

    let app_state = AppState {
        store,
        oidc,
        config: Arc::new(config.clone()),
    };

    let app = build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Build the application with all routes and middleware
fn build_app(state: AppState) -> axum::Router {
    use axum::Router;

    // Health check routes (no auth required)
    let health_routes = routes::health_routes();

    // SSO routes (auth when BRIDGE_API_KEY is set)
    let sso_routes = routes::sso_routes(state);

    Router::new()
        .merge(health_routes)
        .merge(sso_routes)
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                    🔐 Bridge SSO                          ║
║                                                           ║
║  AWS SSO sessions & Kubernetes context mappings          ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Database:    {}", config.db_file.display());
    println!("  Kubeconfig:  {}", config.kubeconfig.display());
    println!(
        "  API Key:     {}",
        if config.api_key.is_some() {
            "required"
        } else {
            "disabled"
        }
    );
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
