use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::oidc::{Endpoints, DEFAULT_SCOPES};

/// Bridge SSO - AWS SSO sessions and Kubernetes context mappings
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Bridge API base URL (client commands)
    #[arg(
        long,
        env = "BRIDGE_API_URL",
        default_value = "http://127.0.0.1:8000",
        global = true
    )]
    pub api_url: String,

    /// API key protecting /api/v1 (server) or presented to it (client)
    #[arg(short = 'k', long, env = "BRIDGE_API_KEY", global = true)]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server options when no subcommand is given
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the Bridge SSO API server (default)
    Serve(ServeArgs),
    /// Add an SSO session through device authorization
    Login,
    /// List SSO sessions with their accounts and roles
    Sessions,
    /// Sync accounts and roles of a session, re-authenticating if needed
    Sync {
        /// Session name
        name: String,
    },
    /// Map a Kubernetes context to an account role of a session
    Map {
        /// Session name
        session: String,
        /// Pre-filter contexts with this search query
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Remove the mapping of a Kubernetes context
    Unmap {
        /// Context name
        context: String,
    },
    /// List context mappings
    Mappings,
    /// Show login status for a start URL
    Status {
        /// SSO start URL
        start_url: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// Path to the session database
    #[arg(short = 'd', long, env = "BRIDGE_DB_FILE")]
    pub db_file: Option<String>,

    /// Path to the kubeconfig providing the context feed
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Client name used when registering with AWS SSO OIDC
    #[arg(long, env = "SSO_CLIENT_NAME")]
    pub client_name: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries for throttled or failed AWS calls
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "2")]
    pub http_retries: u32,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub api_key: Option<String>,

    // Storage
    pub db_file: PathBuf,
    pub kubeconfig: PathBuf,

    // AWS SSO
    pub client_name: String,
    pub scopes: Vec<String>,
    pub endpoints: Endpoints,
    pub token_refresh_threshold: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    pub log_level: String,
}

/// Settings for client commands
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub request_timeout: u64,
}

/// Parse CLI arguments after loading `.env`.
/// Priority: CLI > ENV > defaults
pub fn parse_args() -> CliArgs {
    dotenvy::dotenv().ok();
    CliArgs::parse()
}

impl Config {
    /// Build the server configuration from parsed arguments and environment
    pub fn load(cli: &CliArgs, args: &ServeArgs) -> Result<Self> {
        let defaults = Endpoints::default();

        let config = Config {
            server_host: args.host.clone(),
            server_port: args.port,

            api_key: cli.api_key.clone().filter(|k| !k.is_empty()),

            db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .or_else(default_db_path)
                .context("BRIDGE_DB_FILE is required when no data directory is available")?,

            kubeconfig: args
                .kubeconfig
                .as_deref()
                // KUBECONFIG may hold a path list; the first entry wins
                .and_then(|s| s.split(':').find(|p| !p.is_empty()))
                .map(expand_tilde)
                .or_else(default_kubeconfig_path)
                .unwrap_or_else(|| PathBuf::from(".kube/config")),

            client_name: args
                .client_name
                .clone()
                .unwrap_or_else(default_client_name),

            scopes: std::env::var("SSO_SCOPES")
                .ok()
                .map(|s| parse_scopes(&s))
                .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()),

            endpoints: Endpoints {
                oidc: std::env::var("OIDC_ENDPOINT").unwrap_or(defaults.oidc),
                portal: std::env::var("PORTAL_ENDPOINT").unwrap_or(defaults.portal),
            },

            token_refresh_threshold: std::env::var("TOKEN_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: cli.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            anyhow::bail!("SSO_SCOPES must contain at least one scope");
        }

        for (name, template) in [
            ("OIDC_ENDPOINT", &self.endpoints.oidc),
            ("PORTAL_ENDPOINT", &self.endpoints.portal),
        ] {
            if !template.starts_with("https://") && !template.starts_with("http://") {
                anyhow::bail!("{} must be an http(s) URL: {}", name, template);
            }
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

impl ClientConfig {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            api_url: cli.api_url.trim_end_matches('/').to_string(),
            api_key: cli.api_key.clone().filter(|k| !k.is_empty()),
            request_timeout: std::env::var("HTTP_REQUEST_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("bridge-sso").join("bridge.sqlite3"))
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// `bridge-<hostname>`, the name shown in the AWS consent screen
fn default_client_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "local".to_string());
    format!("bridge-{}", host)
}

/// Parse a comma or whitespace separated scope list
fn parse_scopes(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
