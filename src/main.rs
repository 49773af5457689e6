//! sandshell - a shared shell and workspace over WebSocket
//!
//! Runs one shell in a PTY inside a workspace directory and lets any number
//! of WebSocket clients type into it, watch its output, and edit files in the
//! workspace while seeing each other's changes.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sandshell::broker::TreeUpdatePolicy;
use sandshell::config::{Config, ConfigError};
use sandshell::server::{Server, ServerError};

/// sandshell - a shared shell and workspace over WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "sandshell", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/sandshell/config.toml)
    #[arg(long, env = "SANDSHELL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "SANDSHELL_BIND")]
    bind: Option<SocketAddr>,

    /// Workspace directory (created if missing)
    #[arg(long, env = "SANDSHELL_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Shell to spawn (overrides $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Quiet period before filesystem changes are reported, in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Messages queued per client before the oldest are dropped
    #[arg(long)]
    outbound_buffer: Option<usize>,

    /// How long a client's own writes are hidden from its change notifications
    #[arg(long)]
    suppression_ms: Option<u64>,

    /// What clients receive when the workspace changes
    #[arg(long, value_enum)]
    tree_updates: Option<TreeUpdatePolicy>,

    /// Maximum concurrent WebSocket connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Allowed CORS origin; repeat for several, "*" for any
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Arguments passed to the shell
    #[arg(last = true)]
    shell_args: Vec<String>,
}

impl Cli {
    fn load_config(&self) -> Result<Config, ConfigError> {
        let loaded = match &self.config {
            Some(path) => match Config::load(path)? {
                Some(config) => Some(config),
                None => {
                    return Err(ConfigError::ReadFailed(
                        path.clone(),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    ))
                }
            },
            None => match Config::default_path() {
                Some(path) => Config::load(&path)?,
                None => None,
            },
        };
        Ok(self.apply(loaded.unwrap_or_default()))
    }

    /// Command-line flags win over file values.
    fn apply(&self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(ref workspace) = self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(ref shell) = self.shell {
            config.shell.program = Some(shell.clone());
        }
        if !self.shell_args.is_empty() {
            config.shell.args = self.shell_args.clone();
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce_ms = ms;
        }
        if let Some(n) = self.outbound_buffer {
            config.outbound_buffer = n;
        }
        if let Some(ms) = self.suppression_ms {
            config.suppression_ms = ms;
        }
        if let Some(policy) = self.tree_updates {
            config.tree_updates = policy;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if !self.cors_origins.is_empty() {
            config.cors_origins = self.cors_origins.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.load_config()?;
    tracing::debug!(?config, "effective configuration");

    let server = Server::start(config).await?;

    wait_for_signal().await;

    server.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sandshell=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }
}
