//! Server assembly: builds every component from a [`Config`], serves HTTP and
//! WebSocket traffic, and tears everything down in order.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, RouterConfig};
use crate::broker::{spawn_shell_relay, Broker};
use crate::config::{Config, ConfigError};
use crate::pty::PtyError;
use crate::shell::ShellSession;
use crate::shutdown::ShutdownCoordinator;
use crate::watcher::{FsWatcher, WatcherHandle};
use crate::workspace::Workspace;

/// Time the shell gets to exit after SIGHUP before it is killed.
const SHELL_GRACE: Duration = Duration::from_secs(2);

/// Time WebSocket handlers get to flush close frames.
const CLOSE_FRAME_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("failed to open workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn shell: {0}")]
    Shell(#[from] PtyError),

    #[error("failed to watch workspace: {0}")]
    Watcher(#[from] notify::Error),
}

pub struct Server;

/// Handle to a started server.
pub struct RunningServer {
    local_addr: SocketAddr,
    workspace: Arc<Workspace>,
    shell: ShellSession,
    shutdown: ShutdownCoordinator,
    http_shutdown: Option<oneshot::Sender<()>>,
    http_task: JoinHandle<std::io::Result<()>>,
    broker_cancel: CancellationToken,
    broker_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
    watcher: WatcherHandle,
}

impl Server {
    /// Open the workspace, bind the listener, spawn the shell and start the
    /// broker, watcher and HTTP server.
    pub async fn start(config: Config) -> Result<RunningServer, ServerError> {
        config.validate()?;

        let workspace = Workspace::open(&config.workspace).map_err(|source| {
            ServerError::Workspace {
                path: config.workspace.clone(),
                source,
            }
        })?;
        let workspace = Arc::new(workspace);

        let listener = tokio::net::TcpListener::bind(config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.bind,
            source,
        })?;

        let command = config.shell.spawn_command(workspace.root());
        let (shell, output) = ShellSession::spawn(&command, config.shell.rows, config.shell.cols)?;

        let broker_cancel = CancellationToken::new();
        let (broker, broker_task) = Broker::spawn(
            workspace.clone(),
            shell.clone(),
            config.broker_settings(),
            broker_cancel.clone(),
        );
        let relay_task = spawn_shell_relay(output, broker.clone());

        let watcher = match FsWatcher::start(workspace.root(), config.debounce(), broker.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                shell.terminate(SHELL_GRACE).await;
                broker_cancel.cancel();
                return Err(e.into());
            }
        };

        let shutdown = ShutdownCoordinator::new();
        let state = AppState {
            broker,
            workspace: workspace.clone(),
            shell: shell.clone(),
            shutdown: shutdown.clone(),
            ws_count: Arc::new(AtomicUsize::new(0)),
            max_connections: config.max_connections,
        };
        let app = api::router(
            state,
            RouterConfig {
                cors_origins: config.cors_origins.clone(),
            },
        );

        let (http_shutdown, http_shutdown_rx) = oneshot::channel::<()>();
        let http_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    http_shutdown_rx.await.ok();
                })
                .await
        });

        tracing::info!(
            addr = %local_addr,
            workspace = %workspace.root().display(),
            shell = %shell.command,
            pid = ?shell.pid,
            "sandshell listening"
        );

        Ok(RunningServer {
            local_addr,
            workspace,
            shell,
            shutdown,
            http_shutdown: Some(http_shutdown),
            http_task,
            broker_cancel,
            broker_task,
            relay_task,
            watcher,
        })
    }
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.root()
    }

    pub fn shell(&self) -> &ShellSession {
        &self.shell
    }

    /// Close every client, stop serving, and terminate the shell's process
    /// group.
    pub async fn shutdown(mut self) {
        // Signal WebSocket handlers to send close frames
        self.shutdown.shutdown();
        if !self.shutdown.wait_for_idle(CLOSE_FRAME_GRACE).await {
            tracing::debug!(
                remaining = self.shutdown.active_count(),
                "WebSocket handlers still open at shutdown"
            );
        }

        if let Some(tx) = self.http_shutdown.take() {
            let _ = tx.send(());
        }
        match self.http_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
            Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
        }

        self.watcher.stop().await;
        self.shell.terminate(SHELL_GRACE).await;

        self.broker_cancel.cancel();
        if let Err(e) = self.broker_task.await {
            tracing::warn!(?e, "broker task panicked");
        }
        self.relay_task.abort();
        tracing::info!("sandshell stopped");
    }
}
