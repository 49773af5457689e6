//! The session broker.
//!
//! One task owns the connection set, the suppression table and the shell
//! handle, and processes [`BrokerEvent`]s strictly one at a time. Nothing in
//! the loop blocks: file I/O runs on per-connection workers, tree walks run
//! on a serial snapshot worker, and deliveries go into bounded outboxes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::echo::SuppressionTable;
use crate::error::BrokerError;
use crate::protocol::ServerEvent;
use crate::shell::{ShellEvent, ShellOutput, ShellSession};
use crate::transport::{Connection, ConnectionId, ConnectionSet, Outbox, Outgoing};
use crate::watcher::ChangeBatch;
use crate::workspace::{self, tree, Workspace};

/// Events queued between producers and the dispatch loop.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// File operations one connection may have queued before more are refused.
const FILE_QUEUE_CAPACITY: usize = 64;

/// `tree:get` requests one connection may have waiting for the next walk.
const MAX_PENDING_TREE_REQUESTS: usize = 16;

/// What connected clients are told when the workspace changes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TreeUpdatePolicy {
    /// Send a bare `tree:changed`; clients pull the tree when they want it.
    #[default]
    Notify,
    /// Push a fresh `tree:snapshot`.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub suppression_grace: Duration,
    pub tree_updates: TreeUpdatePolicy,
    pub outbound_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            suppression_grace: Duration::from_millis(2000),
            tree_updates: TreeUpdatePolicy::Notify,
            outbound_capacity: 1024,
            queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug)]
pub enum BrokerEvent {
    ConnectionOpened(Connection),
    ConnectionClosed {
        id: ConnectionId,
    },
    ClientInput {
        id: ConnectionId,
        data: Bytes,
    },
    ClientResize {
        id: ConnectionId,
        rows: u16,
        cols: u16,
    },
    ClientFileWrite {
        id: ConnectionId,
        request_id: Option<Value>,
        path: String,
        content: String,
    },
    ClientFileRead {
        id: ConnectionId,
        request_id: Option<Value>,
        path: String,
    },
    ClientTreeRequest {
        id: ConnectionId,
        request_id: Option<Value>,
    },
    ShellOutput(Bytes),
    ShellExited {
        code: Option<u32>,
    },
    TreeChanged(ChangeBatch),
}

/// Cloneable entry point into the dispatch loop.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
    outbound_capacity: usize,
}

impl BrokerHandle {
    /// A handle whose events land on the returned receiver instead of a
    /// running broker.
    pub fn detached(
        queue_capacity: usize,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        (
            Self {
                tx,
                outbound_capacity,
            },
            rx,
        )
    }

    pub async fn send(&self, event: BrokerEvent) -> Result<(), BrokerError> {
        self.tx.send(event).await.map_err(|_| BrokerError::Unavailable)
    }

    /// Register a new client and return its broker-side connection.
    pub async fn connect(&self) -> Result<Connection, BrokerError> {
        let connection = Connection::new(self.outbound_capacity);
        self.send(BrokerEvent::ConnectionOpened(connection.clone()))
            .await?;
        Ok(connection)
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        if self.send(BrokerEvent::ConnectionClosed { id }).await.is_err() {
            tracing::debug!(conn = %id, "broker gone before disconnect");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum FileOp {
    Write {
        request_id: Option<Value>,
        /// The path as the client sent it, echoed in the reply.
        shown: String,
        rel: String,
        path: PathBuf,
        content: String,
    },
    Read {
        request_id: Option<Value>,
        shown: String,
        rel: String,
        path: PathBuf,
    },
}

impl FileOp {
    fn into_request_id(self) -> Option<Value> {
        match self {
            FileOp::Write { request_id, .. } | FileOp::Read { request_id, .. } => request_id,
        }
    }
}

struct SnapshotTarget {
    conn: ConnectionId,
    outbox: Arc<Outbox>,
    request_id: Option<Value>,
    /// Delivered right after the snapshot so a new client learns the tree
    /// before anything that depends on it.
    then: Vec<ServerEvent>,
}

impl SnapshotTarget {
    fn new(conn: ConnectionId, outbox: Arc<Outbox>, request_id: Option<Value>) -> Self {
        Self {
            conn,
            outbox,
            request_id,
            then: Vec::new(),
        }
    }

    fn is_unsolicited(&self) -> bool {
        self.request_id.is_none() && self.then.is_empty()
    }
}

/// Snapshot deliveries waiting for the next walk.
///
/// The worker takes everything pending at once and serves it from a single
/// walk, so a burst of requests costs one traversal.
#[derive(Default)]
struct SnapshotQueue {
    pending: Mutex<Vec<SnapshotTarget>>,
    notify: Notify,
}

impl SnapshotQueue {
    /// Returns `false` when the connection already has too many requests
    /// waiting. An unsolicited target is folded into one already pending for
    /// the same connection, whose walk has not started yet.
    fn push(&self, target: SnapshotTarget) -> bool {
        {
            let mut pending = self.pending.lock();
            if target.is_unsolicited() {
                if pending
                    .iter()
                    .any(|t| t.conn == target.conn && t.request_id.is_none())
                {
                    return true;
                }
            } else if target.request_id.is_some() {
                let waiting = pending
                    .iter()
                    .filter(|t| t.conn == target.conn && t.request_id.is_some())
                    .count();
                if waiting >= MAX_PENDING_TREE_REQUESTS {
                    return false;
                }
            }
            pending.push(target);
        }
        self.notify.notify_one();
        true
    }

    async fn take(&self) -> Vec<SnapshotTarget> {
        loop {
            let targets = std::mem::take(&mut *self.pending.lock());
            if !targets.is_empty() {
                return targets;
            }
            self.notify.notified().await;
        }
    }
}

pub struct Broker {
    workspace: Arc<Workspace>,
    shell: ShellSession,
    settings: BrokerSettings,
    connections: ConnectionSet,
    suppression: SuppressionTable,
    file_workers: HashMap<ConnectionId, mpsc::Sender<FileOp>>,
    snapshots: Arc<SnapshotQueue>,
    /// Stops the snapshot worker once the loop exits.
    workers: CancellationToken,
    shell_exit: Option<Option<u32>>,
}

impl Broker {
    /// Start the dispatch loop and the snapshot worker.
    ///
    /// The loop runs until `cancel` fires or every handle is dropped; on the
    /// way out every connection is closed.
    pub fn spawn(
        workspace: Arc<Workspace>,
        shell: ShellSession,
        settings: BrokerSettings,
        cancel: CancellationToken,
    ) -> (BrokerHandle, JoinHandle<()>) {
        let (handle, rx) = BrokerHandle::detached(settings.queue_capacity, settings.outbound_capacity);

        let snapshots = Arc::new(SnapshotQueue::default());
        let workers = cancel.child_token();
        tokio::spawn(snapshot_worker(
            workspace.root().to_path_buf(),
            snapshots.clone(),
            workers.clone(),
        ));

        let broker = Broker {
            suppression: SuppressionTable::new(settings.suppression_grace),
            workspace,
            shell,
            settings,
            connections: ConnectionSet::new(),
            file_workers: HashMap::new(),
            snapshots,
            workers,
            shell_exit: None,
        };
        let task = tokio::spawn(broker.run(rx, cancel));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<BrokerEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        tracing::debug!(connections = self.connections.len(), "broker stopping");
        self.connections.close_all();
        self.file_workers.clear();
        self.workers.cancel();
    }

    fn dispatch(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::ConnectionOpened(connection) => self.on_connect(connection),
            BrokerEvent::ConnectionClosed { id } => self.on_disconnect(id),
            BrokerEvent::ClientInput { id, data } => self.on_client_input(id, data),
            BrokerEvent::ClientResize { id, rows, cols } => self.on_client_resize(id, rows, cols),
            BrokerEvent::ClientFileWrite {
                id,
                request_id,
                path,
                content,
            } => self.on_file_write(id, request_id, path, content),
            BrokerEvent::ClientFileRead {
                id,
                request_id,
                path,
            } => self.on_file_read(id, request_id, path),
            BrokerEvent::ClientTreeRequest { id, request_id } => {
                self.on_tree_request(id, request_id)
            }
            BrokerEvent::ShellOutput(data) => {
                self.connections.broadcast(&Outgoing::Terminal(data));
            }
            BrokerEvent::ShellExited { code } => self.on_shell_exited(code),
            BrokerEvent::TreeChanged(batch) => self.on_tree_changed(batch),
        }
    }

    fn on_connect(&mut self, connection: Connection) {
        let id = connection.id;

        let (file_tx, file_rx) = mpsc::channel(FILE_QUEUE_CAPACITY);
        tokio::spawn(file_worker(
            id,
            connection.outbox.clone(),
            connection.cancel.clone(),
            file_rx,
        ));
        self.file_workers.insert(id, file_tx);

        let mut target = SnapshotTarget::new(id, connection.outbox.clone(), None);
        if let Some(code) = self.shell_exit {
            target.then.push(ServerEvent::SessionExited { code });
        }
        self.snapshots.push(target);

        self.connections.insert(connection);
        tracing::info!(conn = %id, connections = self.connections.len(), "client connected");
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        connection.close();
        self.file_workers.remove(&id);
        self.suppression.forget(&id);
        tracing::info!(conn = %id, connections = self.connections.len(), "client disconnected");
    }

    fn on_client_input(&mut self, id: ConnectionId, data: Bytes) {
        if let Err(e) = self.shell.try_write(data) {
            tracing::debug!(conn = %id, error = %e, "dropping client input");
            self.connections
                .send_to(&id, Outgoing::Event(ServerEvent::error(None, &e)));
        }
    }

    fn on_client_resize(&mut self, id: ConnectionId, rows: u16, cols: u16) {
        if rows == 0 || cols == 0 {
            let err = BrokerError::InvalidMessage(format!("invalid terminal size {rows}x{cols}"));
            self.connections
                .send_to(&id, Outgoing::Event(ServerEvent::error(None, &err)));
            return;
        }
        if let Err(e) = self.shell.resize(rows, cols) {
            tracing::warn!(conn = %id, rows, cols, error = %e, "failed to resize shell pty");
        }
    }

    fn on_file_write(
        &mut self,
        id: ConnectionId,
        request_id: Option<Value>,
        shown: String,
        content: String,
    ) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        let path = match self.workspace.resolve(&shown) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(conn = %id, path = %shown, "rejected file write outside workspace");
                connection.send_event(ServerEvent::error(request_id, &e));
                return;
            }
        };
        let rel = self.workspace.relative(&path).unwrap_or_default();

        let marked = path.clone();
        let op = FileOp::Write {
            request_id,
            shown,
            rel,
            path,
            content,
        };
        // Marked in the same dispatch step that queues the write, so no
        // watcher batch can be handled in between.
        if self.queue_file_op(id, op) {
            self.suppression.mark(id, marked, Instant::now());
        }
    }

    fn on_file_read(&mut self, id: ConnectionId, request_id: Option<Value>, shown: String) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        match self.workspace.resolve(&shown) {
            Ok(path) => {
                let rel = self.workspace.relative(&path).unwrap_or_default();
                self.queue_file_op(
                    id,
                    FileOp::Read {
                        request_id,
                        shown,
                        rel,
                        path,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(conn = %id, path = %shown, "rejected file read outside workspace");
                connection.send_event(ServerEvent::error(request_id, &e));
            }
        }
    }

    fn on_tree_request(&mut self, id: ConnectionId, request_id: Option<Value>) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        let target = SnapshotTarget::new(id, connection.outbox.clone(), request_id.clone());
        if !self.snapshots.push(target) {
            tracing::warn!(conn = %id, "too many tree requests pending");
            connection.send_event(ServerEvent::error(request_id, &BrokerError::TooManyRequests));
        }
    }

    fn on_shell_exited(&mut self, code: Option<u32>) {
        if self.shell_exit.is_some() {
            return;
        }
        self.shell_exit = Some(code);
        tracing::info!(?code, "shell exited");
        self.connections
            .broadcast(&Outgoing::Event(ServerEvent::SessionExited { code }));
    }

    fn on_tree_changed(&mut self, batch: ChangeBatch) {
        let now = Instant::now();
        self.suppression.purge_expired(now);

        let suppression = &self.suppression;
        let recipients: Vec<Connection> = self
            .connections
            .select(|id| !suppression.is_suppressed(id, batch.paths(), now))
            .into_iter()
            .cloned()
            .collect();
        self.suppression.consume(batch.paths());

        tracing::debug!(
            paths = batch.len(),
            first = ?batch.paths().next().and_then(|p| self.workspace.relative(p)),
            kinds = ?batch.kinds().collect::<Vec<_>>(),
            notified = recipients.len(),
            skipped = self.connections.len() - recipients.len(),
            "workspace changed"
        );

        match self.settings.tree_updates {
            TreeUpdatePolicy::Notify => {
                for connection in &recipients {
                    connection.send_event(ServerEvent::TreeChanged);
                }
            }
            TreeUpdatePolicy::Snapshot => {
                for connection in &recipients {
                    self.snapshots
                        .push(SnapshotTarget::new(connection.id, connection.outbox.clone(), None));
                }
            }
        }
    }

    /// Hand `op` to the connection's file worker. Returns whether it was
    /// queued; a full queue is refused with an error to the client.
    fn queue_file_op(&self, id: ConnectionId, op: FileOp) -> bool {
        let Some(worker) = self.file_workers.get(&id) else {
            tracing::debug!(conn = %id, "no file worker for connection");
            return false;
        };
        match worker.try_send(op) {
            Ok(()) => true,
            Err(TrySendError::Full(op)) => {
                tracing::warn!(conn = %id, "file queue full, refusing request");
                let err = BrokerError::TooManyRequests;
                self.connections
                    .send_to(&id, Outgoing::Event(ServerEvent::error(op.into_request_id(), &err)));
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(conn = %id, "file worker already stopped");
                false
            }
        }
    }
}

/// Relay shell output into the broker until the shell exits.
pub fn spawn_shell_relay(mut output: ShellOutput, broker: BrokerHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = output.recv().await {
            let event = match event {
                ShellEvent::Data(data) => BrokerEvent::ShellOutput(data),
                ShellEvent::Exited(code) => BrokerEvent::ShellExited { code },
            };
            if broker.send(event).await.is_err() {
                tracing::debug!("broker gone, stopping shell relay");
                break;
            }
        }
    })
}

/// Serial tree walker. One walk at a time, each on the blocking pool.
async fn snapshot_worker(root: PathBuf, queue: Arc<SnapshotQueue>, cancel: CancellationToken) {
    loop {
        let targets = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            targets = queue.take() => targets,
        };

        let walk_root = root.clone();
        let event_for = match tokio::task::spawn_blocking(move || tree::snapshot(&walk_root)).await
        {
            Ok(Ok(tree)) => Ok(tree),
            Ok(Err(source)) => {
                tracing::warn!(error = %source, "failed to snapshot workspace");
                Err(BrokerError::ReadFailure {
                    path: "/".to_string(),
                    source,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "snapshot task failed");
                continue;
            }
        };
        tracing::trace!(targets = targets.len(), "tree snapshot delivered");

        for target in targets {
            let event = match &event_for {
                Ok(tree) => ServerEvent::TreeSnapshot {
                    id: target.request_id,
                    tree: tree.clone(),
                },
                Err(e) => ServerEvent::error(target.request_id, e),
            };
            target.outbox.push(Outgoing::Event(event));
            for event in target.then {
                target.outbox.push(Outgoing::Event(event));
            }
        }
    }
}

/// Runs one connection's file operations in order until it disconnects.
async fn file_worker(
    id: ConnectionId,
    outbox: Arc<Outbox>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<FileOp>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let event = match op {
            FileOp::Write {
                request_id,
                shown,
                rel,
                path,
                content,
            } => match workspace::write_file(&path, &shown, &content).await {
                Ok(()) => {
                    tracing::debug!(conn = %id, path = %rel, bytes = content.len(), "file written");
                    ServerEvent::FileWritten {
                        id: request_id,
                        path: shown,
                    }
                }
                Err(e) => {
                    tracing::warn!(conn = %id, path = %rel, error = %e, "file write failed");
                    ServerEvent::error(request_id, &e)
                }
            },
            FileOp::Read {
                request_id,
                shown,
                rel,
                path,
            } => match workspace::read_file(&path, &shown).await {
                Ok(content) => {
                    tracing::debug!(conn = %id, path = %rel, bytes = content.len(), "file read");
                    ServerEvent::FileContent {
                        id: request_id,
                        path: shown,
                        content,
                    }
                }
                Err(e) => ServerEvent::error(request_id, &e),
            },
        };
        outbox.push(Outgoing::Event(event));
    }
    tracing::trace!(conn = %id, "file worker stopped");
}
