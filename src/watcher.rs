use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerEvent, BrokerHandle};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    Rename,
    Other,
}

impl ChangeKind {
    /// Classify a raw notify event. Access events are not changes.
    pub fn from_event_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Create(_) => Some(ChangeKind::Create),
            EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
            EventKind::Modify(_) => Some(ChangeKind::Modify),
            EventKind::Remove(_) => Some(ChangeKind::Remove),
            EventKind::Any | EventKind::Other => Some(ChangeKind::Other),
        }
    }
}

/// Everything that changed during one debounce window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    paths: BTreeSet<PathBuf>,
    kinds: BTreeSet<ChangeKind>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I>(&mut self, kind: ChangeKind, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.kinds.insert(kind);
        self.paths.extend(paths);
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> + Clone {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.kinds.iter().copied()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.kinds.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    /// Waiting for the window to pass without further events.
    Collecting { deadline: Instant },
    /// Quiet period elapsed; the batch is ready to fire.
    Armed,
}

/// Trailing-edge debouncer.
///
/// Every event while collecting pushes the deadline out by a full window,
/// so a burst of any length produces exactly one batch once it goes quiet.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
    pending: ChangeBatch,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
            pending: ChangeBatch::new(),
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn push<I>(&mut self, kind: ChangeKind, paths: I, now: Instant)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.pending.add(kind, paths);
        match self.state {
            DebounceState::Idle | DebounceState::Collecting { .. } => {
                self.state = DebounceState::Collecting {
                    deadline: now + self.window,
                };
            }
            DebounceState::Armed => {}
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Collecting { deadline } => Some(deadline),
            DebounceState::Idle | DebounceState::Armed => None,
        }
    }

    /// Advance the clock. Returns true once the batch is armed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if let DebounceState::Collecting { deadline } = self.state {
            if now >= deadline {
                self.state = DebounceState::Armed;
            }
        }
        self.state == DebounceState::Armed
    }

    /// Take the armed batch and return to idle.
    pub fn fire(&mut self) -> Option<ChangeBatch> {
        if self.state != DebounceState::Armed {
            return None;
        }
        self.state = DebounceState::Idle;
        Some(std::mem::take(&mut self.pending))
    }
}

struct RawChange {
    kind: ChangeKind,
    paths: Vec<PathBuf>,
}

/// Running recursive watch over the workspace.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WatcherHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "watcher debounce task failed");
        }
    }
}

pub struct FsWatcher;

impl FsWatcher {
    /// Watch `root` recursively and deliver one `TreeChanged` per settled
    /// burst to the broker.
    pub fn start(
        root: &Path,
        window: Duration,
        broker: BrokerHandle,
    ) -> Result<WatcherHandle, notify::Error> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawChange>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(kind) = ChangeKind::from_event_kind(&event.kind) {
                        let _ = raw_tx.send(RawChange {
                            kind,
                            paths: event.paths,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "workspace watcher error");
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::debug!(root = %root.display(), ?window, "watching workspace");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(raw_rx, window, broker, cancel.clone()));

        Ok(WatcherHandle {
            _watcher: watcher,
            task,
            cancel,
        })
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<RawChange>,
    window: Duration,
    broker: BrokerHandle,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        let deadline = debouncer.deadline();
        let wake_at = match deadline {
            Some(d) => tokio::time::Instant::from_std(d),
            None => tokio::time::Instant::now() + Duration::from_secs(3600),
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(change) => debouncer.push(change.kind, change.paths, Instant::now()),
                None => break,
            },
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                if !debouncer.tick(Instant::now()) {
                    continue;
                }
                let Some(batch) = debouncer.fire() else {
                    continue;
                };
                tracing::debug!(paths = batch.len(), "workspace changes settled");
                if broker.send(BrokerEvent::TreeChanged(batch)).await.is_err() {
                    tracing::debug!("broker gone, stopping watcher");
                    break;
                }
            }
        }
    }
}
