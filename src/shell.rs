use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::BrokerError;
use crate::pty::{Pty, PtyError, SpawnCommand};

/// Queued keystroke chunks waiting for the PTY writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 1024;

/// PTY chunks (~4 KiB each) waiting for the broker. When full the reader
/// thread blocks, which pushes back on the child through the kernel buffer.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long to keep draining output that races with the exit status.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Liveness of the shell subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShellState {
    Running,
    Exited { code: Option<u32> },
}

impl ShellState {
    pub fn is_running(&self) -> bool {
        matches!(self, ShellState::Running)
    }
}

/// One item from the shell's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Bytes),
    Exited(Option<u32>),
}

/// Handle to the single shell subprocess.
///
/// Cheap to clone. Input goes through a bounded queue drained by a blocking
/// writer thread, so `try_write` never blocks the caller.
#[derive(Clone)]
pub struct ShellSession {
    /// PID of the child, used to signal its process group.
    pub pid: Option<u32>,
    /// Display form of the program that was launched.
    pub command: String,
    input_tx: mpsc::Sender<Bytes>,
    state: Arc<watch::Sender<ShellState>>,
    pty: Option<Arc<Mutex<Pty>>>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Spawn `command` in a fresh PTY and start its I/O threads.
    ///
    /// Returns the session handle and the output stream. The stream yields
    /// every chunk in the order the child produced it, followed by exactly
    /// one [`ShellEvent::Exited`].
    pub fn spawn(
        command: &SpawnCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, ShellOutput), PtyError> {
        let mut pty = Pty::spawn(rows, cols, command)?;
        let pty_reader = pty.take_reader()?;
        let pty_writer = pty.take_writer()?;
        let pty_child = pty.take_child();
        let pid = pty_child.as_ref().and_then(|c| c.process_id());

        let state = Arc::new(watch::channel(ShellState::Running).0);

        // Child exit monitor.
        match pty_child {
            Some(mut child) => {
                let state = state.clone();
                tokio::task::spawn_blocking(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        child.wait()
                    }));
                    let code = match result {
                        Ok(Ok(status)) => {
                            tracing::debug!(?status, "shell exited");
                            Some(status.exit_code())
                        }
                        Ok(Err(e)) => {
                            tracing::error!(?e, "error waiting for shell");
                            None
                        }
                        Err(e) => {
                            tracing::error!("shell exit monitor panicked: {:?}", e);
                            None
                        }
                    };
                    state.send_replace(ShellState::Exited { code });
                });
            }
            None => {
                state.send_replace(ShellState::Exited { code: None });
            }
        }

        // PTY reader: blocking_send keeps generation order and applies
        // backpressure to the child instead of buffering without bound.
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Read;
                let mut reader = pty_reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if data_tx.blocking_send(data).is_err() {
                                break;
                            }
                        }
                        // EIO once the slave side is gone.
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });

        // PTY writer. Exits when every input sender is dropped or the PTY
        // stops accepting writes after the child is gone.
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Write;
                let mut writer = pty_writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        let session = ShellSession {
            pid,
            command: command.program(),
            input_tx,
            state: state.clone(),
            pty: Some(Arc::new(Mutex::new(pty))),
        };
        let output = ShellOutput::from_parts(data_rx, state);
        Ok((session, output))
    }

    /// Build a session over plain channels with no subprocess behind it.
    ///
    /// Input written to the session shows up on the receiver paired with
    /// `input_tx`; liveness follows whatever is sent on `state`.
    pub fn from_parts(input_tx: mpsc::Sender<Bytes>, state: Arc<watch::Sender<ShellState>>) -> Self {
        Self {
            pid: None,
            command: "detached".to_string(),
            input_tx,
            state,
            pty: None,
        }
    }

    pub fn state(&self) -> ShellState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_running()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ShellState> {
        self.state.subscribe()
    }

    /// Queue bytes for the shell's stdin without waiting.
    ///
    /// Calls from one task are delivered in call order.
    pub fn try_write(&self, data: Bytes) -> Result<(), BrokerError> {
        if !self.is_alive() {
            return Err(BrokerError::SessionDead);
        }
        self.input_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::InputBackpressure,
            mpsc::error::TrySendError::Closed(_) => BrokerError::SessionDead,
        })
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        match &self.pty {
            Some(pty) => pty.lock().resize(rows, cols),
            None => Ok(()),
        }
    }

    /// Ask the shell to hang up, escalating to SIGKILL if it is still
    /// running after `grace`.
    pub async fn terminate(&self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        self.send_sighup();
        let mut rx = self.state.subscribe();
        let exited = matches!(
            tokio::time::timeout(grace, rx.wait_for(|s| !s.is_running())).await,
            Ok(Ok(_))
        );
        if !exited {
            tracing::warn!(pid = ?self.pid, "shell ignored SIGHUP, sending SIGKILL");
            self.kill_child();
        }
    }

    /// Send SIGHUP to the child's process group.
    ///
    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// group and background jobs started from the shell get the signal too.
    pub fn send_sighup(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGHUP);
    }

    /// Send SIGKILL to the child's process group.
    pub fn kill_child(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else {
            return;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        // A recycled PID must never be signalled.
        if !self.is_alive() {
            tracing::debug!(pid, signal, "shell already exited, not signalling");
            return;
        }
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

/// Ordered output stream of the shell.
pub struct ShellOutput {
    data_rx: mpsc::Receiver<Bytes>,
    state: watch::Receiver<ShellState>,
    // Holding the sender keeps `changed()` from erroring out.
    _state_tx: Arc<watch::Sender<ShellState>>,
    finished: bool,
}

impl ShellOutput {
    pub fn from_parts(data_rx: mpsc::Receiver<Bytes>, state: Arc<watch::Sender<ShellState>>) -> Self {
        Self {
            data_rx,
            state: state.subscribe(),
            _state_tx: state,
            finished: false,
        }
    }

    /// Next chunk, or the exit notice once the child is gone.
    ///
    /// Returns `None` after `Exited` has been yielded.
    pub async fn recv(&mut self) -> Option<ShellEvent> {
        if self.finished {
            return None;
        }
        loop {
            let current = *self.state.borrow_and_update();
            if let ShellState::Exited { code } = current {
                return match tokio::time::timeout(EXIT_DRAIN_GRACE, self.data_rx.recv()).await {
                    Ok(Some(data)) => Some(ShellEvent::Data(data)),
                    _ => {
                        self.finished = true;
                        Some(ShellEvent::Exited(code))
                    }
                };
            }

            tokio::select! {
                biased;
                data = self.data_rx.recv() => match data {
                    Some(data) => return Some(ShellEvent::Data(data)),
                    None => {
                        // Reader hit EOF; the exit status is on its way.
                        let code = self.wait_exit().await;
                        self.finished = true;
                        return Some(ShellEvent::Exited(code));
                    }
                },
                _ = self.state.changed() => {}
            }
        }
    }

    async fn wait_exit(&mut self) -> Option<u32> {
        match self.state.wait_for(|s| !s.is_running()).await {
            Ok(state) => match *state {
                ShellState::Exited { code } => code,
                ShellState::Running => None,
            },
            Err(_) => None,
        }
    }
}
