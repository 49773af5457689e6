use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run inside the PTY and how.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    /// Program to execute. `None` means `$SHELL`, falling back to `/bin/sh`.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub term: String,
}

impl Default for SpawnCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl SpawnCommand {
    /// The program that will actually be executed.
    pub fn program(&self) -> String {
        self.program.clone().unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        })
    }

    fn build(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.program());
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", &self.term);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// The master side of a PTY plus the child running on its slave side.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(rows: u16, cols: u16, command: &SpawnCommand) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair
            .slave
            .spawn_command(command.build())
            .map_err(PtyError::SpawnCommand)?;
        // Only the child may hold the slave, otherwise the reader never sees
        // EOF when it exits.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Hand the child handle to whoever waits on it. Returns `None` after the
    /// first call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}
