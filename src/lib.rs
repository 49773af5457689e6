pub mod api;
pub mod broker;
pub mod config;
pub mod echo;
pub mod error;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod shell;
pub mod shutdown;
pub mod transport;
pub mod watcher;
pub mod workspace;
