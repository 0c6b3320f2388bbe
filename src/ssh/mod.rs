//! SSH Connection Pool (C1).

mod client;
mod config;
mod error;
mod pool;

pub use client::RusshSession;
pub use config::ConnectConfig;
pub use error::SshError;
pub use pool::{CheckedOutSession, ConnectionPool, Dialer, RusshDialer, SshTransport};
