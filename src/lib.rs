//! pipe-cache: a key-value cache served over a local named pipe
//!
//! A long-running server accepts any number of concurrent clients on a
//! well-known local channel and answers line-oriented text commands:
//! - `SET <key> <value...>` stores a value
//! - `GET <key>` returns the value, or an empty string
//!
//! Features:
//! - One task per connection, all sharing a single synchronized cache
//! - Named pipes on Windows, `SOCK_SEQPACKET` Unix sockets elsewhere
//! - Endpoint errors retried with backoff
//! - Configuration via CLI arguments or TOML file

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;

pub use cache::Cache;
pub use client::{send_command, Client, ClientError};
pub use config::Config;
pub use server::{Server, ServerError};
