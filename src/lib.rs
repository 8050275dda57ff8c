//! # kvi
//!
//! A sharded in-memory key-value server speaking a RESP3 subset.
//!
//! A client opens a TCP connection, optionally issues a `HELLO 3`
//! handshake, and then sends pipelined `GET`/`SET`/`DEL`/`KEYS` commands.
//! All data lives in RAM, partitioned across a fixed set of shards that
//! each own a disjoint slice of the keyspace:
//!
//! - commands are parsed straight off the socket, with no intermediate
//!   frame buffer ([`protocol`]),
//! - every key is routed to exactly one shard via rendezvous hashing
//!   ([`server::shards`]),
//! - each shard owns a Robin Hood hash map and a block bump allocator
//!   with compaction ([`storage`]).
//!
//! Shards, connections and accepters are independent tokio tasks that
//! communicate only by message passing; the client stream itself moves
//! between the connection task and the shard executing its current
//! command, which is what serializes per-connection requests.
//!
//! ## Example
//!
//! ```no_run
//! use kvi::{Config, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Arc::new(Server::bind(Config::default()).await?);
//!     server.run().await
//! }
//! ```

#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(clippy::module_name_repetitions)]

/// Error types and result aliases.
pub mod error;
/// Seeded keyed hashing shared across tasks.
pub mod hash;
/// RESP3 streaming parser and reply generator.
pub mod protocol;
/// TCP server, connections, shard routing.
pub mod server;
/// Per-shard map and allocator.
pub mod storage;

pub use error::{ConfigError, ConnError};
pub use hash::{HashSeed, SeededHasher};
pub use protocol::{Command, RespStream};
pub use server::{Config, LogLevel, Server};
pub use storage::{Allocator, Key, Map, Value};

/// Crate version (from Cargo.toml), reported in `HELLO` and `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name reported in the `HELLO` response map.
pub const SERVER_NAME: &str = "kvi";

/// The only protocol version the server speaks.
pub const PROTOCOL_VERSION: i64 = 3;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 20252;
