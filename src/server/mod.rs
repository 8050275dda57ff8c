//! TCP server: listeners, accepters, shutdown.

pub mod config;
mod connection;
pub mod shards;

pub use config::{Config, LogLevel};
pub use connection::Connection;
pub use shards::ShardPool;

use crate::hash::{HashSeed, SeededHasher};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The kvi server: bound listeners plus the running shard set.
pub struct Server {
    config: Config,
    listeners: Vec<Arc<TcpListener>>,
    pool: Arc<ShardPool>,
    hasher: SeededHasher,
    running: AtomicBool,
    shutdown: Notify,
    next_connection_id: AtomicU64,
}

impl Server {
    /// Bind every configured address and spawn the shard tasks, with a
    /// fresh random hash seed.
    pub async fn bind(config: Config) -> io::Result<Server> {
        Self::bind_seeded(config, HashSeed::random()).await
    }

    /// Bind with an explicit seed, for reproducible shard assignment.
    pub async fn bind_seeded(config: Config, seed: HashSeed) -> io::Result<Server> {
        let hasher = SeededHasher::from_seed(seed);
        let pool = Arc::new(ShardPool::spawn(config.shards, &hasher));

        let mut listeners = Vec::with_capacity(config.ips.len());
        for ip in &config.ips {
            let listener = TcpListener::bind((*ip, config.port)).await?;
            info!("listening on {}", listener.local_addr()?);
            listeners.push(Arc::new(listener));
        }

        Ok(Server {
            config,
            listeners,
            pool,
            hasher,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// The addresses actually bound; useful when the port was 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let mut accepters = Vec::new();
        for listener in &self.listeners {
            for accepter in 0..self.config.accepters {
                let server = self.clone();
                let listener = listener.clone();
                accepters.push(tokio::spawn(async move {
                    server.accept_loop(listener, accepter).await;
                }));
            }
        }
        info!(
            shards = self.pool.len(),
            accepters = accepters.len(),
            "ready to accept connections"
        );

        self.shutdown.notified().await;
        info!("shutdown signal received");
        self.running.store(false, Ordering::SeqCst);

        for handle in &accepters {
            handle.abort();
        }
        for handle in accepters {
            let _ = handle.await;
        }
        info!("kvi is ready to exit, bye bye...");
        Ok(())
    }

    /// Ask the server to stop accepting and return from `run`.
    ///
    /// Connections mid-pipeline are dropped with the runtime.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<TcpListener>, accepter: usize) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    if let Err(err) = socket.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY: {err}");
                    }
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let connection =
                        Connection::new(id, peer, self.hasher.clone(), self.pool.clone());
                    tokio::spawn(connection.run(socket));
                }
                Err(err) => {
                    // A failing accept during teardown is a normal exit.
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(accepter, "accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        debug!(accepter, "accepter exiting");
    }
}
