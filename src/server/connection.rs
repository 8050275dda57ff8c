//! Per-connection task.
//!
//! The connection reads commands, routes single-key operations to the
//! owning shard and `KEYS` through the whole shard chain, then idles
//! until the shard hands the stream back. Only one command is ever in
//! flight per connection, which preserves reply order under pipelining.

use crate::error::ConnError;
use crate::hash::SeededHasher;
use crate::protocol::{Command, RespStream};
use crate::server::shards::ShardPool;
use crate::storage::shard::{ClientStream, KeysReply, OpReply, ShardMessage};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// State for one client connection.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    hasher: SeededHasher,
    pool: Arc<ShardPool>,
}

impl Connection {
    /// A connection handler for an accepted socket.
    pub fn new(id: u64, peer: SocketAddr, hasher: SeededHasher, pool: Arc<ShardPool>) -> Self {
        Self {
            id,
            peer,
            hasher,
            pool,
        }
    }

    /// Serve the connection until the client goes away or a hard error
    /// tears it down.
    pub async fn run(self, socket: TcpStream) {
        debug!(id = self.id, peer = %self.peer, "client connected");
        let mut stream = RespStream::new(socket);
        loop {
            match self.step(stream).await {
                Some(returned) => stream = returned,
                None => break,
            }
        }
        debug!(id = self.id, peer = %self.peer, "client disconnected");
    }

    /// Execute one command. Returns the stream to keep serving, or `None`
    /// once the connection is finished.
    async fn step(&self, mut stream: ClientStream) -> Option<ClientStream> {
        let command = match stream.read_pipeline_command().await {
            Ok(command) => command,
            Err(err) => return self.report(stream, err).await,
        };

        match command {
            Command::Hello => match self.handshake(&mut stream).await {
                Ok(()) => Some(stream),
                Err(err) => self.report(stream, err).await,
            },
            Command::Get | Command::Set | Command::Del => {
                let key = match stream.read_key(&self.hasher).await {
                    Ok(key) => key,
                    Err(err) => return self.report(stream, err).await,
                };
                let shard = self.pool.select(key.hash);
                let (resume, handback) = oneshot::channel();
                let message = match command {
                    Command::Get => ShardMessage::Get {
                        key,
                        stream,
                        resume,
                    },
                    Command::Set => ShardMessage::Set {
                        key,
                        stream,
                        resume,
                    },
                    Command::Del => ShardMessage::Del {
                        key,
                        stream,
                        resume,
                    },
                    _ => unreachable!("single-key commands only"),
                };
                if shard.send(message).await.is_err() {
                    return None;
                }
                let OpReply { stream, result } = handback.await.ok()?;
                match result {
                    Ok(()) => Some(stream),
                    Err(err) => self.report(stream, err).await,
                }
            }
            Command::Keys => {
                let first = self.pool.senders().first()?;
                let rest: VecDeque<_> = self.pool.senders()[1..].iter().cloned().collect();
                let (resume, handback) = oneshot::channel();
                let message = ShardMessage::Keys {
                    stream,
                    names: Vec::new(),
                    rest,
                    resume,
                };
                if first.send(message).await.is_err() {
                    return None;
                }
                let KeysReply { mut stream, names } = handback.await.ok()?;
                stream.write_array_header(names.len());
                for name in &names {
                    if let Err(err) = stream.write_bulk_string(name).await {
                        return self.report(stream, err).await;
                    }
                }
                Some(stream)
            }
        }
    }

    /// `HELLO <proto>`: reply with the server map, or reject the version.
    async fn handshake(&self, stream: &mut ClientStream) -> Result<(), ConnError> {
        let version = stream.read_pipeline_string().await?;
        if version != "3" {
            return Err(ConnError::unsupported_protocol(&version));
        }
        stream.write_hello_response();
        Ok(())
    }

    /// Dispatch an error per its disposition. Returns the stream when the
    /// connection survives.
    async fn report(&self, mut stream: ClientStream, err: ConnError) -> Option<ClientStream> {
        match err {
            ConnError::Soft(message) => {
                stream.write_error(&message);
                if stream.skip_remaining_strings().await.is_err() {
                    let _ = stream.flush().await;
                    return None;
                }
                Some(stream)
            }
            ConnError::Hard(message) => {
                stream.write_error(&message);
                let _ = stream.flush().await;
                None
            }
            ConnError::Closed => None,
            ConnError::ReadWrite(io_err) => {
                debug!(id = self.id, peer = %self.peer, error = %io_err, "connection I/O error");
                None
            }
        }
    }
}
