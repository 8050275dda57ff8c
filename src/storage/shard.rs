//! Shard task: exclusive owner of one map and one allocator.
//!
//! A shard processes one message at a time to completion. The client
//! stream arrives inside the message, the shard reads any value bytes
//! and writes the reply through it, then hands it back to the connection
//! task, so per-connection ordering falls out of ownership rather than
//! locks.

use crate::error::ConnError;
use crate::protocol::RespStream;
use crate::storage::alloc::Allocator;
use crate::storage::map::{Key, Map};
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// The stream type shards and connections exchange.
pub type ClientStream = RespStream<TcpStream>;

/// One command, dispatched to the shard owning the key.
pub enum ShardMessage {
    /// Look the key up and write the bulk string or nil reply.
    Get {
        /// The key, hashed by the connection.
        key: Key,
        /// The client stream, moved in for the duration of the command.
        stream: ClientStream,
        /// Hands the stream back to the connection.
        resume: oneshot::Sender<OpReply>,
    },
    /// Read the value off the stream, store it, write `+OK`.
    Set {
        /// The key, hashed by the connection.
        key: Key,
        /// The client stream; the value bytes are still unread on it.
        stream: ClientStream,
        /// Hands the stream back to the connection.
        resume: oneshot::Sender<OpReply>,
    },
    /// Remove the key and write `:0` or `:1`.
    Del {
        /// The key, hashed by the connection.
        key: Key,
        /// The client stream, moved in for the duration of the command.
        stream: ClientStream,
        /// Hands the stream back to the connection.
        resume: oneshot::Sender<OpReply>,
    },
    /// Append this shard's key names and pass the message along.
    Keys {
        /// The client stream, carried through the whole shard chain.
        stream: ClientStream,
        /// Names collected from the shards visited so far.
        names: Vec<Bytes>,
        /// Mailboxes of the shards still to visit.
        rest: VecDeque<mpsc::Sender<ShardMessage>>,
        /// Returns the stream and the complete listing to the connection.
        resume: oneshot::Sender<KeysReply>,
    },
}

/// Resumes a connection after a single-key command.
pub struct OpReply {
    /// The client stream, handed back.
    pub stream: ClientStream,
    /// Outcome; errors propagate to the connection's error dispatch.
    pub result: Result<(), ConnError>,
}

/// Resumes a connection after a `KEYS` chain completes.
pub struct KeysReply {
    /// The client stream, handed back.
    pub stream: ClientStream,
    /// Every shard's key names, in visit order.
    pub names: Vec<Bytes>,
}

/// A shard: one map, one allocator, one mailbox.
pub struct Shard {
    id: usize,
    map: Map,
    alloc: Allocator,
}

impl Shard {
    /// An empty shard.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            map: Map::new(),
            alloc: Allocator::new(),
        }
    }

    /// Process messages until every sender is gone.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<ShardMessage>) {
        debug!(shard = self.id, "shard task started");
        while let Some(message) = mailbox.recv().await {
            match message {
                ShardMessage::Get {
                    key,
                    mut stream,
                    resume,
                } => {
                    let result = self.get(&mut stream, &key).await;
                    let _ = resume.send(OpReply { stream, result });
                }
                ShardMessage::Set {
                    key,
                    mut stream,
                    resume,
                } => {
                    let result = self.set(&mut stream, key).await;
                    let _ = resume.send(OpReply { stream, result });
                }
                ShardMessage::Del {
                    key,
                    mut stream,
                    resume,
                } => {
                    let result = self.del(&mut stream, &key).await;
                    let _ = resume.send(OpReply { stream, result });
                }
                ShardMessage::Keys {
                    stream,
                    mut names,
                    mut rest,
                    resume,
                } => {
                    names.extend(self.map.keys().cloned());
                    match rest.pop_front() {
                        Some(next) => {
                            let _ = next
                                .send(ShardMessage::Keys {
                                    stream,
                                    names,
                                    rest,
                                    resume,
                                })
                                .await;
                        }
                        None => {
                            let _ = resume.send(KeysReply { stream, names });
                        }
                    }
                }
            }
        }
        debug!(shard = self.id, "shard task exiting");
    }

    async fn get<S>(&mut self, stream: &mut RespStream<S>, key: &Key) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.map.get(key) {
            Some(value) => {
                let payload = self.alloc.bytes(value);
                stream.write_bulk_string(payload).await?;
            }
            None => stream.write_nil(),
        }
        Ok(())
    }

    async fn set<S>(&mut self, stream: &mut RespStream<S>, key: Key) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let size = stream.read_value_header().await?;
        let value = self.alloc.allocate(stream, size).await?;
        stream.read_value_trailer().await?;
        if let Some(old) = self.map.set(key, value) {
            self.alloc.release(old);
        }
        self.maybe_defragment().await?;
        stream.write_ok();
        Ok(())
    }

    async fn del<S>(&mut self, stream: &mut RespStream<S>, key: &Key) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.map.remove(key) {
            Some(old) => {
                self.alloc.release(old);
                self.maybe_defragment().await?;
                stream.write_int(1);
            }
            None => stream.write_int(0),
        }
        Ok(())
    }

    async fn maybe_defragment(&mut self) -> Result<(), ConnError> {
        if self.alloc.should_defragment() {
            debug!(shard = self.id, "compacting fragmented blocks");
            self.alloc.defragment(&mut self.map).await?;
        }
        Ok(())
    }
}
