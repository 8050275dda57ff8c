//! Streaming RESP parser and generator over a client socket.
//!
//! Reads go through a short fixed buffer; bulk payloads are copied out of
//! whatever that buffer holds and then read from the socket straight into
//! their destination, so values never pass through an intermediate
//! message buffer. Replies coalesce into a staging buffer that is flushed
//! before the stream blocks for a new pipeline; payloads too large to be
//! worth staging bypass the buffer entirely.

use crate::error::ConnError;
use crate::hash::SeededHasher;
use crate::protocol::command::Command;
use crate::protocol::{markers, CRLF};
use crate::storage::alloc::ValueSource;
use crate::storage::map::Key;
use crate::{PROTOCOL_VERSION, SERVER_NAME, VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed read buffer.
const READ_BUF_SIZE: usize = 128;

/// Bulk payloads above this skip the staging buffer on writes.
const WRITE_BYPASS: usize = 128;

/// RESP stream over a client connection.
///
/// Generic over the transport so the codec can be exercised against an
/// in-memory duplex pipe; the server always instantiates it with a
/// `TcpStream`. The stream value moves between the connection task and
/// whichever shard is executing its current command.
#[derive(Debug)]
pub struct RespStream<S> {
    io: S,
    rbuf: [u8; READ_BUF_SIZE],
    rpos: usize,
    rlen: usize,
    wbuf: BytesMut,
    /// Bulk strings left in the current pipeline. Signed: the handshake
    /// frame declares one element but carries two, and only
    /// [`read_pipeline_command`](Self::read_pipeline_command) opens a new
    /// pipeline.
    remaining: i64,
}

impl<S> RespStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport.
    pub fn new(io: S) -> Self {
        Self {
            io,
            rbuf: [0; READ_BUF_SIZE],
            rpos: 0,
            rlen: 0,
            wbuf: BytesMut::with_capacity(512),
            remaining: 0,
        }
    }

    // ── parsing ──────────────────────────────────────────────────────

    async fn fill(&mut self) -> Result<(), ConnError> {
        self.rpos = 0;
        self.rlen = self.io.read(&mut self.rbuf).await.map_err(ConnError::from)?;
        if self.rlen == 0 {
            return Err(ConnError::Closed);
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, ConnError> {
        if self.rpos == self.rlen {
            self.fill().await?;
        }
        let byte = self.rbuf[self.rpos];
        self.rpos += 1;
        Ok(byte)
    }

    async fn expect_byte(&mut self, want: u8) -> Result<(), ConnError> {
        if self.read_byte().await? != want {
            return Err(ConnError::invalid_syntax());
        }
        Ok(())
    }

    async fn expect_crlf(&mut self) -> Result<(), ConnError> {
        self.expect_byte(b'\r').await?;
        self.expect_byte(b'\n').await
    }

    /// Signed decimal terminated by CRLF. `+0` and `-0` parse to zero and
    /// leading zeros are permitted; accumulation wraps on overflow since
    /// protocol sizes never approach the integer range in practice.
    async fn read_int(&mut self) -> Result<i64, ConnError> {
        let mut byte = self.read_byte().await?;
        let negative = match byte {
            b'+' | b'-' => {
                let sign = byte == b'-';
                byte = self.read_byte().await?;
                sign
            }
            _ => false,
        };
        if !byte.is_ascii_digit() {
            return Err(ConnError::invalid_syntax());
        }
        let mut value = i64::from(byte - b'0');
        loop {
            match self.read_byte().await? {
                digit @ b'0'..=b'9' => {
                    value = value
                        .wrapping_mul(10)
                        .wrapping_add(i64::from(digit - b'0'));
                }
                b'\r' => {
                    self.expect_byte(b'\n').await?;
                    return Ok(if negative { value.wrapping_neg() } else { value });
                }
                _ => return Err(ConnError::invalid_syntax()),
            }
        }
    }

    async fn read_bulk_len(&mut self) -> Result<usize, ConnError> {
        self.expect_byte(markers::BULK).await?;
        let len = self.read_int().await?;
        usize::try_from(len).map_err(|_| ConnError::invalid_syntax())
    }

    async fn read_bulk(&mut self) -> Result<Vec<u8>, ConnError> {
        let len = self.read_bulk_len().await?;
        let mut payload = vec![0u8; len];
        self.read_exact_into(&mut payload).await?;
        self.expect_crlf().await?;
        Ok(payload)
    }

    /// Fill `buf` from the read buffer first, then the socket directly.
    async fn read_exact_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let buffered = (self.rlen - self.rpos).min(buf.len());
        buf[..buffered].copy_from_slice(&self.rbuf[self.rpos..self.rpos + buffered]);
        self.rpos += buffered;
        if buffered < buf.len() {
            self.io.read_exact(&mut buf[buffered..]).await?;
        }
        Ok(())
    }

    async fn discard(&mut self, mut n: usize) -> Result<(), ConnError> {
        while n > 0 {
            if self.rpos == self.rlen {
                self.fill().await?;
            }
            let take = (self.rlen - self.rpos).min(n);
            self.rpos += take;
            n -= take;
        }
        Ok(())
    }

    // ── pipeline operations ──────────────────────────────────────────

    /// Read the outer array header of a new pipeline.
    ///
    /// Staged replies from the previous pipeline are flushed first, since
    /// this is where the stream may block waiting on the client.
    pub async fn start_pipeline(&mut self) -> Result<(), ConnError> {
        self.flush().await?;
        self.expect_byte(markers::ARRAY).await?;
        self.remaining = self.read_int().await?;
        Ok(())
    }

    /// Read one command name, opening a new pipeline when the current one
    /// is exhausted.
    pub async fn read_pipeline_command(&mut self) -> Result<Command, ConnError> {
        if self.remaining <= 0 {
            self.start_pipeline().await?;
        }
        self.remaining -= 1;
        let name = self.read_bulk().await?;
        Command::parse(&name).ok_or_else(|| ConnError::invalid_command(&name))
    }

    /// Read one bulk string argument as UTF-8 text.
    pub async fn read_pipeline_string(&mut self) -> Result<String, ConnError> {
        self.remaining -= 1;
        let payload = self.read_bulk().await?;
        String::from_utf8(payload).map_err(|_| ConnError::invalid_syntax())
    }

    /// Read one bulk string argument into an owned buffer.
    pub async fn read_pipeline_bytes(&mut self) -> Result<Bytes, ConnError> {
        self.remaining -= 1;
        Ok(self.read_bulk().await?.into())
    }

    /// Read a key argument and hash it once.
    pub async fn read_key(&mut self, hasher: &SeededHasher) -> Result<Key, ConnError> {
        let name = self.read_pipeline_bytes().await?;
        let hash = hasher.hash(&name);
        Ok(Key { name, hash })
    }

    /// Read the header of a value argument; the payload itself is read by
    /// the allocator through the [`ValueSource`] impl, followed by
    /// [`read_value_trailer`](Self::read_value_trailer).
    pub async fn read_value_header(&mut self) -> Result<usize, ConnError> {
        self.remaining -= 1;
        self.read_bulk_len().await
    }

    /// Consume the CRLF after a value payload.
    pub async fn read_value_trailer(&mut self) -> Result<(), ConnError> {
        self.expect_crlf().await
    }

    /// Drain the bulk strings left in the current pipeline, resynchronizing
    /// the stream after a soft error.
    pub async fn skip_remaining_strings(&mut self) -> Result<(), ConnError> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let len = self.read_bulk_len().await?;
            self.discard(len).await?;
            self.expect_crlf().await?;
        }
        Ok(())
    }

    // ── generation ───────────────────────────────────────────────────

    /// Stage `+OK`.
    pub fn write_ok(&mut self) {
        self.wbuf.extend_from_slice(b"+OK\r\n");
    }

    /// Stage the nil bulk string.
    pub fn write_nil(&mut self) {
        self.wbuf.extend_from_slice(b"$-1\r\n");
    }

    /// Stage an integer reply.
    pub fn write_int(&mut self, value: i64) {
        self.wbuf.put_u8(markers::INTEGER);
        self.wbuf.extend_from_slice(value.to_string().as_bytes());
        self.wbuf.extend_from_slice(CRLF);
    }

    /// Stage an `-ERR` reply.
    pub fn write_error(&mut self, message: &str) {
        self.wbuf.put_u8(markers::ERROR);
        self.wbuf.extend_from_slice(b"ERR ");
        self.wbuf.extend_from_slice(message.as_bytes());
        self.wbuf.extend_from_slice(CRLF);
    }

    /// Stage a map header.
    pub fn write_map_header(&mut self, entries: usize) {
        self.wbuf.put_u8(markers::MAP);
        self.wbuf.extend_from_slice(entries.to_string().as_bytes());
        self.wbuf.extend_from_slice(CRLF);
    }

    /// Stage an array header.
    pub fn write_array_header(&mut self, entries: usize) {
        self.wbuf.put_u8(markers::ARRAY);
        self.wbuf.extend_from_slice(entries.to_string().as_bytes());
        self.wbuf.extend_from_slice(CRLF);
    }

    fn put_bulk(&mut self, payload: &[u8]) {
        self.wbuf.put_u8(markers::BULK);
        self.wbuf.extend_from_slice(payload.len().to_string().as_bytes());
        self.wbuf.extend_from_slice(CRLF);
        self.wbuf.extend_from_slice(payload);
        self.wbuf.extend_from_slice(CRLF);
    }

    /// Write a bulk string reply.
    ///
    /// Payloads above the staging threshold are written directly to the
    /// socket after the header; small ones coalesce with neighbouring
    /// replies to cut syscalls.
    pub async fn write_bulk_string(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() <= WRITE_BYPASS {
            self.put_bulk(payload);
            return Ok(());
        }
        self.wbuf.put_u8(markers::BULK);
        self.wbuf.extend_from_slice(payload.len().to_string().as_bytes());
        self.wbuf.extend_from_slice(CRLF);
        self.flush().await?;
        self.io.write_all(payload).await.map_err(ConnError::from)?;
        self.wbuf.extend_from_slice(CRLF);
        Ok(())
    }

    /// Stage the `HELLO` response map.
    pub fn write_hello_response(&mut self) {
        self.write_map_header(3);
        self.put_bulk(b"server");
        self.put_bulk(SERVER_NAME.as_bytes());
        self.put_bulk(b"version");
        self.put_bulk(VERSION.as_bytes());
        self.put_bulk(b"proto");
        self.write_int(PROTOCOL_VERSION);
    }

    /// Flush staged replies to the socket.
    pub async fn flush(&mut self) -> Result<(), ConnError> {
        if !self.wbuf.is_empty() {
            self.io.write_all(&self.wbuf).await.map_err(ConnError::from)?;
            self.wbuf.clear();
        }
        self.io.flush().await.map_err(ConnError::from)
    }
}

impl<S> ValueSource for RespStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact_into(buf).await
    }
}
