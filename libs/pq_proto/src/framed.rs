//! Buffered reading/writing of Postgres protocol messages on top of a raw
//! byte stream. Message parsing itself lives in the crate root; this module
//! only moves bytes.
//!
//! All reads are incremental: a partially received message stays in the read
//! buffer across calls, which makes the read futures safe to drop at any
//! await point (important for the poll-without-blocking uses).

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{BeMessage, FeMessage, FeStartupPacket, ProtocolError};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Error on the connection: either IO or bytes which can't be parsed.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Flatten into io::Error, for callers which only deal in those.
    pub fn into_io_error(self) -> io::Error {
        match self {
            ConnectionError::Io(io) => io,
            ConnectionError::Protocol(pe) => io::Error::new(io::ErrorKind::Other, pe.to_string()),
        }
    }
}

/// Wraps the stream with the in-memory read and write buffers.
pub struct Framed<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framed<S> {
    pub fn new(stream: S) -> Self {
        Framed {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            write_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Get a shared reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Deconstruct into the underlying stream and read buffer.
    pub fn into_inner(self) -> (S, BytesMut) {
        (self.stream, self.read_buf)
    }

    /// Read a startup message from the stream. `Ok(None)` means the
    /// connection was closed cleanly before anything arrived.
    pub async fn read_startup_message(
        &mut self,
    ) -> Result<Option<FeStartupPacket>, ConnectionError> {
        read_message(&mut self.stream, &mut self.read_buf, FeStartupPacket::parse).await
    }

    /// Read a regular frontend message. `Ok(None)` on clean EOF between
    /// messages; EOF mid-message is a protocol error.
    pub async fn read_message(&mut self) -> Result<Option<FeMessage>, ConnectionError> {
        read_message(&mut self.stream, &mut self.read_buf, FeMessage::parse).await
    }

    /// Read one raw `(tag, body)` frame, the client-side direction where the
    /// caller classifies backend messages itself.
    pub async fn read_raw_message(&mut self) -> Result<Option<(u8, Bytes)>, ConnectionError> {
        read_message(&mut self.stream, &mut self.read_buf, crate::parse_raw_message).await
    }

    /// Write next message to the output buffer; doesn't flush.
    pub fn write_message(&mut self, msg: &BeMessage<'_>) -> Result<(), ProtocolError> {
        BeMessage::write(&mut self.write_buf, msg)
    }

    /// Write a frontend message to the output buffer (client side).
    pub fn write_fe_message(&mut self, msg: &FeMessage) -> Result<(), ProtocolError> {
        FeMessage::write(&mut self.write_buf, msg)
    }

    /// Write a startup packet to the output buffer (client side).
    pub fn write_startup_message<'a, I>(&mut self, params: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        FeStartupPacket::write_startup_message(&mut self.write_buf, params);
    }

    /// Write a single raw byte, bypassing message framing. Only used for the
    /// one-byte SSL negotiation answer.
    pub fn write_raw_byte(&mut self, byte: u8) {
        use bytes::BufMut;
        self.write_buf.put_u8(byte);
    }

    /// Flush the output buffer into the stream.
    pub async fn flush(&mut self) -> Result<(), io::Error> {
        while self.write_buf.has_remaining() {
            let bytes_written = self.stream.write_buf(&mut self.write_buf).await?;
            if bytes_written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write message",
                ));
            }
        }
        self.write_buf.clear();
        self.stream.flush().await
    }

    /// Flush and cleanly shut down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), io::Error> {
        self.flush().await?;
        self.stream.shutdown().await
    }
}

/// Read until `parse` is able to assemble a full message from the buffer.
async fn read_message<S, M, P>(
    stream: &mut S,
    read_buf: &mut BytesMut,
    parse: P,
) -> Result<Option<M>, ConnectionError>
where
    S: AsyncRead + Unpin,
    P: Fn(&mut BytesMut) -> Result<Option<M>, ProtocolError>,
{
    loop {
        if let Some(message) = parse(read_buf)? {
            return Ok(Some(message));
        }
        if stream.read_buf(read_buf).await? == 0 {
            if read_buf.has_remaining() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF with unprocessed data in the buffer",
                )
                .into());
            }
            return Ok(None); // clean EOF
        }
    }
}
