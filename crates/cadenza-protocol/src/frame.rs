// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framed transport over any byte stream.
//!
//! A frame is one encoded [`Message`]: a little-endian `u32` body length
//! followed by the body. See [`crate::message`] for the body layout.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{CodecError, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, Message};

/// Errors that can occur while reading or writing frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected reply type: expected {expected}, got {actual}")]
    UnexpectedReply { expected: String, actual: String },
}

/// Write an already-encoded frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), FrameError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::FrameTooLarge(frame.len()));
    }
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw frame, length prefix included, without decoding it.
///
/// EOF before the first byte of a frame is [`FrameError::ConnectionClosed`];
/// EOF inside a frame is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, FrameError> {
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes(header) as usize;
    if length + LENGTH_PREFIX_SIZE > MAX_MESSAGE_SIZE {
        return Err(FrameError::FrameTooLarge(length + LENGTH_PREFIX_SIZE));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length);
    buf.put_slice(&header);
    buf.resize(LENGTH_PREFIX_SIZE + length, 0);
    reader.read_exact(&mut buf[LENGTH_PREFIX_SIZE..]).await?;
    Ok(buf.freeze())
}

/// Write a message to an async writer
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), FrameError> {
    let encoded = message.encode()?;
    write_frame(writer, &encoded).await
}

/// Read and decode a message from an async reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let frame = read_frame(reader).await?;
    Ok(Message::decode(frame)?)
}

/// Framed codec for reading and writing messages on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next message from the stream
    pub async fn read_message(&mut self) -> Result<Message, FrameError> {
        read_message(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a message to the stream
    pub async fn write_message(&mut self, message: &Message) -> Result<(), FrameError> {
        write_message(&mut self.stream, message).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a request and wait for the next message, which must be its reply.
    ///
    /// This is a lock-step exchange with no correlation; use
    /// [`crate::Connection`] when requests and replies interleave.
    pub async fn request(&mut self, request: &Message) -> Result<Message, FrameError> {
        self.write_message(request).await?;

        let reply = self.read_message().await?;
        let expected = request.message_type().reply_type();
        if expected != Some(reply.message_type()) {
            return Err(FrameError::UnexpectedReply {
                expected: expected.map_or_else(|| "none".to_string(), |t| t.to_string()),
                actual: reply.message_type().to_string(),
            });
        }
        Ok(reply)
    }
}
