// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multiplexed request/reply connection over one byte stream.
//!
//! A [`Connection`] owns a reader task and a writer task. Outbound requests
//! are tagged with a fresh `RequestId` and tracked in a
//! [`CorrelationRegistry`] until the matching reply arrives. Inbound requests
//! are offered to [`MessageHandler::intercept`] on the reader task in arrival
//! order, then handed to [`MessageHandler::handle`], each on its own task.
//!
//! ```ignore
//! let conn = Connection::connect("127.0.0.1:5000", timeout, Arc::new(RejectingHandler)).await?;
//! let reply = conn.send(Message::new(MessageType::PingRequest))?.await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{FrameError, read_message, write_frame};
use crate::message::{CodecError, Message};
use crate::message_type::MessageType;
use crate::registry::{Completion, CorrelationRegistry};

/// Errors that can occur on a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is not a request type")]
    NotARequest(MessageType),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("request timed out after {0}ms")]
    RequestTimeout(u64),
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Active,
    Closing,
    Closed,
}

/// Handles requests initiated by the remote side.
///
/// Returning `Some(reply)` writes the reply back on the same connection.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, connection: Connection, message: Message) -> Option<Message>;

    /// Called on the reader task, in wire order, before `handle`.
    ///
    /// Returning `None` means the handler took the request and answers it
    /// itself through [`Connection::reply`]. Must not block.
    fn intercept(&self, _connection: &Connection, message: Message) -> Option<Message> {
        Some(message)
    }
}

/// Answers every inbound request with an `UnsupportedRequest` error reply.
pub struct RejectingHandler;

#[async_trait]
impl MessageHandler for RejectingHandler {
    async fn handle(&self, _connection: Connection, message: Message) -> Option<Message> {
        let reply = Message::reply_to(&message)?;
        Some(reply.with_error(
            "UnsupportedRequest",
            format!("{} is not handled here", message.message_type()),
        ))
    }
}

struct Inner {
    peer: String,
    registry: Arc<CorrelationRegistry>,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to a live connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Start serving `stream`. Must be called within a Tokio runtime.
    pub fn open<S>(stream: S, handler: Arc<dyn MessageHandler>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::open_named(stream, "stream", handler)
    }

    /// Like [`Connection::open`], with a peer label used in logs.
    pub fn open_named<S>(
        stream: S,
        peer: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Open);

        let connection = Connection {
            inner: Arc::new(Inner {
                peer: peer.into(),
                registry: Arc::new(CorrelationRegistry::new()),
                outbound,
                state,
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(writer_loop(writer, outbound_rx, connection.clone()));
        tokio::spawn(reader_loop(reader, connection.clone(), handler));

        connection.inner.state.send_replace(ConnectionState::Active);
        debug!(peer = %connection.inner.peer, "connection active");
        connection
    }

    /// Connect over TCP.
    #[instrument(skip(handler))]
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Connection, ConnectionError> {
        info!("connecting to engine");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        info!("connected to engine");
        Ok(Self::open_named(stream, addr, handler))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.pending_count()
    }

    /// Send a request and return a handle to its reply.
    ///
    /// Never waits on I/O: the frame is queued for the writer task.
    pub fn send(&self, mut message: Message) -> Result<PendingOperation, ConnectionError> {
        let message_type = message.message_type();
        if !message_type.is_request() {
            return Err(ConnectionError::NotARequest(message_type));
        }
        if !self.is_active() {
            return Err(ConnectionError::ConnectionLost);
        }

        let (id, completion) = self.inner.registry.register()?;
        message.set_request_id(id as i64);

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.registry.forget(id);
                return Err(e.into());
            }
        };
        if self.inner.outbound.send(frame).is_err() {
            self.inner.registry.forget(id);
            return Err(ConnectionError::ConnectionLost);
        }

        debug!(request_id = id, %message_type, "request queued");
        Ok(PendingOperation {
            id,
            completion,
            registry: self.inner.registry.clone(),
            finished: false,
        })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, message: Message) -> Result<Message, ConnectionError> {
        self.send(message)?.await
    }

    /// Send a request and wait at most `timeout` for its reply.
    pub async fn request_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, ConnectionError> {
        let pending = self.send(message)?;
        tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| ConnectionError::RequestTimeout(timeout.as_millis() as u64))?
    }

    /// Queue a reply (or any message that expects no answer).
    pub fn reply(&self, message: Message) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::ConnectionLost);
        }
        let message_type = message.message_type();
        let frame = message.encode()?;
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ConnectionError::ConnectionLost)?;
        debug!(%message_type, "reply queued");
        Ok(())
    }

    /// Close the connection and wait until teardown has finished.
    ///
    /// Frames already queued are flushed before the transport is shut down.
    pub async fn close(&self) {
        self.shutdown();
        self.closed().await;
    }

    /// Start closing the connection without waiting for teardown.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait until the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn dispatch(&self, message: Message, handler: &Arc<dyn MessageHandler>) {
        let message_type = message.message_type();
        if message_type.is_reply() {
            match message.request_id() {
                Ok(id) if id > 0 => {
                    if !self.inner.registry.resolve(id as u64, message) {
                        warn!(request_id = id, %message_type, "dropping reply with no pending request");
                    }
                }
                Ok(id) => warn!(request_id = id, %message_type, "dropping reply without request id"),
                Err(e) => warn!(error = %e, %message_type, "dropping reply with malformed request id"),
            }
            return;
        }

        debug!(%message_type, "inbound request");
        let Some(message) = handler.intercept(self, message) else {
            return;
        };
        let handler = handler.clone();
        let connection = self.clone();
        tokio::spawn(async move {
            if let Some(reply) = handler.handle(connection.clone(), message).await
                && let Err(e) = connection.reply(reply)
            {
                debug!(error = %e, %message_type, "could not send reply");
            }
        });
    }

    fn teardown(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Active || *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        self.inner.shutdown.cancel();

        let failed = self.inner.registry.fail_all();
        if failed > 0 {
            info!(peer = %self.inner.peer, pending = failed, "failed pending requests: connection lost");
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        info!(peer = %self.inner.peer, "connection closed");
    }
}

async fn reader_loop<R>(mut reader: R, connection: Connection, handler: Arc<dyn MessageHandler>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = connection.inner.shutdown.clone();
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = read_message(&mut reader) => result,
        };

        match result {
            Ok(message) => connection.dispatch(message, &handler),
            Err(FrameError::ConnectionClosed) => {
                debug!(peer = %connection.inner.peer, "peer closed connection");
                break;
            }
            Err(e) => {
                error!(peer = %connection.inner.peer, error = %e, "protocol error, closing connection");
                break;
            }
        }
    }
    connection.teardown();
}

async fn writer_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    connection: Connection,
) where
    W: AsyncWrite + Unpin,
{
    let shutdown = connection.inner.shutdown.clone();
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(peer = %connection.inner.peer, error = %e, "write failed, closing connection");
            shutdown.cancel();
            return;
        }
    }

    // flush whatever was queued before shutdown, e.g. a terminate reply
    while let Ok(frame) = outbound.try_recv() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// An outstanding request. Resolves with the reply or `ConnectionLost`.
///
/// Dropping it before resolution forgets the registry entry, so a late
/// reply is treated as unmatched.
pub struct PendingOperation {
    id: u64,
    completion: oneshot::Receiver<Completion>,
    registry: Arc<CorrelationRegistry>,
    finished: bool,
}

impl PendingOperation {
    /// Correlation id stamped on the request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingOperation {
    type Output = Result<Message, ConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.completion).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(ConnectionError::ConnectionLost))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.forget(self.id);
        }
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramedStream, read_message as read_raw};
    use crate::props;

    struct PingHandler;

    #[async_trait]
    impl MessageHandler for PingHandler {
        async fn handle(&self, _connection: Connection, message: Message) -> Option<Message> {
            Message::reply_to(&message)
        }
    }

    #[tokio::test]
    async fn test_send_assigns_request_ids() {
        let (local, remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));
        let mut remote = FramedStream::new(remote);

        let first = conn.send(Message::new(MessageType::PingRequest)).unwrap();
        let second = conn.send(Message::new(MessageType::PingRequest)).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);

        let m1 = remote.read_message().await.unwrap();
        let m2 = remote.read_message().await.unwrap();
        assert_eq!(m1.request_id().unwrap(), 1);
        assert_eq!(m2.request_id().unwrap(), 2);

        // answer out of order
        remote
            .write_message(&Message::reply_to(&m2).unwrap().with_string("n", "two"))
            .await
            .unwrap();
        remote
            .write_message(&Message::reply_to(&m1).unwrap().with_string("n", "one"))
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().get_string("n", "").unwrap(), "one");
        assert_eq!(second.await.unwrap().get_string("n", "").unwrap(), "two");
    }

    #[tokio::test]
    async fn test_send_rejects_reply_types() {
        let (local, _remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));
        let result = conn.send(Message::new(MessageType::PingReply));
        assert!(matches!(result, Err(ConnectionError::NotARequest(_))));
    }

    #[tokio::test]
    async fn test_inbound_request_is_handled() {
        let (local, remote) = tokio::io::duplex(4096);
        let _conn = Connection::open(local, Arc::new(PingHandler));
        let mut remote = FramedStream::new(remote);

        let request = Message::new(MessageType::PingRequest).with_i64(props::REQUEST_ID, 500);
        let reply = remote.request(&request).await.unwrap();
        assert_eq!(reply.request_id().unwrap(), 500);
    }

    /// Records heartbeat sequence numbers as they come off the wire.
    struct OrderedHandler {
        seen: std::sync::Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MessageHandler for OrderedHandler {
        async fn handle(&self, _connection: Connection, message: Message) -> Option<Message> {
            Message::reply_to(&message)
        }

        fn intercept(&self, connection: &Connection, message: Message) -> Option<Message> {
            if message.message_type() != MessageType::HeartbeatRequest {
                return Some(message);
            }
            let n = message.get_i64("n", 0).unwrap();
            self.seen.lock().unwrap().push(n);
            connection.reply(Message::reply_to(&message)?).unwrap();
            None
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_intercept_sees_requests_in_wire_order() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(OrderedHandler {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let _conn = Connection::open(local, handler.clone());
        let mut remote = FramedStream::new(remote);

        for n in 1..=200 {
            let request = Message::new(MessageType::HeartbeatRequest)
                .with_i64(props::REQUEST_ID, n)
                .with_i64("n", n);
            remote.write_message(&request).await.unwrap();
        }
        for n in 1..=200 {
            let reply = remote.read_message().await.unwrap();
            assert_eq!(reply.message_type(), MessageType::HeartbeatReply);
            assert_eq!(reply.request_id().unwrap(), n);
        }
        assert_eq!(*handler.seen.lock().unwrap(), (1..=200).collect::<Vec<_>>());

        // requests the handler passes on still reach handle()
        let reply = remote
            .request(&Message::new(MessageType::PingRequest).with_i64(props::REQUEST_ID, 900))
            .await
            .unwrap();
        assert_eq!(reply.request_id().unwrap(), 900);
    }

    #[tokio::test]
    async fn test_shutdown_closes_without_waiting() {
        let (local, _remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));
        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_rejecting_handler_replies_with_error() {
        let (local, remote) = tokio::io::duplex(4096);
        let _conn = Connection::open(local, Arc::new(RejectingHandler));
        let mut remote = FramedStream::new(remote);

        let reply = remote
            .request(&Message::new(MessageType::HeartbeatRequest))
            .await
            .unwrap();
        let error = reply.reply_error().unwrap().unwrap();
        assert_eq!(error.error_type, "UnsupportedRequest");
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let (local, remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));

        let pending = conn.send(Message::new(MessageType::PingRequest)).unwrap();
        drop(remote);

        assert!(matches!(pending.await, Err(ConnectionError::ConnectionLost)));
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.send(Message::new(MessageType::PingRequest)),
            Err(ConnectionError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_queued_replies() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));

        conn.reply(Message::new(MessageType::TerminateReply)).unwrap();
        conn.close().await;

        let flushed = read_raw(&mut remote).await.unwrap();
        assert_eq!(flushed.message_type(), MessageType::TerminateReply);
        assert!(matches!(
            read_raw(&mut remote).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_with_timeout_forgets_entry() {
        let (local, _remote) = tokio::io::duplex(4096);
        let conn = Connection::open(local, Arc::new(RejectingHandler));

        let result = conn
            .request_with_timeout(
                Message::new(MessageType::PingRequest),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(ConnectionError::RequestTimeout(20))));
        assert_eq!(conn.pending_count(), 0);
    }
}
