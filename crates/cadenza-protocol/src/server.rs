// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server helpers: the echo loopback endpoint and a generic server that
//! serves each accepted socket as a [`Connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, MessageHandler};
use crate::frame::{FrameError, read_frame, write_frame};
use crate::message::Message;

/// Errors that can occur in the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("server closed")]
    Closed,
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrently served connections (0 for unlimited)
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `CADENZA_ECHO_ADDR`: Address to bind (default: 127.0.0.1:5001)
    /// - `CADENZA_MAX_CONNECTIONS`: Max concurrent connections, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: std::env::var("CADENZA_ECHO_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.bind_addr),
            max_connections: std::env::var("CADENZA_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_connections),
        }
    }
}

/// Echo a message stream back to its sender, byte for byte.
///
/// Each inbound frame is decoded to validate it, then the original bytes are
/// written back unchanged. Returns when the peer closes the stream.
pub async fn serve_echo<S>(stream: S) -> Result<u64, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut echoed = 0u64;
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(echoed),
            Err(e) => return Err(e.into()),
        };
        let message = Message::decode(frame.clone()).map_err(FrameError::from)?;
        debug!(message_type = %message.message_type(), len = frame.len(), "echo");
        write_frame(&mut writer, &frame).await?;
        echoed += 1;
    }
}

/// TCP server for the message protocol
pub struct ProtocolServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl ProtocolServer {
    /// Bind a new server with the given configuration
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %config.bind_addr,
            max_connections = config.max_connections,
            "server bound"
        );
        Ok(Self { listener, config })
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    fn limiter(&self) -> Option<Arc<Semaphore>> {
        (self.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_connections as usize)))
    }

    /// Run the echo loopback on every accepted connection
    #[instrument(skip(self))]
    pub async fn run_echo(&self) -> Result<(), ServerError> {
        info!("echo server running");
        let semaphore = self.limiter();

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                debug!(%remote_addr, "accepted connection");
                let _ = stream.set_nodelay(true);
                match serve_echo(stream).await {
                    Ok(count) => debug!(%remote_addr, messages = count, "echo connection closed"),
                    Err(e) => warn!(%remote_addr, error = %e, "echo connection failed"),
                }
            });
        }
    }

    /// Serve every accepted socket as a [`Connection`] driven by `handler`
    #[instrument(skip(self, handler))]
    pub async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ServerError> {
        info!("server running");
        let semaphore = self.limiter();

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let semaphore = semaphore.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                debug!(%remote_addr, "accepted connection");
                let _ = stream.set_nodelay(true);
                let connection = Connection::open_named(stream, remote_addr.to_string(), handler);
                connection.closed().await;
            });
        }
    }
}
