// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza Protocol - typed message protocol between workers and the engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    cadenza-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Connection: correlation ids, pending operations, handlers  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 length prefix per message                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: typed property map + payload (little-endian)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP, or any AsyncRead + AsyncWrite              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every request type has a reply type with tag `request + 1`. A reply
//! carries the `RequestId` of its request; that id is the only thing that
//! ties the two together, so requests and replies may interleave freely in
//! both directions.
//!
//! # Usage
//!
//! ```ignore
//! use cadenza_protocol::{Connection, Message, MessageType, RejectingHandler};
//!
//! let conn = Connection::connect("127.0.0.1:5000", timeout, Arc::new(RejectingHandler)).await?;
//! let reply = conn.send(Message::new(MessageType::PingRequest))?.await?;
//! ```

pub mod connection;
pub mod frame;
pub mod message;
pub mod message_type;
pub mod props;
pub mod registry;
pub mod server;

pub use connection::{
    Connection, ConnectionError, ConnectionState, MessageHandler, PendingOperation,
    RejectingHandler,
};
pub use frame::{FrameError, FramedStream, read_frame, read_message, write_frame, write_message};
pub use message::{
    CodecError, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, Message, PropertyKind, PropertyValue, ReplyError,
};
pub use message_type::MessageType;
pub use registry::CorrelationRegistry;
pub use server::{ProtocolServer, ServerConfig, ServerError, serve_echo};

/// Protocol version spoken by this crate, `major.minor`.
pub const PROTOCOL_VERSION: &str = "1.0";
