// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.
//!
//! Errors cross the wire as an `ErrorType` / `Error` property pair on a
//! reply. [`SdkError::error_type`] and [`SdkError::from_reply`] map between
//! the two representations.

use cadenza_protocol::{CodecError, ConnectionError, ReplyError};
use thiserror::Error;

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure other than a lost connection
    #[error("connection error: {0}")]
    Connection(ConnectionError),

    /// The connection closed before the operation completed
    #[error("connection lost")]
    ConnectionLost,

    /// Malformed message or wrong-type property read
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Engine and runtime disagree about the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registration with the engine, or local type registration, failed
    #[error("registration failed: {0}")]
    Registration(String),

    /// A synchronous signal was already answered
    #[error("signal already replied")]
    AlreadyReplied,

    /// A synchronous signal was dropped or timed out without a reply
    #[error("signal '{0}' was never answered")]
    SignalNeverAnswered(String),

    /// The workflow or activity was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Returned by an activity whose result is completed externally
    #[error("activity result pending external completion")]
    ResultPending,

    /// Dequeue from a closed signal queue
    #[error("signal queue closed")]
    QueueClosed,

    /// Workflow logic issued a different operation than the recorded history
    #[error("determinism violation at operation {operation_id}: history has {expected}, workflow issued {actual}")]
    DeterminismViolation {
        operation_id: u64,
        expected: String,
        actual: String,
    },

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("unknown activity type: {0}")]
    UnknownActivityType(String),

    #[error("unknown query: {0}")]
    UnknownQuery(String),

    #[error("unknown workflow execution: {0}")]
    UnknownExecution(i64),

    /// Failure raised by workflow or activity code
    #[error("{0}")]
    Application(String),

    /// The engine replied with an error the SDK has no variant for
    #[error("engine error: {error_type} - {message}")]
    Engine { error_type: String, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No reply within the configured timeout
    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// `ErrorType` property value for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            SdkError::Config(_) => "Config",
            SdkError::Connection(_) | SdkError::ConnectionLost => "ConnectionLost",
            SdkError::Codec(_) | SdkError::Protocol(_) => "Protocol",
            SdkError::Registration(_) => "Registration",
            SdkError::AlreadyReplied => "AlreadyReplied",
            SdkError::SignalNeverAnswered(_) => "SignalNeverAnswered",
            SdkError::Cancelled => "Cancelled",
            SdkError::QueueClosed => "QueueClosed",
            SdkError::ResultPending => "ResultPending",
            SdkError::DeterminismViolation { .. } => "DeterminismViolation",
            SdkError::UnknownWorkflowType(_) => "UnknownWorkflowType",
            SdkError::UnknownActivityType(_) => "UnknownActivityType",
            SdkError::UnknownQuery(_) => "UnknownQuery",
            SdkError::UnknownExecution(_) => "UnknownExecution",
            SdkError::Application(_) => "Application",
            SdkError::Engine { .. } => "Engine",
            SdkError::Serialization(_) => "Serialization",
            SdkError::Timeout(_) => "Timeout",
            SdkError::Internal(_) => "Internal",
        }
    }

    /// `Error` property value for this error.
    ///
    /// Name-carrying variants send just the name so the receiver can
    /// rebuild the same variant.
    pub fn detail(&self) -> String {
        match self {
            SdkError::SignalNeverAnswered(name)
            | SdkError::UnknownWorkflowType(name)
            | SdkError::UnknownActivityType(name)
            | SdkError::UnknownQuery(name)
            | SdkError::Application(name) => name.clone(),
            SdkError::Engine { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a failed reply.
    pub fn from_reply(error: ReplyError) -> Self {
        let ReplyError {
            error_type,
            message,
        } = error;
        match error_type.as_str() {
            "Cancelled" => SdkError::Cancelled,
            "AlreadyReplied" => SdkError::AlreadyReplied,
            "SignalNeverAnswered" => SdkError::SignalNeverAnswered(message),
            "QueueClosed" => SdkError::QueueClosed,
            "ResultPending" => SdkError::ResultPending,
            "UnknownWorkflowType" => SdkError::UnknownWorkflowType(message),
            "UnknownActivityType" => SdkError::UnknownActivityType(message),
            "UnknownQuery" => SdkError::UnknownQuery(message),
            "Application" => SdkError::Application(message),
            "Timeout" => SdkError::Timeout(message),
            _ => SdkError::Engine {
                error_type,
                message,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SdkError::Cancelled)
    }
}

impl From<ConnectionError> for SdkError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionLost => SdkError::ConnectionLost,
            ConnectionError::RequestTimeout(ms) => {
                SdkError::Timeout(format!("no reply after {ms}ms"))
            }
            ConnectionError::Codec(e) => SdkError::Codec(e),
            other => SdkError::Connection(other),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
