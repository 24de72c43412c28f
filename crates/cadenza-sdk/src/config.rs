// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration for connecting to the workflow engine.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SdkError};

const DEFAULT_SERVER_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    5000,
);

/// SDK configuration for connecting to the workflow engine.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Engine address (default: "127.0.0.1:5000")
    pub server_addr: SocketAddr,
    /// Namespace bound during the connect handshake (default: "default")
    pub namespace: String,
    /// Task queue this worker polls (required)
    pub task_queue: String,
    /// Identity reported to the engine (default: "cadenza-<pid>")
    pub identity: String,
    /// Connection timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds (default: 30_000)
    pub request_timeout_ms: u64,
    /// Background heartbeat interval in milliseconds (default: 1_000).
    /// Set to 0 to disable automatic heartbeats.
    pub heartbeat_interval_ms: u64,
    /// How long a deferred synchronous signal may wait for its reply
    /// (default: 60_000)
    pub signal_reply_timeout_ms: u64,
    /// Maximum activities running at once on this worker (default: 100)
    pub max_concurrent_activities: usize,
    /// Default start-to-close timeout for activity stubs (default: 60_000)
    pub activity_start_to_close_ms: u64,
    /// Default heartbeat timeout for activity stubs, 0 for none (default: 0)
    pub activity_heartbeat_timeout_ms: u64,
}

impl SdkConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `CADENZA_TASK_QUEUE` - Task queue this worker polls
    ///
    /// # Optional Environment Variables
    /// - `CADENZA_SERVER_ADDR` - Engine address (default: "127.0.0.1:5000")
    /// - `CADENZA_NAMESPACE` - Namespace (default: "default")
    /// - `CADENZA_IDENTITY` - Worker identity (default: "cadenza-<pid>")
    /// - `CADENZA_CONNECT_TIMEOUT_MS` - Connection timeout (default: 10000)
    /// - `CADENZA_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    /// - `CADENZA_HEARTBEAT_INTERVAL_MS` - Background heartbeat interval (default: 1000, 0 to disable)
    /// - `CADENZA_SIGNAL_REPLY_TIMEOUT_MS` - Synchronous signal reply timeout (default: 60000)
    /// - `CADENZA_MAX_CONCURRENT_ACTIVITIES` - Activity pool size (default: 100)
    /// - `CADENZA_ACTIVITY_START_TO_CLOSE_MS` - Default activity start-to-close timeout (default: 60000)
    /// - `CADENZA_ACTIVITY_HEARTBEAT_TIMEOUT_MS` - Default activity heartbeat timeout (default: 0)
    pub fn from_env() -> Result<Self> {
        let task_queue = env::var("CADENZA_TASK_QUEUE")
            .map_err(|_| SdkError::Config("CADENZA_TASK_QUEUE is required".to_string()))?;

        let server_addr = match env::var("CADENZA_SERVER_ADDR") {
            Ok(v) => v
                .parse()
                .map_err(|e| SdkError::Config(format!("invalid CADENZA_SERVER_ADDR: {}", e)))?,
            Err(_) => DEFAULT_SERVER_ADDR,
        };

        let max_concurrent_activities = env_or("CADENZA_MAX_CONCURRENT_ACTIVITIES", 100);
        if max_concurrent_activities == 0 {
            return Err(SdkError::Config(
                "CADENZA_MAX_CONCURRENT_ACTIVITIES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            server_addr,
            namespace: env::var("CADENZA_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            task_queue,
            identity: env::var("CADENZA_IDENTITY").unwrap_or_else(|_| default_identity()),
            connect_timeout_ms: env_or("CADENZA_CONNECT_TIMEOUT_MS", 10_000),
            request_timeout_ms: env_or("CADENZA_REQUEST_TIMEOUT_MS", 30_000),
            heartbeat_interval_ms: env_or("CADENZA_HEARTBEAT_INTERVAL_MS", 1_000),
            signal_reply_timeout_ms: env_or("CADENZA_SIGNAL_REPLY_TIMEOUT_MS", 60_000),
            max_concurrent_activities,
            activity_start_to_close_ms: env_or("CADENZA_ACTIVITY_START_TO_CLOSE_MS", 60_000),
            activity_heartbeat_timeout_ms: env_or("CADENZA_ACTIVITY_HEARTBEAT_TIMEOUT_MS", 0),
        })
    }

    /// Create a configuration for local development against `127.0.0.1:5000`.
    pub fn localhost(task_queue: impl Into<String>) -> Self {
        Self::new(task_queue)
    }

    /// Create a new configuration for the given task queue.
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR,
            namespace: "default".to_string(),
            task_queue: task_queue.into(),
            identity: default_identity(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            signal_reply_timeout_ms: 60_000,
            max_concurrent_activities: 100,
            activity_start_to_close_ms: 60_000,
            activity_heartbeat_timeout_ms: 0,
        }
    }

    /// Set the engine address.
    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the background heartbeat interval.
    /// Set to 0 to disable automatic heartbeats.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_signal_reply_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.signal_reply_timeout_ms = timeout_ms;
        self
    }

    /// Set the activity pool size. Values below 1 are raised to 1.
    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn signal_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_reply_timeout_ms)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_identity() -> String {
    format!("cadenza-{}", std::process::id())
}
