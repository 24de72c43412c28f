// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza SDK - worker and client runtime for durable workflows.
//!
//! Application code registers workflow and activity types locally; the
//! external workflow engine owns scheduling, persistence, retries and timers.
//! Both sides talk over one `cadenza-protocol` connection.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use cadenza_sdk::{Args, CadenzaClient, SdkConfig, WorkflowContext};
//!
//! #[tokio::main]
//! async fn main() -> cadenza_sdk::Result<()> {
//!     let mut client = CadenzaClient::new(SdkConfig::from_env()?);
//!
//!     client.register_activity_fn("Charge", |_ctx, args: Args| async move {
//!         let amount: i64 = args.require("amount")?;
//!         cadenza_sdk::to_payload(&format!("charged {amount}"))
//!     })?;
//!
//!     client.register_workflow_fn("Order", |ctx: WorkflowContext, args: Args| async move {
//!         let receipt = ctx.activity("Charge").execute(args).await?;
//!         ctx.sleep(Duration::from_secs(60)).await?;
//!         Ok(receipt)
//!     })?;
//!
//!     client.connect().await?;
//!     client.start_worker().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Determinism
//!
//! Every stub a workflow starts takes the next operation id of its
//! [`WorkflowContext`]. Workflow code must therefore start the same stubs in
//! the same order on every run. When the engine replays an execution with its
//! recorded history, a workflow that diverges fails with
//! [`SdkError::DeterminismViolation`].
//!
//! # Signals
//!
//! Asynchronous signals land on [`WorkflowContext::signal_queue`].
//! Synchronous signals are answered by [`Workflow::on_signal`] directly or
//! deferred to [`WorkflowContext::sync_signal_queue`], where workflow code
//! answers them with [`SignalRequest::reply`]:
//!
//! ```ignore
//! let request = ctx.sync_signal_queue("cancel").dequeue().await?;
//! let reason = request.args().get_str("reason").unwrap_or_default().to_string();
//! request.reply("Order cancelled")?;
//! ```

mod activity;
mod args;
mod client;
mod config;
mod context;
mod error;
mod registry;
mod requests;
mod signals;
mod stub;
mod types;
mod worker;
mod workflow;

pub use activity::{Activity, ActivityContext, FnActivity};
pub use args::{Args, from_payload, to_payload};
pub use client::CadenzaClient;
pub use config::SdkConfig;
pub use context::WorkflowContext;
pub use error::{Result, SdkError};
pub use registry::Registry;
pub use signals::{SignalDisposition, SignalQueue, SignalRequest};
pub use stub::{FutureStub, Stub, StubOptions};
pub use types::{
    ExecutionState, HandshakeInfo, OperationRecord, Payload, ReplayStatus, StubKind,
    WorkflowDescription, WorkflowExecution, WorkflowStatus,
};
pub use worker::Worker;
pub use workflow::{FnWorkflow, Workflow};

// Re-export the protocol crate for engine-side tooling and tests
pub use cadenza_protocol;
