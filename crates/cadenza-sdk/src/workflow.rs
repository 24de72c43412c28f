// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow trait.

use std::future::Future;

use async_trait::async_trait;

use crate::args::Args;
use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};
use crate::signals::SignalDisposition;
use crate::types::Payload;

/// Deterministic orchestration logic.
///
/// `run` must issue the same stub operations in the same order whenever it
/// sees the same inputs and operation results. Time, randomness and I/O go
/// through activities or timers.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    async fn run(&self, ctx: WorkflowContext, args: Args) -> Result<Payload>;

    /// Decide how a synchronous signal is answered.
    ///
    /// The default defers every signal to the named sync signal queue.
    async fn on_signal(
        &self,
        _ctx: &WorkflowContext,
        _name: &str,
        _args: &Args,
    ) -> Result<SignalDisposition> {
        Ok(SignalDisposition::Deferred)
    }

    /// Answer a read-only query against the current state.
    async fn query(&self, _ctx: &WorkflowContext, name: &str, _args: &Args) -> Result<Payload> {
        Err(SdkError::UnknownQuery(name.to_string()))
    }
}

/// Adapter running a closure as a [`Workflow`] with default signal and
/// query handling.
pub struct FnWorkflow<F> {
    f: F,
}

impl<F> FnWorkflow<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn(WorkflowContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    async fn run(&self, ctx: WorkflowContext, args: Args) -> Result<Payload> {
        (self.f)(ctx, args).await
    }
}
