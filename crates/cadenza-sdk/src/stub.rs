// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stubs: typed handles for the operations workflow code delegates.
//!
//! A [`Stub`] is created from a [`WorkflowContext`] and tagged with a
//! [`StubKind`]. [`Stub::start`] takes the next operation id, sends the
//! kind-specific request and returns a [`FutureStub`] without waiting.
//! Several stubs can be started before any of them is awaited.

use std::time::Duration;

use cadenza_protocol::PendingOperation;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::activity::ActivityContext;
use crate::args::Args;
use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};
use crate::requests;
use crate::types::{Payload, StubKind};

/// Scheduling options for a stub. Unset fields fall back to the
/// [`crate::SdkConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StubOptions {
    /// Task queue the operation is routed to
    pub task_queue: Option<String>,
    pub schedule_to_close: Option<Duration>,
    pub start_to_close: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    /// Workflow id for child workflows, engine-assigned when unset
    pub workflow_id: Option<String>,
}

impl StubOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close = Some(timeout);
        self
    }

    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = Some(timeout);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    fn resolve(&self, ctx: &WorkflowContext) -> StubOptions {
        let config = ctx.config();
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        StubOptions {
            task_queue: self
                .task_queue
                .clone()
                .or_else(|| Some(ctx.task_queue().to_string())),
            schedule_to_close: self.schedule_to_close,
            start_to_close: self
                .start_to_close
                .or_else(|| millis(config.activity_start_to_close_ms)),
            heartbeat_timeout: self
                .heartbeat_timeout
                .or_else(|| millis(config.activity_heartbeat_timeout_ms)),
            workflow_id: self.workflow_id.clone(),
        }
    }
}

/// Handle for one kind of delegated operation.
#[derive(Debug, Clone)]
pub struct Stub {
    ctx: WorkflowContext,
    kind: StubKind,
    target: String,
    duration: Option<Duration>,
    options: StubOptions,
}

impl Stub {
    pub(crate) fn new(
        ctx: WorkflowContext,
        kind: StubKind,
        target: String,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            ctx,
            kind,
            target,
            duration,
            options: StubOptions::default(),
        }
    }

    pub fn kind(&self) -> StubKind {
        self.kind
    }

    /// Activity or workflow type, or the timer duration.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn options(&self) -> &StubOptions {
        &self.options
    }

    pub fn with_options(mut self, options: StubOptions) -> Self {
        self.options = options;
        self
    }

    /// Issue the operation and return a handle to its result.
    ///
    /// Takes the next operation id of the context, so the order of `start`
    /// calls must be the same on every run of the workflow.
    #[instrument(skip(self, args), fields(context_id = self.ctx.context_id(), kind = %self.kind, target = %self.target))]
    pub fn start(&self, args: Args) -> Result<FutureStub> {
        if self.ctx.is_cancelled() {
            return Err(SdkError::Cancelled);
        }
        let operation_id = self.ctx.next_operation(self.kind, &self.target)?;
        match self.issue(operation_id, args) {
            Ok(inner) => Ok(FutureStub {
                ctx: self.ctx.clone(),
                operation_id,
                kind: self.kind,
                inner: Some(inner),
            }),
            Err(e) => {
                self.ctx.complete_operation(operation_id);
                Err(e)
            }
        }
    }

    /// `start` followed by `get`.
    pub async fn execute(&self, args: Args) -> Result<Payload> {
        self.start(args)?.get().await
    }

    /// `execute`, decoding the result as JSON.
    pub async fn execute_json<T: DeserializeOwned>(&self, args: Args) -> Result<T> {
        self.start(args)?.get_json().await
    }

    fn issue(&self, operation_id: u64, args: Args) -> Result<Operation> {
        let context_id = self.ctx.context_id();
        let message = match self.kind {
            StubKind::LocalActivity => return self.spawn_local(operation_id, args),
            StubKind::Activity => requests::build_activity_execute(
                context_id,
                operation_id,
                &self.target,
                &self.options.resolve(&self.ctx),
                args.to_payload()?,
            ),
            StubKind::ChildWorkflow => requests::build_execute_child(
                context_id,
                operation_id,
                &self.target,
                &self.options.resolve(&self.ctx),
                args.to_payload()?,
            ),
            StubKind::Timer => requests::build_sleep(
                context_id,
                operation_id,
                self.duration.unwrap_or_default(),
            ),
            StubKind::SignalChild | StubKind::CancelChild => {
                return Err(SdkError::Internal(format!(
                    "{} is issued through WorkflowContext",
                    self.kind
                )));
            }
        };
        let pending = self.ctx.connection().send(message)?;
        debug!(operation_id, request_id = pending.id(), "stub request sent");
        Ok(Operation::Remote(pending))
    }

    fn spawn_local(&self, operation_id: u64, args: Args) -> Result<Operation> {
        let activity = self.ctx.registry().new_activity(&self.target)?;
        let activity_ctx = ActivityContext::local(
            self.target.clone(),
            operation_id as i64,
            self.ctx.control().cancel_token().child_token(),
        );
        let handle = tokio::spawn(async move { activity.execute(activity_ctx, args).await });
        debug!(operation_id, "local activity spawned");
        Ok(Operation::Local(handle))
    }
}

enum Operation {
    Remote(PendingOperation),
    Local(JoinHandle<Result<Payload>>),
}

/// Result handle of a started stub operation.
///
/// Dropping it before [`FutureStub::get`] abandons the result; a local
/// activity is aborted.
pub struct FutureStub {
    ctx: WorkflowContext,
    operation_id: u64,
    kind: StubKind,
    inner: Option<Operation>,
}

impl FutureStub {
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    pub fn kind(&self) -> StubKind {
        self.kind
    }

    /// Wait for the result. This is a suspension point of the workflow and
    /// resolves with `Cancelled` when the execution is cancelled.
    pub async fn get(mut self) -> Result<Payload> {
        let ctx = self.ctx.clone();
        match self.inner.take() {
            Some(Operation::Remote(pending)) => {
                let reply = ctx
                    .suspend_on(async move { pending.await.map_err(SdkError::from) })
                    .await?;
                let reply = requests::check_reply(reply)?;
                Ok(requests::reply_payload(&reply))
            }
            Some(Operation::Local(handle)) => {
                let abort = handle.abort_handle();
                let result = ctx
                    .suspend_on(async move {
                        handle
                            .await
                            .map_err(|e| SdkError::Internal(format!("local activity failed: {e}")))?
                    })
                    .await;
                if result.is_err() {
                    abort.abort();
                }
                result
            }
            None => Err(SdkError::Internal("operation result already taken".to_string())),
        }
    }

    /// Wait for the result and decode it as JSON.
    pub async fn get_json<T: DeserializeOwned>(self) -> Result<T> {
        let payload = self.get().await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

impl Drop for FutureStub {
    fn drop(&mut self) {
        if let Some(Operation::Local(handle)) = self.inner.take() {
            handle.abort();
        }
        self.ctx.complete_operation(self.operation_id);
    }
}

impl std::fmt::Debug for FutureStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureStub")
            .field("operation_id", &self.operation_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;

    #[tokio::test]
    async fn test_options_resolve_from_config() {
        let ctx = test_context(None);
        let resolved = StubOptions::new().resolve(&ctx);
        assert_eq!(resolved.task_queue.as_deref(), Some("orders"));
        assert_eq!(resolved.start_to_close, Some(Duration::from_secs(60)));
        assert_eq!(resolved.heartbeat_timeout, None);

        let resolved = StubOptions::new()
            .with_task_queue("payments")
            .with_start_to_close(Duration::from_secs(5))
            .resolve(&ctx);
        assert_eq!(resolved.task_queue.as_deref(), Some("payments"));
        assert_eq!(resolved.start_to_close, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_stub_kinds_and_targets() {
        let ctx = test_context(None);
        assert_eq!(ctx.activity("Charge").kind(), StubKind::Activity);
        assert_eq!(ctx.local_activity("Audit").kind(), StubKind::LocalActivity);
        assert_eq!(ctx.child_workflow("Ship").target(), "Ship");
        assert_eq!(ctx.timer(Duration::from_millis(1500)).target(), "1500ms");
    }

    #[tokio::test]
    async fn test_start_consumes_operation_ids() {
        let ctx = test_context(None);
        let first = ctx.activity("A").start(Args::new()).unwrap();
        let second = ctx.timer(Duration::from_millis(5)).start(Args::new()).unwrap();
        assert_eq!(first.operation_id(), 1);
        assert_eq!(second.operation_id(), 2);
        assert_eq!(ctx.outstanding(), vec![1, 2]);

        drop(first);
        assert_eq!(ctx.outstanding(), vec![2]);
    }

    #[tokio::test]
    async fn test_unknown_local_activity() {
        let ctx = test_context(None);
        let result = ctx.local_activity("Missing").start(Args::new());
        assert!(matches!(result, Err(SdkError::UnknownActivityType(name)) if name == "Missing"));
        // the id is consumed but not left outstanding
        assert_eq!(ctx.journal().len(), 1);
        assert!(ctx.outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_cancel_fails_fast() {
        let ctx = test_context(None);
        ctx.control().cancel();
        assert!(matches!(
            ctx.activity("A").start(Args::new()),
            Err(SdkError::Cancelled)
        ));
        assert!(ctx.journal().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_resolves_get() {
        let ctx = test_context(None);
        ctx.control().start();
        let future = ctx.activity("Slow").start(Args::new()).unwrap();

        let control = ctx.control().clone();
        tokio::spawn(async move {
            control.first_suspension().await;
            control.cancel();
        });
        assert!(matches!(future.get().await, Err(SdkError::Cancelled)));
        assert!(ctx.outstanding().is_empty());
    }
}
