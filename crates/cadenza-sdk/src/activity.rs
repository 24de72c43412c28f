// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity trait and the context handed to running activities.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cadenza_protocol::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::args::Args;
use crate::error::Result;
use crate::requests;
use crate::types::Payload;

/// A unit of work run outside workflow code, with no determinism rules.
///
/// Activities observe cancellation cooperatively through
/// [`ActivityContext::is_cancelled`] or [`ActivityContext::cancelled`].
///
/// Returning [`SdkError::ResultPending`](crate::SdkError::ResultPending)
/// leaves the activity open; some other process finishes it later with
/// [`CadenzaClient::complete_activity`](crate::CadenzaClient::complete_activity)
/// using the [`ActivityContext::task_token`].
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    async fn execute(&self, ctx: ActivityContext, args: Args) -> Result<Payload>;
}

struct ActivityContextInner {
    activity_type: String,
    activity_context_id: i64,
    task_token: String,
    connection: Option<Connection>,
    cancel: CancellationToken,
}

/// Handle passed to a running activity.
#[derive(Clone)]
pub struct ActivityContext {
    inner: Arc<ActivityContextInner>,
}

impl ActivityContext {
    /// Context for an activity invoked by the engine.
    pub(crate) fn remote(
        activity_type: String,
        activity_context_id: i64,
        task_token: String,
        connection: Connection,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(
            activity_type,
            activity_context_id,
            task_token,
            Some(connection),
            cancel,
        )
    }

    /// Context for a local activity run by a workflow stub.
    pub(crate) fn local(
        activity_type: String,
        activity_context_id: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(activity_type, activity_context_id, String::new(), None, cancel)
    }

    fn build(
        activity_type: String,
        activity_context_id: i64,
        task_token: String,
        connection: Option<Connection>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ActivityContextInner {
                activity_type,
                activity_context_id,
                task_token,
                connection,
                cancel,
            }),
        }
    }

    pub fn activity_type(&self) -> &str {
        &self.inner.activity_type
    }

    pub fn activity_context_id(&self) -> i64 {
        self.inner.activity_context_id
    }

    /// Engine token for completing this attempt from elsewhere. Empty for
    /// local activities.
    pub fn task_token(&self) -> &str {
        &self.inner.task_token
    }

    /// Whether this activity runs in-process for a workflow.
    pub fn is_local(&self) -> bool {
        self.inner.connection.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the activity is asked to stop.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Record progress with the engine. Details are forwarded unchanged.
    ///
    /// Local activities have no engine-side record, so this is a no-op.
    #[instrument(skip(self, details), fields(activity_context_id = self.inner.activity_context_id))]
    pub async fn heartbeat(&self, details: Payload) -> Result<()> {
        let Some(connection) = &self.inner.connection else {
            return Ok(());
        };
        let request = requests::build_record_heartbeat(
            self.inner.activity_context_id,
            &self.inner.activity_type,
            details,
        );
        let reply = connection.request(request).await?;
        requests::check_reply(reply)?;
        debug!("activity heartbeat recorded");
        Ok(())
    }

    /// Details of the last heartbeat the engine recorded for this activity,
    /// including ones from earlier attempts. `None` when there are none.
    #[instrument(skip(self), fields(activity_context_id = self.inner.activity_context_id))]
    pub async fn last_heartbeat_details(&self) -> Result<Option<Payload>> {
        let Some(connection) = &self.inner.connection else {
            return Ok(None);
        };
        let request = requests::build_get_heartbeat_details(self.inner.activity_context_id);
        let reply = requests::check_reply(connection.request(request).await?)?;
        Ok(reply.payload().map(|details| details.to_vec()))
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("activity_type", &self.inner.activity_type)
            .field("activity_context_id", &self.inner.activity_context_id)
            .field("local", &self.is_local())
            .finish()
    }
}

/// Adapter running a closure as an [`Activity`].
pub struct FnActivity<F> {
    f: F,
}

impl<F> FnActivity<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    async fn execute(&self, ctx: ActivityContext, args: Args) -> Result<Payload> {
        (self.f)(ctx, args).await
    }
}
