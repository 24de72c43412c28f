// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker dispatch loop.
//!
//! The [`Worker`] is the [`MessageHandler`] of the engine connection. Each
//! inbound request is handled on its own task, so a long-running activity or
//! a synchronous signal waiting for its reply never blocks other requests.
//!
//! Signals are the exception: they are taken off the reader task in wire
//! order and fed through one inbox per context, so a workflow sees its
//! signals in the order the engine sent them. Only the wait for a deferred
//! synchronous reply leaves the inbox.
//!
//! ```text
//! WorkflowInvoke        ──► new WorkflowContext, run until first suspension
//!                           or completion
//! WorkflowSignalInvoke  ──► per-context inbox ──► SignalQueue (async) /
//!                           on_signal + SignalRequest (sync)
//! WorkflowQueryInvoke   ──► Workflow::query
//! CancelRequest         ──► cancel the execution's token
//! ActivityInvoke        ──► bounded activity pool
//! ActivityStop          ──► cancel the activity's token
//! Ping / Heartbeat      ──► reply
//! Terminate             ──► reply, abandon everything, close
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::{Connection, Message, MessageHandler, MessageType, props};
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activity::ActivityContext;
use crate::args::Args;
use crate::config::SdkConfig;
use crate::context::{ContextParams, WorkflowContext, parse_history, terminal_state};
use crate::error::{Result, SdkError};
use crate::registry::Registry;
use crate::requests;
use crate::signals::{SignalDisposition, SignalRequest};
use crate::types::{Payload, ReplayStatus};
use crate::workflow::Workflow;

/// How long a signal, query or cancel waits for an invoke of the same
/// context that may still be in flight.
const EXECUTION_LOOKUP_GRACE: Duration = Duration::from_millis(250);

struct Execution {
    ctx: WorkflowContext,
    workflow: Arc<dyn Workflow>,
}

/// Ordered queue of signal invokes for one context, drained by one task.
struct SignalInbox {
    id: u64,
    tx: mpsc::UnboundedSender<(Connection, Message)>,
}

/// Outcome of accepting a signal in order.
enum Delivery {
    Reply(Option<Message>),
    /// Deferred synchronous signal; workflow code answers through `reply`.
    Awaiting {
        name: String,
        reply: oneshot::Receiver<Payload>,
    },
}

struct WorkerInner {
    registry: Arc<Registry>,
    config: Arc<SdkConfig>,
    executions: DashMap<i64, Arc<Execution>>,
    activities: DashMap<i64, CancellationToken>,
    activity_slots: Arc<Semaphore>,
    execution_added: Notify,
    signal_inboxes: DashMap<i64, SignalInbox>,
    next_inbox: AtomicU64,
}

/// Routes engine requests to registered workflow and activity types.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(registry: Registry, config: Arc<SdkConfig>) -> Self {
        let slots = config.max_concurrent_activities.max(1);
        Self {
            inner: Arc::new(WorkerInner {
                registry: Arc::new(registry),
                config,
                executions: DashMap::new(),
                activities: DashMap::new(),
                activity_slots: Arc::new(Semaphore::new(slots)),
                execution_added: Notify::new(),
                signal_inboxes: DashMap::new(),
                next_inbox: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Number of workflow executions currently live.
    pub fn live_executions(&self) -> usize {
        self.inner.executions.len()
    }

    /// Number of activities running or waiting for a pool slot.
    pub fn running_activities(&self) -> usize {
        self.inner.activities.len()
    }

    /// Context of a live execution.
    pub fn execution(&self, context_id: i64) -> Option<WorkflowContext> {
        self.inner
            .executions
            .get(&context_id)
            .map(|entry| entry.ctx.clone())
    }

    /// Abandon every live execution and activity once `connection` closes.
    pub fn watch_connection(&self, connection: Connection) {
        let worker = self.clone();
        tokio::spawn(async move {
            connection.closed().await;
            worker.abandon_all();
        });
    }

    /// Cancel every live execution and activity and close their queues.
    pub fn abandon_all(&self) {
        let executions: Vec<_> = self
            .inner
            .executions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.executions.clear();
        for execution in &executions {
            execution.ctx.abandon();
        }
        for entry in self.inner.activities.iter() {
            entry.value().cancel();
        }
        if !executions.is_empty() {
            info!(abandoned = executions.len(), "abandoned live workflow executions");
        }
    }

    async fn lookup(&self, context_id: i64) -> Result<Arc<Execution>> {
        let deadline = tokio::time::Instant::now() + EXECUTION_LOOKUP_GRACE;
        loop {
            let added = self.inner.execution_added.notified();
            let found = self
                .inner
                .executions
                .get(&context_id)
                .map(|entry| entry.value().clone());
            if let Some(execution) = found {
                return Ok(execution);
            }
            if tokio::time::timeout_at(deadline, added).await.is_err() {
                return Err(SdkError::UnknownExecution(context_id));
            }
        }
    }

    fn finish(&self, ctx: &WorkflowContext, result: &Result<Payload>) {
        let state = terminal_state(result);
        ctx.teardown(state);
        self.inner.executions.remove(&ctx.context_id());
        match result {
            Ok(payload) => info!(
                context_id = ctx.context_id(),
                workflow_type = ctx.workflow_type(),
                result_size = payload.len(),
                "workflow completed"
            ),
            Err(e) => info!(
                context_id = ctx.context_id(),
                workflow_type = ctx.workflow_type(),
                ?state,
                error = %e,
                "workflow finished without result"
            ),
        }
    }

    // ========== Workflows ==========

    #[instrument(skip(self, connection, message), fields(context_id = tracing::field::Empty))]
    async fn invoke_workflow(&self, connection: Connection, message: &Message) -> Result<Option<Message>> {
        let context_id = message.context_id()?;
        tracing::Span::current().record("context_id", context_id);

        let workflow_type = message.get_string(props::WORKFLOW_TYPE, "")?;
        let workflow = self.inner.registry.new_workflow(&workflow_type)?;
        let history = message
            .get_optional_string(props::HISTORY)?
            .map(|json| parse_history(&json))
            .transpose()?;
        let args = args_of(message)?;

        let ctx = WorkflowContext::new(ContextParams {
            context_id,
            workflow_type,
            workflow_id: message.get_string(props::WORKFLOW_ID, "")?,
            run_id: message.get_string(props::RUN_ID, "")?,
            task_queue: message.get_string(props::TASK_QUEUE, &self.inner.config.task_queue)?,
            replay_status: ReplayStatus::from(message.get_i32(props::REPLAY_STATUS, 0)?),
            history,
            connection: connection.clone(),
            registry: self.inner.registry.clone(),
            config: self.inner.config.clone(),
        });

        {
            use dashmap::mapref::entry::Entry;
            match self.inner.executions.entry(context_id) {
                Entry::Occupied(_) => {
                    return Err(SdkError::Protocol(format!(
                        "execution {context_id} is already running"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Execution {
                        ctx: ctx.clone(),
                        workflow: workflow.clone(),
                    }));
                }
            }
        }
        self.inner.execution_added.notify_waiters();

        info!(
            workflow_type = ctx.workflow_type(),
            workflow_id = ctx.workflow_id(),
            replaying = ctx.is_replaying(),
            "workflow invoked"
        );
        ctx.control().start();
        let mut run = {
            let ctx = ctx.clone();
            tokio::spawn(async move { workflow.run(ctx, args).await })
        };

        let control = ctx.control().clone();
        tokio::select! {
            biased;
            joined = &mut run => {
                let result = flatten_join(joined);
                self.finish(&ctx, &result);
                return Ok(requests::result_reply(message, &result));
            }
            _ = control.first_suspension() => {}
        }

        debug!("workflow suspended before completing, result follows separately");
        let worker = self.clone();
        tokio::spawn(async move {
            let result = flatten_join(run.await);
            worker.finish(&ctx, &result);
            worker.report_completion(&connection, &ctx, &result).await;
        });
        Ok(None)
    }

    async fn report_completion(
        &self,
        connection: &Connection,
        ctx: &WorkflowContext,
        result: &Result<Payload>,
    ) {
        let report = requests::build_workflow_complete(
            ctx.context_id(),
            ctx.workflow_id(),
            ctx.run_id(),
            result,
        );
        let outcome = connection
            .request_with_timeout(report, self.inner.config.request_timeout())
            .await
            .map_err(SdkError::from)
            .and_then(requests::check_reply);
        match outcome {
            Ok(_) => debug!(context_id = ctx.context_id(), "workflow completion reported"),
            Err(SdkError::ConnectionLost) => {
                debug!(context_id = ctx.context_id(), "connection gone before completion report")
            }
            Err(e) => warn!(
                context_id = ctx.context_id(),
                error = %e,
                "failed to report workflow completion"
            ),
        }
    }

    // ========== Signals ==========

    /// Hand a signal invoke to the inbox of its context, creating one when
    /// none is draining. Called on the reader task.
    fn route_signal(&self, context_id: i64, connection: Connection, message: Message) {
        use dashmap::mapref::entry::Entry;
        let item = (connection, message);
        match self.inner.signal_inboxes.entry(context_id) {
            Entry::Occupied(mut slot) => {
                if let Err(mpsc::error::SendError(item)) = slot.get().tx.send(item) {
                    slot.insert(self.spawn_inbox(context_id, item));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn_inbox(context_id, item));
            }
        }
    }

    fn spawn_inbox(&self, context_id: i64, first: (Connection, Message)) -> SignalInbox {
        let id = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // the receiver is alive, so this cannot fail
        let _ = tx.send(first);
        tokio::spawn(self.clone().drain_signals(context_id, id, rx));
        SignalInbox { id, tx }
    }

    /// Accept the signals of one context one at a time until the inbox is
    /// empty, then retire it.
    async fn drain_signals(
        self,
        context_id: i64,
        inbox_id: u64,
        mut rx: mpsc::UnboundedReceiver<(Connection, Message)>,
    ) {
        while let Some((connection, message)) = rx.recv().await {
            match self.accept_signal(&message).await {
                Ok(Delivery::Reply(reply)) => send_reply(&connection, reply),
                Ok(Delivery::Awaiting { name, reply }) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let result = worker.await_signal_reply(&message, name, reply).await;
                        send_reply(&connection, into_reply(&message, result));
                    });
                }
                Err(e) => send_reply(&connection, into_reply(&message, Err(e))),
            }

            // senders hold the entry lock, so emptiness is stable here
            let retired = self
                .inner
                .signal_inboxes
                .remove_if(&context_id, |_, inbox| inbox.id == inbox_id && rx.is_empty());
            if retired.is_some() {
                break;
            }
        }
    }

    /// Deliver a signal and wait for its reply, in one step.
    async fn deliver_signal(&self, message: &Message) -> Result<Option<Message>> {
        match self.accept_signal(message).await? {
            Delivery::Reply(reply) => Ok(reply),
            Delivery::Awaiting { name, reply } => self.await_signal_reply(message, name, reply).await,
        }
    }

    /// The ordered part of signal delivery: queue an async signal, or run
    /// `on_signal` and queue a deferred synchronous one.
    #[instrument(skip(self, message), fields(context_id = tracing::field::Empty, signal = tracing::field::Empty))]
    async fn accept_signal(&self, message: &Message) -> Result<Delivery> {
        let context_id = message.context_id()?;
        let name = message.get_string(props::SIGNAL_NAME, "")?;
        let span = tracing::Span::current();
        span.record("context_id", context_id);
        span.record("signal", name.as_str());

        let synchronous = message.get_bool(props::SYNCHRONOUS, false)?;
        let args = args_of(message)?;
        let execution = self.lookup(context_id).await?;

        if !synchronous {
            execution.ctx.signal_queue(&name).enqueue(args)?;
            debug!("signal queued");
            return Ok(Delivery::Reply(Message::reply_to(message)));
        }

        match execution.workflow.on_signal(&execution.ctx, &name, &args).await? {
            SignalDisposition::Immediate(payload) => {
                debug!("signal answered immediately");
                Ok(Delivery::Reply(requests::payload_reply(message, payload)))
            }
            SignalDisposition::Deferred => {
                let (request, reply) = SignalRequest::new(name.clone(), args);
                execution.ctx.sync_signal_queue(&name).enqueue(request)?;
                debug!("signal deferred to workflow code");
                Ok(Delivery::Awaiting { name, reply })
            }
        }
    }

    /// Wait for workflow code to answer a deferred signal. Resolves early
    /// with `SignalNeverAnswered` when the request is dropped, e.g. because
    /// the execution finished with the request still queued.
    async fn await_signal_reply(
        &self,
        message: &Message,
        name: String,
        reply: oneshot::Receiver<Payload>,
    ) -> Result<Option<Message>> {
        match tokio::time::timeout(self.inner.config.signal_reply_timeout(), reply).await {
            Ok(Ok(payload)) => Ok(requests::payload_reply(message, payload)),
            Ok(Err(_)) => {
                debug!(signal = %name, "signal request dropped without a reply");
                Err(SdkError::SignalNeverAnswered(name))
            }
            Err(_) => {
                debug!(signal = %name, "signal reply timed out");
                Err(SdkError::SignalNeverAnswered(name))
            }
        }
    }

    // ========== Queries and cancellation ==========

    async fn deliver_query(&self, message: &Message) -> Result<Option<Message>> {
        let context_id = message.context_id()?;
        let name = message.get_string(props::QUERY_NAME, "")?;
        let args = args_of(message)?;
        let execution = self.lookup(context_id).await?;
        let payload = execution.workflow.query(&execution.ctx, &name, &args).await?;
        Ok(requests::payload_reply(message, payload))
    }

    async fn cancel_workflow(&self, message: &Message) -> Result<Option<Message>> {
        let context_id = message.context_id()?;
        let reason = message.get_string(props::REASON, "")?;
        let execution = self.lookup(context_id).await?;
        info!(context_id, %reason, "cancelling workflow");
        execution.ctx.control().cancel();
        Ok(Message::reply_to(message))
    }

    // ========== Activities ==========

    #[instrument(skip(self, connection, message), fields(activity_type = tracing::field::Empty, activity_context_id = tracing::field::Empty))]
    async fn invoke_activity(&self, connection: Connection, message: &Message) -> Result<Option<Message>> {
        let activity_type = message.get_string(props::ACTIVITY_TYPE, "")?;
        let activity_context_id = activity_context_id_of(message)?;
        let span = tracing::Span::current();
        span.record("activity_type", activity_type.as_str());
        span.record("activity_context_id", activity_context_id);

        let activity = self.inner.registry.new_activity(&activity_type)?;
        let args = args_of(message)?;
        let task_token = message.get_string(props::TASK_TOKEN, "")?;

        // visible to ActivityStop while still waiting for a pool slot
        let token = CancellationToken::new();
        {
            use dashmap::mapref::entry::Entry;
            match self.inner.activities.entry(activity_context_id) {
                Entry::Occupied(_) => {
                    return Err(SdkError::Protocol(format!(
                        "activity {activity_context_id} is already running"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(token.clone());
                }
            }
        }

        let result = async {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("activity stopped before it started");
                    return Err(SdkError::Cancelled);
                }
                permit = self.inner.activity_slots.clone().acquire_owned() => permit
                    .map_err(|_| SdkError::Internal("activity pool closed".to_string()))?,
            };
            let ctx = ActivityContext::remote(
                activity_type,
                activity_context_id,
                task_token,
                connection,
                token.clone(),
            );
            debug!("activity started");
            let joined = tokio::spawn(async move {
                let _permit = permit;
                activity.execute(ctx, args).await
            })
            .await;
            flatten_join(joined)
        }
        .await;
        self.inner.activities.remove(&activity_context_id);

        match &result {
            Ok(payload) => debug!(result_size = payload.len(), "activity completed"),
            Err(SdkError::ResultPending) => {
                debug!("activity result will be completed externally");
                return Ok(Message::reply_to(message)
                    .map(|reply| reply.with_bool(props::RESULT_PENDING, true)));
            }
            Err(e) => debug!(error = %e, "activity failed"),
        }
        Ok(requests::result_reply(message, &result))
    }

    fn stop_activity(&self, message: &Message) -> Result<Option<Message>> {
        let activity_context_id = activity_context_id_of(message)?;
        match self.inner.activities.get(&activity_context_id) {
            Some(token) => {
                info!(activity_context_id, "stopping activity");
                token.cancel();
            }
            None => debug!(activity_context_id, "stop for an activity that is not running"),
        }
        Ok(Message::reply_to(message))
    }

    async fn terminate(&self, connection: Connection, message: &Message) -> Result<Option<Message>> {
        info!("engine requested termination");
        if let Some(reply) = Message::reply_to(message) {
            connection.reply(reply)?;
        }
        self.abandon_all();
        connection.close().await;
        Ok(None)
    }
}

#[async_trait]
impl MessageHandler for Worker {
    fn intercept(&self, connection: &Connection, message: Message) -> Option<Message> {
        if message.message_type() != MessageType::WorkflowSignalInvokeRequest {
            return Some(message);
        }
        // malformed signals take the regular path and get an error reply
        let Ok(context_id) = message.context_id() else {
            return Some(message);
        };
        self.route_signal(context_id, connection.clone(), message);
        None
    }

    async fn handle(&self, connection: Connection, message: Message) -> Option<Message> {
        let message_type = message.message_type();
        let result = match message_type {
            MessageType::WorkflowInvokeRequest => self.invoke_workflow(connection, &message).await,
            MessageType::WorkflowSignalInvokeRequest => self.deliver_signal(&message).await,
            MessageType::WorkflowQueryInvokeRequest => self.deliver_query(&message).await,
            MessageType::CancelRequest => self.cancel_workflow(&message).await,
            MessageType::ActivityInvokeRequest => self.invoke_activity(connection, &message).await,
            MessageType::ActivityStopRequest => self.stop_activity(&message),
            MessageType::PingRequest | MessageType::HeartbeatRequest => {
                Ok(Message::reply_to(&message))
            }
            MessageType::TerminateRequest => self.terminate(connection, &message).await,
            other => Err(SdkError::Protocol(format!(
                "{other} is not handled by a worker"
            ))),
        };

        into_reply(&message, result)
    }
}

/// Reply for a handled request, logging failures.
fn into_reply(message: &Message, result: Result<Option<Message>>) -> Option<Message> {
    match result {
        Ok(reply) => reply,
        Err(e) => {
            warn!(message_type = %message.message_type(), error = %e, "request failed");
            requests::error_reply(message, &e)
        }
    }
}

fn send_reply(connection: &Connection, reply: Option<Message>) {
    if let Some(reply) = reply
        && let Err(e) = connection.reply(reply)
    {
        debug!(error = %e, "could not send signal reply");
    }
}

/// Activity invokes and stops must name the activity they refer to.
fn activity_context_id_of(message: &Message) -> Result<i64> {
    if !message.contains(props::ACTIVITY_CONTEXT_ID) {
        return Err(SdkError::Protocol(format!(
            "{} without {}",
            message.message_type(),
            props::ACTIVITY_CONTEXT_ID
        )));
    }
    Ok(message.get_i64(props::ACTIVITY_CONTEXT_ID, 0)?)
}

fn args_of(message: &Message) -> Result<Args> {
    Args::from_payload(message.payload().map(|b| &b[..]).unwrap_or_default())
}

fn flatten_join(joined: std::result::Result<Result<Payload>, JoinError>) -> Result<Payload> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(SdkError::Internal("task panicked".to_string())),
        Err(_) => Err(SdkError::Cancelled),
    }
}
