// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory mock engine for SDK integration tests.
//!
//! The engine side of a `tokio::io::duplex` pair. It answers the handshake
//! and registrations, turns client calls into worker invokes, runs stub
//! operations (activities are forwarded back to the worker, sleeps use a
//! Tokio timer, child workflows are invoked like any other workflow) and
//! records every operation and final outcome per context id. Activities
//! that report a pending result wait for an `ActivityComplete` carrying
//! their task token.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::{
    Connection, ConnectionError, Message, MessageHandler, MessageType, PendingOperation, props,
};
use cadenza_sdk::{Args, CadenzaClient, OperationRecord, SdkConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

/// Final state of a workflow execution as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Vec<u8>),
    Failed { error_type: String, message: String },
    Cancelled,
}

impl Outcome {
    fn from_message(message: &Message) -> Outcome {
        match message.reply_error().unwrap() {
            None => Outcome::Completed(message.payload().map(|b| b.to_vec()).unwrap_or_default()),
            Some(e) if e.error_type == "Cancelled" => Outcome::Cancelled,
            Some(e) => Outcome::Failed {
                error_type: e.error_type,
                message: e.message,
            },
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> T {
        match self {
            Outcome::Completed(payload) => serde_json::from_slice(payload).unwrap(),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}

/// One stub operation the engine received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOp {
    pub operation_id: i64,
    pub kind: &'static str,
    pub target: String,
}

/// What the engine knows about one started execution.
#[derive(Debug, Clone)]
struct RunInfo {
    workflow_id: String,
    workflow_type: String,
    started: DateTime<Utc>,
}

pub struct EngineState {
    protocol_version: String,
    next_context: AtomicI64,
    next_activity: AtomicI64,
    workflows: Mutex<HashMap<String, i64>>,
    runs: Mutex<HashMap<i64, RunInfo>>,
    operations: Mutex<HashMap<i64, Vec<RecordedOp>>>,
    outcomes: Mutex<HashMap<i64, (Outcome, DateTime<Utc>)>>,
    outcome_added: Notify,
    registered: Mutex<Vec<String>>,
    activity_heartbeats: Mutex<Vec<Vec<u8>>>,
    heartbeat_details: Mutex<HashMap<i64, Vec<u8>>>,
    pending_activities: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    heartbeats: AtomicUsize,
}

impl EngineState {
    fn new(protocol_version: &str) -> Self {
        Self {
            protocol_version: protocol_version.to_string(),
            next_context: AtomicI64::new(1),
            next_activity: AtomicI64::new(1),
            workflows: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            outcome_added: Notify::new(),
            registered: Mutex::new(Vec::new()),
            activity_heartbeats: Mutex::new(Vec::new()),
            heartbeat_details: Mutex::new(HashMap::new()),
            pending_activities: Mutex::new(HashMap::new()),
            heartbeats: AtomicUsize::new(0),
        }
    }

    fn record_op(&self, message: &Message, kind: &'static str, target: String) {
        let context_id = message.context_id().unwrap();
        let operation_id = message.get_i64(props::OPERATION_ID, 0).unwrap();
        self.operations
            .lock()
            .entry(context_id)
            .or_default()
            .push(RecordedOp {
                operation_id,
                kind,
                target,
            });
    }

    fn record_outcome(&self, context_id: i64, outcome: Outcome) {
        self.outcomes
            .lock()
            .entry(context_id)
            .or_insert((outcome, Utc::now()));
        self.outcome_added.notify_waiters();
    }

    fn is_running(&self, context_id: i64) -> bool {
        !self.outcomes.lock().contains_key(&context_id)
    }

    async fn wait_outcome(&self, context_id: i64) -> Outcome {
        loop {
            let added = self.outcome_added.notified();
            let found = self
                .outcomes
                .lock()
                .get(&context_id)
                .map(|(outcome, _)| outcome.clone());
            if let Some(outcome) = found {
                return outcome;
            }
            added.await;
        }
    }

    /// Context of `workflow_id`, waiting briefly for a start still in flight.
    async fn wait_context(&self, workflow_id: &str) -> Option<i64> {
        for _ in 0..200 {
            if let Some(context_id) = self.workflows.lock().get(workflow_id).copied() {
                return Some(context_id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    /// Assign a context to a new execution and invoke it on the worker.
    fn start_run(
        self: &Arc<Self>,
        connection: &Connection,
        workflow_type: &str,
        workflow_id: Option<String>,
        payload: Option<Vec<u8>>,
    ) -> (i64, String) {
        let context_id = self.next_context.fetch_add(1, Ordering::SeqCst);
        let workflow_id = workflow_id.unwrap_or_else(|| format!("child-{context_id}"));
        self.workflows.lock().insert(workflow_id.clone(), context_id);
        self.runs.lock().insert(
            context_id,
            RunInfo {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.to_string(),
                started: Utc::now(),
            },
        );
        let invoke = invoke_message(workflow_type, context_id, &workflow_id, payload);
        send_invoke(self, connection, invoke);
        (context_id, workflow_id)
    }
}

fn signal_invoke(context_id: i64, signal_name: &str, synchronous: bool) -> Message {
    Message::new(MessageType::WorkflowSignalInvokeRequest)
        .with_i64(props::CONTEXT_ID, context_id)
        .with_string(props::SIGNAL_NAME, signal_name)
        .with_bool(props::SYNCHRONOUS, synchronous)
}

/// Reply to `request` carrying a finished outcome.
fn outcome_reply(request: &Message, outcome: Outcome) -> Option<Message> {
    let mut reply = Message::reply_to(request)?;
    match outcome {
        Outcome::Completed(payload) => reply.set_payload(payload),
        Outcome::Failed {
            error_type,
            message,
        } => reply.set_error(error_type, message),
        Outcome::Cancelled => reply.set_error("Cancelled", "workflow cancelled"),
    }
    Some(reply)
}

/// Build the reply to `request` from the worker's answer to a forwarded request.
fn relay(request: &Message, forwarded: Result<Message, ConnectionError>) -> Option<Message> {
    let mut reply = Message::reply_to(request)?;
    match forwarded {
        Ok(answer) => {
            if let Some(payload) = answer.payload() {
                reply.set_payload(payload.clone());
            }
            if let Some(error) = answer.reply_error().unwrap() {
                reply.set_error(error.error_type, error.message);
            }
        }
        Err(e) => reply.set_error("Engine", e.to_string()),
    }
    Some(reply)
}

/// Send a workflow invoke and record the outcome if the worker answers it
/// directly.
fn send_invoke(state: &Arc<EngineState>, connection: &Connection, invoke: Message) {
    let context_id = invoke.context_id().unwrap();
    let pending = connection.send(invoke).unwrap();
    let state = state.clone();
    tokio::spawn(async move {
        if let Ok(reply) = pending.await {
            state.record_outcome(context_id, Outcome::from_message(&reply));
        }
    });
}

fn invoke_message(
    workflow_type: &str,
    context_id: i64,
    workflow_id: &str,
    payload: Option<Vec<u8>>,
) -> Message {
    let mut invoke = Message::new(MessageType::WorkflowInvokeRequest)
        .with_string(props::WORKFLOW_TYPE, workflow_type)
        .with_i64(props::CONTEXT_ID, context_id)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::RUN_ID, format!("run-{context_id}"))
        .with_i32(props::REPLAY_STATUS, 1);
    if let Some(payload) = payload {
        invoke.set_payload(payload);
    }
    invoke
}

struct EngineHandler {
    state: Arc<EngineState>,
}

#[async_trait]
impl MessageHandler for EngineHandler {
    async fn handle(&self, connection: Connection, message: Message) -> Option<Message> {
        let state = &self.state;
        match message.message_type() {
            MessageType::InitializeRequest => Some(
                Message::reply_to(&message)?
                    .with_string(props::PROTOCOL_VERSION, state.protocol_version.as_str())
                    .with_string(props::CAPABILITIES, "sync-signals,replay-history"),
            ),
            MessageType::WorkflowRegisterRequest => {
                let name = message.get_string(props::WORKFLOW_TYPE, "").ok()?;
                state.registered.lock().push(format!("workflow:{name}"));
                Message::reply_to(&message)
            }
            MessageType::ActivityRegisterRequest => {
                let name = message.get_string(props::ACTIVITY_TYPE, "").ok()?;
                state.registered.lock().push(format!("activity:{name}"));
                Message::reply_to(&message)
            }
            MessageType::NewWorkerRequest => {
                Some(Message::reply_to(&message)?.with_i64(props::WORKER_ID, 7))
            }
            MessageType::HeartbeatRequest => {
                state.heartbeats.fetch_add(1, Ordering::SeqCst);
                Message::reply_to(&message)
            }
            MessageType::WorkflowExecuteRequest => {
                let workflow_type = message.get_string(props::WORKFLOW_TYPE, "").ok()?;
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let (context_id, workflow_id) = state.start_run(
                    &connection,
                    &workflow_type,
                    Some(workflow_id),
                    message.payload().map(|b| b.to_vec()),
                );
                Some(
                    Message::reply_to(&message)?
                        .with_string(props::WORKFLOW_ID, workflow_id)
                        .with_string(props::RUN_ID, format!("run-{context_id}")),
                )
            }
            MessageType::ActivityExecuteRequest => {
                let activity_type = message.get_string(props::ACTIVITY_TYPE, "").ok()?;
                state.record_op(&message, "activity", activity_type.clone());
                let activity_id = state.next_activity.fetch_add(1, Ordering::SeqCst);
                let task_token = format!("token-{activity_id}");
                let mut invoke = Message::new(MessageType::ActivityInvokeRequest)
                    .with_string(props::ACTIVITY_TYPE, activity_type)
                    .with_i64(props::ACTIVITY_CONTEXT_ID, activity_id)
                    .with_string(props::TASK_TOKEN, task_token.as_str());
                if let Some(payload) = message.payload() {
                    invoke.set_payload(payload.clone());
                }
                // register before invoking so an early completion is not lost
                let (tx, rx) = oneshot::channel();
                state.pending_activities.lock().insert(task_token.clone(), tx);
                let answer = connection.request(invoke).await;
                let pending = matches!(
                    &answer,
                    Ok(answer) if answer.get_bool(props::RESULT_PENDING, false).unwrap()
                );
                if !pending {
                    state.pending_activities.lock().remove(&task_token);
                    return relay(&message, answer);
                }
                relay(&message, rx.await.map_err(|_| ConnectionError::ConnectionLost))
            }
            MessageType::ActivityCompleteRequest => {
                let task_token = message.get_string(props::TASK_TOKEN, "").ok()?;
                let waiter = state.pending_activities.lock().remove(&task_token);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message.clone());
                        Message::reply_to(&message)
                    }
                    None => Some(
                        Message::reply_to(&message)?.with_error("UnknownTaskToken", task_token),
                    ),
                }
            }
            MessageType::WorkflowExecuteChildRequest => {
                let workflow_type = message.get_string(props::WORKFLOW_TYPE, "").ok()?;
                state.record_op(&message, "child", workflow_type.clone());
                let (context_id, _) = state.start_run(
                    &connection,
                    &workflow_type,
                    message.get_optional_string(props::WORKFLOW_ID).ok()?,
                    message.payload().map(|b| b.to_vec()),
                );
                outcome_reply(&message, state.wait_outcome(context_id).await)
            }
            MessageType::WorkflowSignalChildRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let signal_name = message.get_string(props::SIGNAL_NAME, "").ok()?;
                state.record_op(&message, "signal-child", format!("{workflow_id}:{signal_name}"));
                let Some(context_id) = state.wait_context(&workflow_id).await else {
                    return Some(
                        Message::reply_to(&message)?.with_error("UnknownWorkflow", workflow_id),
                    );
                };
                let mut invoke = signal_invoke(context_id, &signal_name, false);
                if let Some(payload) = message.payload() {
                    invoke.set_payload(payload.clone());
                }
                relay(&message, connection.request(invoke).await)
            }
            MessageType::WorkflowCancelChildRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                state.record_op(&message, "cancel-child", workflow_id.clone());
                let Some(context_id) = state.wait_context(&workflow_id).await else {
                    return Some(
                        Message::reply_to(&message)?.with_error("UnknownWorkflow", workflow_id),
                    );
                };
                let invoke = Message::new(MessageType::CancelRequest)
                    .with_i64(props::CONTEXT_ID, context_id)
                    .with_string(props::REASON, "cancelled by parent");
                relay(&message, connection.request(invoke).await)
            }
            MessageType::WorkflowSleepRequest => {
                let duration = message
                    .get_duration(props::DURATION, Duration::ZERO)
                    .ok()?;
                state.record_op(&message, "sleep", format!("{}ms", duration.as_millis()));
                tokio::time::sleep(duration).await;
                Message::reply_to(&message)
            }
            MessageType::WorkflowSignalRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let context_id = state.workflows.lock().get(&workflow_id).copied();
                let Some(context_id) = context_id else {
                    return Some(
                        Message::reply_to(&message)?.with_error("UnknownWorkflow", workflow_id),
                    );
                };
                let mut invoke = signal_invoke(
                    context_id,
                    &message.get_string(props::SIGNAL_NAME, "").ok()?,
                    message.get_bool(props::SYNCHRONOUS, false).ok()?,
                );
                if let Some(payload) = message.payload() {
                    invoke.set_payload(payload.clone());
                }
                relay(&message, connection.request(invoke).await)
            }
            MessageType::WorkflowSignalWithStartRequest => {
                let workflow_type = message.get_string(props::WORKFLOW_TYPE, "").ok()?;
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let running = state
                    .workflows
                    .lock()
                    .get(&workflow_id)
                    .copied()
                    .filter(|context_id| state.is_running(*context_id));
                let context_id = match running {
                    Some(context_id) => context_id,
                    None => {
                        state
                            .start_run(
                                &connection,
                                &workflow_type,
                                Some(workflow_id.clone()),
                                message.payload().map(|b| b.to_vec()),
                            )
                            .0
                    }
                };
                let invoke = signal_invoke(
                    context_id,
                    &message.get_string(props::SIGNAL_NAME, "").ok()?,
                    false,
                )
                .with_payload(message.get_string(props::SIGNAL_ARGS, "{}").ok()?.into_bytes());
                let mut reply = relay(&message, connection.request(invoke).await)?;
                reply.set_string(props::WORKFLOW_ID, workflow_id);
                reply.set_string(props::RUN_ID, format!("run-{context_id}"));
                Some(reply)
            }
            MessageType::WorkflowGetResultRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let Some(context_id) = state.wait_context(&workflow_id).await else {
                    return Some(
                        Message::reply_to(&message)?.with_error("UnknownWorkflow", workflow_id),
                    );
                };
                outcome_reply(&message, state.wait_outcome(context_id).await)
            }
            MessageType::WorkflowDescribeExecutionRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let context_id = state.workflows.lock().get(&workflow_id).copied();
                let Some(context_id) = context_id else {
                    return Some(
                        Message::reply_to(&message)?.with_error("UnknownWorkflow", workflow_id),
                    );
                };
                let run = state.runs.lock().get(&context_id).cloned()?;
                let mut reply = Message::reply_to(&message)?
                    .with_string(props::WORKFLOW_ID, run.workflow_id)
                    .with_string(props::RUN_ID, format!("run-{context_id}"))
                    .with_string(props::WORKFLOW_TYPE, run.workflow_type)
                    .with_string(props::TASK_QUEUE, "test-queue")
                    .with_timestamp(props::START_TIME, run.started);
                let closed = state.outcomes.lock().get(&context_id).cloned();
                match closed {
                    None => reply.set_string(props::STATUS, "Running"),
                    Some((outcome, closed_at)) => {
                        let status = match outcome {
                            Outcome::Completed(_) => "Completed",
                            Outcome::Failed { .. } => "Failed",
                            Outcome::Cancelled => "Cancelled",
                        };
                        reply.set_string(props::STATUS, status);
                        reply.set_timestamp(props::CLOSE_TIME, closed_at);
                    }
                }
                Some(reply)
            }
            MessageType::WorkflowQueryRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let context_id = state.workflows.lock().get(&workflow_id).copied()?;
                let mut invoke = Message::new(MessageType::WorkflowQueryInvokeRequest)
                    .with_i64(props::CONTEXT_ID, context_id)
                    .with_string(
                        props::QUERY_NAME,
                        message.get_string(props::QUERY_NAME, "").ok()?,
                    );
                if let Some(payload) = message.payload() {
                    invoke.set_payload(payload.clone());
                }
                relay(&message, connection.request(invoke).await)
            }
            MessageType::WorkflowCancelRequest => {
                let workflow_id = message.get_string(props::WORKFLOW_ID, "").ok()?;
                let context_id = state.workflows.lock().get(&workflow_id).copied()?;
                let invoke = Message::new(MessageType::CancelRequest)
                    .with_i64(props::CONTEXT_ID, context_id)
                    .with_string(props::REASON, message.get_string(props::REASON, "").ok()?);
                relay(&message, connection.request(invoke).await)
            }
            MessageType::WorkflowCompleteRequest => {
                let context_id = message.context_id().ok()?;
                state.record_outcome(context_id, Outcome::from_message(&message));
                Message::reply_to(&message)
            }
            MessageType::ActivityRecordHeartbeatRequest => {
                let details = message.payload().map(|b| b.to_vec()).unwrap_or_default();
                let activity_id = message.get_i64(props::ACTIVITY_CONTEXT_ID, 0).ok()?;
                state
                    .heartbeat_details
                    .lock()
                    .insert(activity_id, details.clone());
                state.activity_heartbeats.lock().push(details);
                Message::reply_to(&message)
            }
            MessageType::ActivityGetHeartbeatDetailsRequest => {
                let activity_id = message.get_i64(props::ACTIVITY_CONTEXT_ID, 0).ok()?;
                let details = state.heartbeat_details.lock().get(&activity_id).cloned();
                let mut reply = Message::reply_to(&message)?;
                if let Some(details) = details {
                    reply.set_payload(details);
                }
                Some(reply)
            }
            _ => Message::reply_to(&message),
        }
    }
}

/// Engine end of an in-memory connection.
pub struct MockEngine {
    pub connection: Connection,
    pub state: Arc<EngineState>,
}

impl MockEngine {
    /// Connect `client` to a fresh mock engine and start its worker.
    pub async fn start(client: &mut CadenzaClient) -> MockEngine {
        let engine = Self::attach(client, "1.0").await.unwrap();
        client.start_worker().await.unwrap();
        engine
    }

    /// Connect `client` to a mock engine announcing `protocol_version`.
    pub async fn attach(
        client: &mut CadenzaClient,
        protocol_version: &str,
    ) -> cadenza_sdk::Result<MockEngine> {
        let (client_side, engine_side) = tokio::io::duplex(1024 * 1024);
        let state = Arc::new(EngineState::new(protocol_version));
        let connection = Connection::open(
            engine_side,
            Arc::new(EngineHandler {
                state: state.clone(),
            }),
        );
        client.connect_with_stream(client_side).await?;
        Ok(MockEngine { connection, state })
    }

    /// Invoke a workflow directly, optionally replaying recorded history.
    pub fn invoke(
        &self,
        workflow_type: &str,
        context_id: i64,
        args: Args,
        history: Option<&[OperationRecord]>,
    ) {
        let mut invoke = invoke_message(
            workflow_type,
            context_id,
            &format!("direct-{context_id}"),
            Some(args.to_payload().unwrap()),
        );
        if let Some(history) = history {
            invoke.set_string(props::HISTORY, serde_json::to_string(history).unwrap());
            invoke.set_i32(props::REPLAY_STATUS, 2);
        }
        send_invoke(&self.state, &self.connection, invoke);
    }

    /// Send a raw request to the worker without waiting for its reply.
    pub fn send(&self, message: Message) -> PendingOperation {
        self.connection.send(message).unwrap()
    }

    /// Pipeline an async signal invoke straight to the worker.
    pub fn signal(&self, context_id: i64, signal_name: &str, args: Args) -> PendingOperation {
        self.send(
            signal_invoke(context_id, signal_name, false).with_payload(args.to_payload().unwrap()),
        )
    }

    /// Invoke an activity directly on the worker.
    pub fn invoke_activity(&self, activity_type: &str, activity_context_id: i64) -> PendingOperation {
        self.send(
            Message::new(MessageType::ActivityInvokeRequest)
                .with_string(props::ACTIVITY_TYPE, activity_type)
                .with_i64(props::ACTIVITY_CONTEXT_ID, activity_context_id),
        )
    }

    /// Ask the worker to stop an activity and wait for the acknowledgement.
    pub async fn stop_activity(&self, activity_context_id: i64) -> Message {
        self.send(
            Message::new(MessageType::ActivityStopRequest)
                .with_i64(props::ACTIVITY_CONTEXT_ID, activity_context_id),
        )
        .await
        .unwrap()
    }

    /// Context id the engine assigned to `workflow_id`.
    pub fn context_of(&self, workflow_id: &str) -> i64 {
        self.state.workflows.lock()[workflow_id]
    }

    /// Wait (bounded) for the final outcome of a context.
    pub async fn outcome(&self, context_id: i64) -> Outcome {
        tokio::time::timeout(Duration::from_secs(10), self.state.wait_outcome(context_id))
            .await
            .expect("workflow did not finish in time")
    }

    pub async fn outcome_of(&self, workflow_id: &str) -> Outcome {
        self.outcome(self.context_of(workflow_id)).await
    }

    pub fn operations(&self, context_id: i64) -> Vec<RecordedOp> {
        self.state
            .operations
            .lock()
            .get(&context_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn registered(&self) -> Vec<String> {
        self.state.registered.lock().clone()
    }

    pub fn activity_heartbeats(&self) -> Vec<Vec<u8>> {
        self.state.activity_heartbeats.lock().clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Client config for tests: no background heartbeats, short timeouts.
pub fn test_config() -> SdkConfig {
    SdkConfig::new("test-queue")
        .with_heartbeat_interval_ms(0)
        .with_request_timeout_ms(5_000)
        .with_signal_reply_timeout_ms(2_000)
}
