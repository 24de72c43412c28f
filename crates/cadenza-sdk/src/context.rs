// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution workflow state and the determinism model.
//!
//! Every stub operation a workflow issues takes the next id from the
//! context's sequence counter (`1, 2, 3, ...`). Running the same workflow
//! code against the same recorded results therefore issues the same ids in
//! the same order. When the engine supplies the recorded history of a
//! previous run, each new operation is checked against the record at the same
//! position and a mismatch fails with `DeterminismViolation`. Operations past
//! the end of the history are new work.
//!
//! Suspension points (awaiting a stub result, dequeuing from an empty signal
//! queue) flip the execution to `Suspended` for as long as at least one of
//! them is waiting, and resolve with `Cancelled` once the execution is
//! cancelled.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use cadenza_protocol::{Connection, Message};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::args::Args;
use crate::config::SdkConfig;
use crate::error::{Result, SdkError};
use crate::registry::Registry;
use crate::requests;
use crate::signals::{SignalQueue, SignalRequest};
use crate::stub::Stub;
use crate::types::{ExecutionState, OperationRecord, Payload, ReplayStatus, StubKind};

/// Shared state machine and cancellation for one execution.
pub(crate) struct ExecutionControl {
    state: watch::Sender<ExecutionState>,
    suspensions: Mutex<usize>,
    suspended_once: AtomicBool,
    first_suspension: Notify,
    cancel: CancellationToken,
}

impl ExecutionControl {
    pub(crate) fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ExecutionState::Created);
        Arc::new(Self {
            state,
            suspensions: Mutex::new(0),
            suspended_once: AtomicBool::new(false),
            first_suspension: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.state.subscribe()
    }

    pub(crate) fn start(&self) {
        self.state.send_if_modified(|state| {
            if *state == ExecutionState::Created {
                *state = ExecutionState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Move to a terminal state. The first terminal state wins.
    pub(crate) fn finish(&self, terminal: ExecutionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
    }

    pub(crate) fn suspend(self: &Arc<Self>) -> SuspendGuard {
        {
            let mut count = self.suspensions.lock();
            *count += 1;
            if *count == 1 {
                self.state.send_if_modified(|state| {
                    if *state == ExecutionState::Running {
                        *state = ExecutionState::Suspended;
                        true
                    } else {
                        false
                    }
                });
            }
        }
        if !self.suspended_once.swap(true, Ordering::AcqRel) {
            self.first_suspension.notify_one();
        }
        SuspendGuard {
            control: self.clone(),
        }
    }

    fn resume(&self) {
        let mut count = self.suspensions.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.state.send_if_modified(|state| {
                if *state == ExecutionState::Suspended {
                    *state = ExecutionState::Running;
                    true
                } else {
                    false
                }
            });
        }
    }

    pub(crate) fn has_suspended(&self) -> bool {
        self.suspended_once.load(Ordering::Acquire)
    }

    /// Resolves once the execution has reached its first suspension point.
    pub(crate) async fn first_suspension(&self) {
        if self.has_suspended() {
            return;
        }
        self.first_suspension.notified().await;
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Marks one waiting suspension point; resumes on drop.
pub(crate) struct SuspendGuard {
    control: Arc<ExecutionControl>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.control.resume();
    }
}

pub(crate) struct ContextParams {
    pub context_id: i64,
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_queue: String,
    pub replay_status: ReplayStatus,
    pub history: Option<Vec<OperationRecord>>,
    pub connection: Connection,
    pub registry: Arc<Registry>,
    pub config: Arc<SdkConfig>,
}

struct ContextInner {
    params: ContextParams,
    control: Arc<ExecutionControl>,
    sequence: AtomicU64,
    journal: Mutex<Vec<OperationRecord>>,
    outstanding: Mutex<BTreeSet<u64>>,
    signals: Mutex<HashMap<String, SignalQueue<Args>>>,
    sync_signals: Mutex<HashMap<String, SignalQueue<SignalRequest>>>,
}

/// Handle to one workflow execution, passed explicitly to workflow code.
///
/// Cloning is cheap; all clones refer to the same execution.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("context_id", &self.inner.params.context_id)
            .field("workflow_type", &self.inner.params.workflow_type)
            .field("workflow_id", &self.inner.params.workflow_id)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkflowContext {
    pub(crate) fn new(params: ContextParams) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                params,
                control: ExecutionControl::new(),
                sequence: AtomicU64::new(0),
                journal: Mutex::new(Vec::new()),
                outstanding: Mutex::new(BTreeSet::new()),
                signals: Mutex::new(HashMap::new()),
                sync_signals: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ========== Identity ==========

    /// Engine-assigned id of this execution.
    pub fn context_id(&self) -> i64 {
        self.inner.params.context_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.inner.params.workflow_type
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.params.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.inner.params.run_id
    }

    pub fn task_queue(&self) -> &str {
        &self.inner.params.task_queue
    }

    /// Whether this run is replaying recorded history.
    pub fn is_replaying(&self) -> bool {
        self.inner.params.replay_status == ReplayStatus::Replaying
    }

    // ========== State ==========

    pub fn state(&self) -> ExecutionState {
        self.inner.control.state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ExecutionState> {
        self.inner.control.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.control.cancel.is_cancelled()
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        self.inner.control.cancel.cancelled().await
    }

    /// Operations issued so far, in order.
    pub fn journal(&self) -> Vec<OperationRecord> {
        self.inner.journal.lock().clone()
    }

    /// Ids of started operations whose results have not been taken yet.
    pub fn outstanding(&self) -> Vec<u64> {
        self.inner.outstanding.lock().iter().copied().collect()
    }

    // ========== Stubs ==========

    /// Stub for an activity run by the engine on some worker.
    pub fn activity(&self, activity_type: impl Into<String>) -> Stub {
        Stub::new(self.clone(), StubKind::Activity, activity_type.into(), None)
    }

    /// Stub for an activity run in this process.
    pub fn local_activity(&self, activity_type: impl Into<String>) -> Stub {
        Stub::new(
            self.clone(),
            StubKind::LocalActivity,
            activity_type.into(),
            None,
        )
    }

    pub fn child_workflow(&self, workflow_type: impl Into<String>) -> Stub {
        Stub::new(
            self.clone(),
            StubKind::ChildWorkflow,
            workflow_type.into(),
            None,
        )
    }

    /// Durable timer stub.
    pub fn timer(&self, duration: Duration) -> Stub {
        Stub::new(
            self.clone(),
            StubKind::Timer,
            format!("{}ms", duration.as_millis()),
            Some(duration),
        )
    }

    /// Durable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.timer(duration).execute(Args::new()).await.map(|_| ())
    }

    // ========== Children ==========

    /// Send an asynchronous signal to a child workflow started by this
    /// execution. Takes an operation id like any stub.
    #[instrument(skip(self, args), fields(context_id = self.context_id()))]
    pub async fn signal_child(&self, child_workflow_id: &str, signal: &str, args: Args) -> Result<()> {
        let operation_id = self.begin(StubKind::SignalChild, &format!("{child_workflow_id}:{signal}"))?;
        let request = args.to_payload().map(|payload| {
            requests::build_signal_child(
                self.context_id(),
                operation_id,
                child_workflow_id,
                signal,
                payload,
            )
        });
        self.finish_operation(operation_id, request).await
    }

    /// Request cancellation of a child workflow started by this execution.
    #[instrument(skip(self), fields(context_id = self.context_id()))]
    pub async fn cancel_child(&self, child_workflow_id: &str) -> Result<()> {
        let operation_id = self.begin(StubKind::CancelChild, child_workflow_id)?;
        let request = requests::build_cancel_child(self.context_id(), operation_id, child_workflow_id);
        self.finish_operation(operation_id, Ok(request)).await
    }

    fn begin(&self, kind: StubKind, target: &str) -> Result<u64> {
        if self.is_cancelled() {
            return Err(SdkError::Cancelled);
        }
        self.next_operation(kind, target)
    }

    /// Send `request` for `operation_id` and wait for the engine to accept it.
    async fn finish_operation(&self, operation_id: u64, request: Result<Message>) -> Result<()> {
        let result = async {
            let pending = self.connection().send(request?)?;
            let reply = self
                .suspend_on(async move { pending.await.map_err(SdkError::from) })
                .await?;
            requests::check_reply(reply).map(|_| ())
        }
        .await;
        self.complete_operation(operation_id);
        result
    }

    // ========== Signals ==========

    /// Queue of asynchronous signals with this name.
    pub fn signal_queue(&self, name: &str) -> SignalQueue<Args> {
        self.inner
            .signals
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| SignalQueue::bound(name, self.inner.control.clone()))
            .clone()
    }

    /// Queue of deferred synchronous signals with this name.
    pub fn sync_signal_queue(&self, name: &str) -> SignalQueue<SignalRequest> {
        self.inner
            .sync_signals
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| SignalQueue::bound(name, self.inner.control.clone()))
            .clone()
    }

    // ========== Internals ==========

    pub(crate) fn control(&self) -> &Arc<ExecutionControl> {
        &self.inner.control
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.inner.params.connection
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner.params.registry
    }

    pub(crate) fn config(&self) -> &SdkConfig {
        &self.inner.params.config
    }

    /// Take the next operation id, checking it against recorded history.
    pub(crate) fn next_operation(&self, kind: StubKind, target: &str) -> Result<u64> {
        let operation_id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = OperationRecord {
            operation_id,
            kind,
            target: target.to_string(),
        };

        if let Some(history) = &self.inner.params.history
            && let Some(expected) = history.get((operation_id - 1) as usize)
            && (expected.kind != kind || expected.target != target)
        {
            return Err(SdkError::DeterminismViolation {
                operation_id,
                expected: expected.to_string(),
                actual: record.to_string(),
            });
        }

        debug!(
            context_id = self.context_id(),
            operation_id,
            %kind,
            target,
            "operation issued"
        );
        self.inner.journal.lock().push(record);
        self.inner.outstanding.lock().insert(operation_id);
        Ok(operation_id)
    }

    pub(crate) fn complete_operation(&self, operation_id: u64) {
        self.inner.outstanding.lock().remove(&operation_id);
    }

    /// Enter the terminal state and close every signal queue.
    pub(crate) fn teardown(&self, terminal: ExecutionState) {
        self.inner.control.finish(terminal);
        self.close_queues();
    }

    /// Cancel and tear down; used when the connection is gone.
    pub(crate) fn abandon(&self) {
        self.inner.control.cancel();
        self.teardown(ExecutionState::Cancelled);
    }

    fn close_queues(&self) {
        let signals: Vec<_> = self.inner.signals.lock().values().cloned().collect();
        for queue in signals {
            queue.close();
        }
        let sync_signals: Vec<_> = self.inner.sync_signals.lock().values().cloned().collect();
        for queue in sync_signals {
            queue.close();
        }
    }

    /// Run `future` as a suspension point of this execution.
    pub(crate) async fn suspend_on<F, T>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let cancel = self.inner.control.cancel_token();
        if cancel.is_cancelled() {
            return Err(SdkError::Cancelled);
        }
        let _suspended = self.inner.control.suspend();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SdkError::Cancelled),
            result = future => result,
        }
    }
}

/// Parse the `History` property of a workflow invoke.
pub(crate) fn parse_history(json: &str) -> Result<Vec<OperationRecord>> {
    Ok(serde_json::from_str(json)?)
}

/// Outcome of a workflow run mapped to its terminal state.
pub(crate) fn terminal_state(result: &Result<Payload>) -> ExecutionState {
    match result {
        Ok(_) => ExecutionState::Completed,
        Err(SdkError::Cancelled) => ExecutionState::Cancelled,
        Err(_) => ExecutionState::Failed,
    }
}
