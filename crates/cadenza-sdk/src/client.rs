// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Main client for talking to the workflow engine.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadenza_protocol::{Connection, Message, props};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activity::{Activity, ActivityContext};
use crate::args::Args;
use crate::config::SdkConfig;
use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};
use crate::registry::Registry;
use crate::requests;
use crate::types::{
    HandshakeInfo, Payload, WorkflowDescription, WorkflowExecution, WorkflowStatus,
};
use crate::worker::Worker;
use crate::workflow::Workflow;

/// Capabilities announced during the initialize handshake.
const CAPABILITIES: &[&str] = &["sync-signals", "replay-history", "local-activities"];

struct Session {
    connection: Connection,
    worker: Worker,
    handshake: HandshakeInfo,
    heartbeat_cancel: CancellationToken,
    worker_id: Option<i64>,
}

/// High-level client for the workflow engine.
///
/// Register workflow and activity types first, then connect. The same
/// connection carries client calls (start, signal, query, cancel) and the
/// engine's requests to this process's [`Worker`].
///
/// # Example
///
/// ```ignore
/// use cadenza_sdk::{Args, CadenzaClient, SdkConfig, WorkflowContext};
///
/// let mut client = CadenzaClient::new(SdkConfig::localhost("orders"));
/// client.register_workflow_fn("Order", |ctx: WorkflowContext, args: Args| async move {
///     let receipt = ctx.activity("Charge").execute(args).await?;
///     Ok(receipt)
/// })?;
/// client.connect().await?;
/// client.start_worker().await?;
///
/// let run = client.start_workflow("Order", "order-42", Args::new().with("amount", 10)).await?;
/// ```
pub struct CadenzaClient {
    config: Arc<SdkConfig>,
    registry: Registry,
    session: Option<Session>,
}

impl CadenzaClient {
    // ========== Construction ==========

    pub fn new(config: SdkConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Registry::new(),
            session: None,
        }
    }

    /// Create a client from environment variables.
    ///
    /// See [`SdkConfig::from_env`] for required and optional environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(SdkConfig::from_env()?))
    }

    /// Create a client for local development against `127.0.0.1:5000`.
    pub fn localhost(task_queue: impl Into<String>) -> Self {
        Self::new(SdkConfig::localhost(task_queue))
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ========== Registration ==========

    fn registry_mut(&mut self) -> Result<&mut Registry> {
        if self.session.is_some() {
            return Err(SdkError::Registration(
                "types must be registered before connecting".to_string(),
            ));
        }
        Ok(&mut self.registry)
    }

    pub fn register_workflow_type<W, F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.registry_mut()?.register_workflow_type(name, factory)
    }

    pub fn register_activity_type<A, F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        A: Activity,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.registry_mut()?.register_activity_type(name, factory)
    }

    pub fn register_workflow_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(WorkflowContext, Args) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.registry_mut()?.register_workflow_fn(name, f)
    }

    pub fn register_activity_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(ActivityContext, Args) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.registry_mut()?.register_activity_fn(name, f)
    }

    // ========== Connection ==========

    /// Connect to the engine over TCP and run the handshake.
    #[instrument(skip(self), fields(addr = %self.config.server_addr))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let worker = Worker::new(self.registry.clone(), self.config.clone());
        let connection = Connection::connect(
            &self.config.server_addr.to_string(),
            self.config.connect_timeout(),
            Arc::new(worker.clone()),
        )
        .await?;
        self.attach(connection, worker).await
    }

    /// Run the handshake over an already-open stream.
    pub async fn connect_with_stream<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_connected() {
            return Ok(());
        }
        let worker = Worker::new(self.registry.clone(), self.config.clone());
        let connection = Connection::open(stream, Arc::new(worker.clone()));
        self.attach(connection, worker).await
    }

    async fn attach(&mut self, connection: Connection, worker: Worker) -> Result<()> {
        worker.watch_connection(connection.clone());
        let handshake = match handshake(&connection, &self.config).await {
            Ok(handshake) => handshake,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };
        info!(
            protocol_version = %handshake.protocol_version,
            capabilities = ?handshake.capabilities,
            "connected to engine"
        );
        let heartbeat_cancel = spawn_heartbeat(connection.clone(), self.config.clone());
        self.session = Some(Session {
            connection,
            worker,
            handshake,
            heartbeat_cancel,
            worker_id: None,
        });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.connection.is_active())
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.session.as_ref().map(|session| &session.connection)
    }

    pub fn worker(&self) -> Option<&Worker> {
        self.session.as_ref().map(|session| &session.worker)
    }

    /// What the engine reported during the handshake.
    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.session.as_ref().map(|session| &session.handshake)
    }

    pub fn worker_id(&self) -> Option<i64> {
        self.session.as_ref().and_then(|session| session.worker_id)
    }

    /// Stop heartbeats and close the connection.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.heartbeat_cancel.cancel();
            session.connection.close().await;
            info!("connection closed");
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| SdkError::Protocol("not connected, call connect() first".to_string()))
    }

    async fn call(&self, message: Message) -> Result<Message> {
        self.call_with_timeout(message, self.config.request_timeout())
            .await
    }

    async fn call_with_timeout(&self, message: Message, timeout: Duration) -> Result<Message> {
        let reply = self
            .session()?
            .connection
            .request_with_timeout(message, timeout)
            .await?;
        requests::check_reply(reply)
    }

    // ========== Worker ==========

    /// Register every local type with the engine and start polling the task
    /// queue. Returns the engine-assigned worker id.
    #[instrument(skip(self), fields(task_queue = %self.config.task_queue))]
    pub async fn start_worker(&mut self) -> Result<i64> {
        let task_queue = self.config.task_queue.clone();
        for workflow_type in self.registry.workflow_types() {
            self.call(requests::build_workflow_register(&workflow_type, &task_queue))
                .await
                .map_err(|e| SdkError::Registration(format!("workflow '{workflow_type}': {e}")))?;
            debug!(%workflow_type, "workflow type registered");
        }
        for activity_type in self.registry.activity_types() {
            self.call(requests::build_activity_register(&activity_type, &task_queue))
                .await
                .map_err(|e| SdkError::Registration(format!("activity '{activity_type}': {e}")))?;
            debug!(%activity_type, "activity type registered");
        }

        let reply = self
            .call(requests::build_new_worker(&task_queue, &self.config.identity))
            .await?;
        let worker_id = reply.get_i64(props::WORKER_ID, 0)?;
        if let Some(session) = self.session.as_mut() {
            session.worker_id = Some(worker_id);
        }
        info!(worker_id, "worker started");
        Ok(worker_id)
    }

    /// Stop the worker started with [`CadenzaClient::start_worker`].
    #[instrument(skip(self))]
    pub async fn stop_worker(&mut self) -> Result<()> {
        let Some(worker_id) = self.session.as_mut().and_then(|s| s.worker_id.take()) else {
            return Ok(());
        };
        self.call(requests::build_stop_worker(worker_id)).await?;
        info!(worker_id, "worker stopped");
        Ok(())
    }

    // ========== Workflows ==========

    #[instrument(skip(self, args))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        args: Args,
    ) -> Result<WorkflowExecution> {
        let request = requests::build_workflow_execute(
            workflow_type,
            workflow_id,
            &self.config.task_queue,
            args.to_payload()?,
        );
        let reply = self.call(request).await?;
        let execution = WorkflowExecution {
            workflow_id: reply.get_string(props::WORKFLOW_ID, workflow_id)?,
            run_id: reply.get_string(props::RUN_ID, "")?,
        };
        info!(run_id = %execution.run_id, "workflow started");
        Ok(execution)
    }

    /// Deliver an asynchronous signal. Returns once the signal is queued.
    #[instrument(skip(self, args))]
    pub async fn signal_workflow(&self, workflow_id: &str, signal: &str, args: Args) -> Result<()> {
        let request =
            requests::build_workflow_signal(workflow_id, signal, false, args.to_payload()?);
        self.call(request).await?;
        Ok(())
    }

    /// Deliver a synchronous signal and wait for the workflow's reply.
    #[instrument(skip(self, args))]
    pub async fn signal_workflow_sync(
        &self,
        workflow_id: &str,
        signal: &str,
        args: Args,
    ) -> Result<Payload> {
        let request =
            requests::build_workflow_signal(workflow_id, signal, true, args.to_payload()?);
        let timeout = self.config.signal_reply_timeout() + self.config.request_timeout();
        let reply = self.call_with_timeout(request, timeout).await?;
        Ok(requests::reply_payload(&reply))
    }

    /// Signal `workflow_id`, starting it with `args` first when no execution
    /// with that id is running. Returns the execution the signal went to.
    #[instrument(skip(self, args, signal_args))]
    pub async fn signal_with_start(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        args: Args,
        signal: &str,
        signal_args: Args,
    ) -> Result<WorkflowExecution> {
        let request = requests::build_signal_with_start(
            workflow_type,
            workflow_id,
            &self.config.task_queue,
            signal,
            &signal_args,
            args.to_payload()?,
        )?;
        let reply = self.call(request).await?;
        let execution = WorkflowExecution {
            workflow_id: reply.get_string(props::WORKFLOW_ID, workflow_id)?,
            run_id: reply.get_string(props::RUN_ID, "")?,
        };
        info!(run_id = %execution.run_id, "workflow signalled with start");
        Ok(execution)
    }

    /// Synchronous signal with a JSON-decoded reply.
    pub async fn signal_workflow_sync_json<T: serde::de::DeserializeOwned>(
        &self,
        workflow_id: &str,
        signal: &str,
        args: Args,
    ) -> Result<T> {
        let payload = self.signal_workflow_sync(workflow_id, signal, args).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    #[instrument(skip(self, args))]
    pub async fn query_workflow(&self, workflow_id: &str, query: &str, args: Args) -> Result<Payload> {
        let request = requests::build_workflow_query(workflow_id, query, args.to_payload()?);
        let reply = self.call(request).await?;
        Ok(requests::reply_payload(&reply))
    }

    /// Wait for `workflow_id` to finish and return its result.
    ///
    /// Waits as long as the workflow runs; wrap the call in
    /// `tokio::time::timeout` to bound it.
    #[instrument(skip(self))]
    pub async fn get_workflow_result(&self, workflow_id: &str) -> Result<Payload> {
        let reply = self
            .session()?
            .connection
            .request(requests::build_workflow_get_result(workflow_id))
            .await?;
        let reply = requests::check_reply(reply)?;
        Ok(requests::reply_payload(&reply))
    }

    /// Workflow result decoded as JSON.
    pub async fn get_workflow_result_json<T: serde::de::DeserializeOwned>(
        &self,
        workflow_id: &str,
    ) -> Result<T> {
        let payload = self.get_workflow_result(workflow_id).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    #[instrument(skip(self))]
    pub async fn describe_workflow(&self, workflow_id: &str) -> Result<WorkflowDescription> {
        let reply = self
            .call(requests::build_workflow_describe(workflow_id))
            .await?;
        let close_time = if reply.contains(props::CLOSE_TIME) {
            Some(reply.get_timestamp(props::CLOSE_TIME, DateTime::<Utc>::UNIX_EPOCH)?)
        } else {
            None
        };
        Ok(WorkflowDescription {
            workflow_id: reply.get_string(props::WORKFLOW_ID, workflow_id)?,
            run_id: reply.get_string(props::RUN_ID, "")?,
            workflow_type: reply.get_string(props::WORKFLOW_TYPE, "")?,
            task_queue: reply.get_string(props::TASK_QUEUE, "")?,
            status: WorkflowStatus::from_name(&reply.get_string(props::STATUS, "")?),
            start_time: reply.get_timestamp(props::START_TIME, DateTime::<Utc>::UNIX_EPOCH)?,
            close_time,
        })
    }

    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<()> {
        self.call(requests::build_workflow_cancel(workflow_id, reason))
            .await?;
        info!("workflow cancellation requested");
        Ok(())
    }

    // ========== Activities ==========

    /// Finish an activity that returned
    /// [`SdkError::ResultPending`], identified by its task token.
    #[instrument(skip(self, task_token, result))]
    pub async fn complete_activity(&self, task_token: &str, result: Result<Payload>) -> Result<()> {
        self.call(requests::build_activity_complete(task_token, &result))
            .await?;
        debug!(succeeded = result.is_ok(), "activity completed externally");
        Ok(())
    }

    // ========== Health ==========

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.call(requests::build_ping()).await?;
        Ok(started.elapsed())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.call(requests::build_heartbeat(&self.config.identity))
            .await?;
        Ok(())
    }
}

impl Drop for CadenzaClient {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.heartbeat_cancel.cancel();
            session.connection.shutdown();
        }
    }
}

impl std::fmt::Debug for CadenzaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenzaClient")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Initialize and connect handshake.
async fn handshake(connection: &Connection, config: &SdkConfig) -> Result<HandshakeInfo> {
    let initialize = requests::build_initialize(env!("CARGO_PKG_VERSION"), CAPABILITIES);
    let reply = connection
        .request_with_timeout(initialize, config.request_timeout())
        .await?;
    let reply = requests::check_reply(reply)?;

    let protocol_version = reply.get_string(props::PROTOCOL_VERSION, "")?;
    if major_version(&protocol_version) != major_version(cadenza_protocol::PROTOCOL_VERSION) {
        return Err(SdkError::Protocol(format!(
            "engine speaks protocol {protocol_version}, this runtime speaks {}",
            cadenza_protocol::PROTOCOL_VERSION
        )));
    }
    let capabilities = reply
        .get_string(props::CAPABILITIES, "")?
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();

    let connect = requests::build_connect(&config.namespace, &config.identity);
    let reply = connection
        .request_with_timeout(connect, config.request_timeout())
        .await?;
    requests::check_reply(reply)?;

    Ok(HandshakeInfo {
        protocol_version,
        capabilities,
    })
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or_default()
}

/// Spawn the background heartbeat loop. Disabled when the interval is 0.
fn spawn_heartbeat(connection: Connection, config: Arc<SdkConfig>) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    if config.heartbeat_interval_ms == 0 {
        return cancel_token;
    }

    let token = cancel_token.clone();
    let interval = Duration::from_millis(config.heartbeat_interval_ms);
    tokio::spawn(async move {
        debug!(
            interval_ms = config.heartbeat_interval_ms,
            "background heartbeat task started"
        );
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("background heartbeat task cancelled");
                    break;
                }

                _ = connection.closed() => {
                    debug!("connection closed, stopping heartbeats");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    let heartbeat = requests::build_heartbeat(&config.identity);
                    match connection.request_with_timeout(heartbeat, config.request_timeout()).await {
                        Ok(_) => debug!("background heartbeat sent"),
                        Err(e) => warn!(error = %e, "failed to send background heartbeat"),
                    }
                }
            }
        }
    });
    cancel_token
}
