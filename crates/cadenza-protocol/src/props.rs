// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Well-known property names.

/// Correlation id assigned by the sending connection (int64).
pub const REQUEST_ID: &str = "RequestId";
/// Workflow execution context the message belongs to (int64).
pub const CONTEXT_ID: &str = "ContextId";
/// Position-derived operation id within a workflow execution (int64).
pub const OPERATION_ID: &str = "OperationId";
/// Replay status of the execution (int32, see `ReplayStatus` in the SDK).
pub const REPLAY_STATUS: &str = "ReplayStatus";
/// Recorded operation history for replay verification (JSON string).
pub const HISTORY: &str = "History";

pub const WORKFLOW_TYPE: &str = "WorkflowType";
pub const WORKFLOW_ID: &str = "WorkflowId";
pub const RUN_ID: &str = "RunId";
pub const ACTIVITY_TYPE: &str = "ActivityType";
/// Engine-assigned id of one activity invocation (int64).
pub const ACTIVITY_CONTEXT_ID: &str = "ActivityContextId";
pub const TASK_QUEUE: &str = "TaskQueue";
pub const NAMESPACE: &str = "Namespace";
pub const IDENTITY: &str = "Identity";
pub const WORKER_ID: &str = "WorkerId";

pub const PROTOCOL_VERSION: &str = "ProtocolVersion";
pub const LIBRARY_VERSION: &str = "LibraryVersion";
pub const CAPABILITIES: &str = "Capabilities";
pub const SENT_AT: &str = "SentAt";

pub const SIGNAL_NAME: &str = "SignalName";
/// Signal arguments when the payload carries something else (JSON string).
pub const SIGNAL_ARGS: &str = "SignalArgs";
/// Whether a signal expects a reply from workflow logic (bool).
pub const SYNCHRONOUS: &str = "Synchronous";
pub const QUERY_NAME: &str = "QueryName";
pub const REASON: &str = "Reason";
pub const WAS_CANCELLED: &str = "WasCancelled";

/// Opaque engine token identifying one activity attempt (string).
pub const TASK_TOKEN: &str = "TaskToken";
/// Set on an activity reply whose result will be completed externally (bool).
pub const RESULT_PENDING: &str = "ResultPending";

/// Workflow execution status name (string).
pub const STATUS: &str = "Status";
pub const START_TIME: &str = "StartTime";
pub const CLOSE_TIME: &str = "CloseTime";

/// Timer duration (duration).
pub const DURATION: &str = "Duration";
pub const SCHEDULE_TO_CLOSE_TIMEOUT: &str = "ScheduleToCloseTimeout";
pub const START_TO_CLOSE_TIMEOUT: &str = "StartToCloseTimeout";
pub const HEARTBEAT_TIMEOUT: &str = "HeartbeatTimeout";

/// Error message carried by a failed reply (string).
pub const ERROR: &str = "Error";
/// Error category carried by a failed reply (string).
pub const ERROR_TYPE: &str = "ErrorType";
