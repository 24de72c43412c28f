// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque result or argument bytes.
pub type Payload = Vec<u8>;

/// Lifecycle of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Context built, workflow code not started yet
    Created,
    /// Workflow code is making progress
    Running,
    /// Workflow code is waiting on at least one suspension point
    Suspended,
    /// Workflow returned a result
    Completed,
    /// Workflow returned an error
    Failed,
    /// Workflow was cancelled
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// Replay status reported by the engine on a workflow invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Unspecified,
    NotReplaying,
    Replaying,
}

impl From<i32> for ReplayStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => ReplayStatus::NotReplaying,
            2 => ReplayStatus::Replaying,
            _ => ReplayStatus::Unspecified,
        }
    }
}

impl From<ReplayStatus> for i32 {
    fn from(status: ReplayStatus) -> Self {
        match status {
            ReplayStatus::Unspecified => 0,
            ReplayStatus::NotReplaying => 1,
            ReplayStatus::Replaying => 2,
        }
    }
}

/// Kind of operation a stub issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubKind {
    Activity,
    LocalActivity,
    ChildWorkflow,
    Timer,
    /// Signal sent to a child workflow
    SignalChild,
    /// Cancellation requested for a child workflow
    CancelChild,
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StubKind::Activity => "activity",
            StubKind::LocalActivity => "local activity",
            StubKind::ChildWorkflow => "child workflow",
            StubKind::Timer => "timer",
            StubKind::SignalChild => "child signal",
            StubKind::CancelChild => "child cancellation",
        };
        f.write_str(name)
    }
}

/// One journaled stub operation.
///
/// A list of these, serialized as JSON, is the recorded history the engine
/// sends back on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: u64,
    pub kind: StubKind,
    pub target: String,
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.target)
    }
}

/// Handle to a started workflow execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Engine-side status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
    TimedOut,
    /// A status name this runtime does not know
    Unknown,
}

impl WorkflowStatus {
    /// Parse the `Status` property of a describe reply.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Running" => WorkflowStatus::Running,
            "Completed" => WorkflowStatus::Completed,
            "Failed" => WorkflowStatus::Failed,
            "Cancelled" | "Canceled" => WorkflowStatus::Cancelled,
            "Terminated" => WorkflowStatus::Terminated,
            "TimedOut" => WorkflowStatus::TimedOut,
            _ => WorkflowStatus::Unknown,
        }
    }

    pub fn is_closed(self) -> bool {
        !matches!(self, WorkflowStatus::Running | WorkflowStatus::Unknown)
    }
}

/// Result of [`crate::CadenzaClient::describe_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDescription {
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    /// Unset while the execution is running
    pub close_time: Option<DateTime<Utc>>,
}

/// What the engine reported during the initialize handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: String,
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Created.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::Suspended.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
    }

    #[test]
    fn test_replay_status_from_i32() {
        assert_eq!(ReplayStatus::from(1), ReplayStatus::NotReplaying);
        assert_eq!(ReplayStatus::from(2), ReplayStatus::Replaying);
        assert_eq!(ReplayStatus::from(99), ReplayStatus::Unspecified);
        assert_eq!(i32::from(ReplayStatus::Replaying), 2);
    }

    #[test]
    fn test_workflow_status_names() {
        assert_eq!(WorkflowStatus::from_name("Running"), WorkflowStatus::Running);
        assert_eq!(WorkflowStatus::from_name("Canceled"), WorkflowStatus::Cancelled);
        assert_eq!(WorkflowStatus::from_name("ContinuedAsNew"), WorkflowStatus::Unknown);
        assert!(!WorkflowStatus::Running.is_closed());
        assert!(WorkflowStatus::TimedOut.is_closed());
    }

    #[test]
    fn test_operation_record_json() {
        let record = OperationRecord {
            operation_id: 3,
            kind: StubKind::ChildWorkflow,
            target: "Shipping".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"operation_id":3,"kind":"child_workflow","target":"Shipping"}"#
        );
        let back: OperationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(record.to_string(), "child workflow 'Shipping'");

        let json = r#"{"operation_id":4,"kind":"signal_child","target":"kid-1:go"}"#;
        let signal: OperationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(signal.kind, StubKind::SignalChild);
    }
}
