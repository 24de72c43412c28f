// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message type tags for the proxy wire protocol.
//!
//! Every request type has exactly one reply type. Tags are stable wire
//! values shared with the engine process and must never be renumbered.

use crate::message::CodecError;

macro_rules! message_types {
    ($( $(#[$doc:meta])* $request:ident = $req_tag:literal => $reply:ident = $reply_tag:literal ),* $(,)?) => {
        /// Message types for the wire protocol
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum MessageType {
            $(
                $(#[$doc])*
                $request = $req_tag,
                #[doc = concat!("Reply to [`MessageType::", stringify!($request), "`].")]
                $reply = $reply_tag,
            )*
        }

        impl MessageType {
            /// Every known message type, requests and replies interleaved.
            pub const ALL: &'static [MessageType] = &[
                $( MessageType::$request, MessageType::$reply, )*
            ];

            /// The reply type for a request type, `None` for reply types.
            pub fn reply_type(self) -> Option<MessageType> {
                match self {
                    $( MessageType::$request => Some(MessageType::$reply), )*
                    _ => None,
                }
            }

            /// Whether this tag identifies a reply.
            pub fn is_reply(self) -> bool {
                match self {
                    $( MessageType::$reply => true, )*
                    _ => false,
                }
            }
        }

        impl TryFrom<i32> for MessageType {
            type Error = CodecError;

            fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
                match value {
                    $(
                        $req_tag => Ok(MessageType::$request),
                        $reply_tag => Ok(MessageType::$reply),
                    )*
                    _ => Err(CodecError::InvalidMessageType(value)),
                }
            }
        }
    };
}

message_types! {
    /// client → engine: protocol version and capability negotiation
    InitializeRequest = 1 => InitializeReply = 2,
    /// client → engine: bind the connection to a namespace
    ConnectRequest = 3 => ConnectReply = 4,
    /// either side: graceful shutdown of the connection
    TerminateRequest = 5 => TerminateReply = 6,
    /// either side: liveness check
    HeartbeatRequest = 13 => HeartbeatReply = 14,
    /// engine → worker: cooperative cancellation of a workflow execution
    CancelRequest = 15 => CancelReply = 16,
    /// client → engine: start polling a task queue
    NewWorkerRequest = 17 => NewWorkerReply = 18,
    /// client → engine: stop a worker started with `NewWorkerRequest`
    StopWorkerRequest = 19 => StopWorkerReply = 20,
    /// either side: raw round-trip measurement
    PingRequest = 21 => PingReply = 22,

    /// client → engine: announce a workflow type
    WorkflowRegisterRequest = 100 => WorkflowRegisterReply = 101,
    /// client → engine: start a workflow execution
    WorkflowExecuteRequest = 102 => WorkflowExecuteReply = 103,
    /// client → engine: signal a running workflow (async or synchronous)
    WorkflowSignalRequest = 104 => WorkflowSignalReply = 105,
    /// client → engine: signal a workflow, starting it first when it is not running
    WorkflowSignalWithStartRequest = 106 => WorkflowSignalWithStartReply = 107,
    /// client → engine: request cancellation of a workflow execution
    WorkflowCancelRequest = 108 => WorkflowCancelReply = 109,
    /// client → engine: status and timing of a workflow execution
    WorkflowDescribeExecutionRequest = 120 => WorkflowDescribeExecutionReply = 121,
    /// client → engine: query a running workflow
    WorkflowQueryRequest = 126 => WorkflowQueryReply = 127,
    /// engine → worker: run (or replay) a workflow
    WorkflowInvokeRequest = 132 => WorkflowInvokeReply = 133,
    /// worker → engine: start a child workflow and wait for its result
    WorkflowExecuteChildRequest = 134 => WorkflowExecuteChildReply = 135,
    /// engine → worker: deliver a signal to a running workflow
    WorkflowSignalInvokeRequest = 138 => WorkflowSignalInvokeReply = 139,
    /// client → engine: wait for the result of a workflow execution
    WorkflowGetResultRequest = 140 => WorkflowGetResultReply = 141,
    /// engine → worker: deliver a query to a running workflow
    WorkflowQueryInvokeRequest = 146 => WorkflowQueryInvokeReply = 147,
    /// worker → engine: durable timer
    WorkflowSleepRequest = 150 => WorkflowSleepReply = 151,
    /// worker → engine: a workflow that suspended has reached a terminal state
    WorkflowCompleteRequest = 152 => WorkflowCompleteReply = 153,
    /// worker → engine: signal a child workflow of the calling execution
    WorkflowSignalChildRequest = 154 => WorkflowSignalChildReply = 155,
    /// worker → engine: request cancellation of a child workflow
    WorkflowCancelChildRequest = 156 => WorkflowCancelChildReply = 157,

    /// client → engine: announce an activity type
    ActivityRegisterRequest = 200 => ActivityRegisterReply = 201,
    /// worker → engine: schedule an activity and wait for its result
    ActivityExecuteRequest = 202 => ActivityExecuteReply = 203,
    /// engine → worker: run an activity
    ActivityInvokeRequest = 204 => ActivityInvokeReply = 205,
    /// worker → engine: activity heartbeat, forwarded unchanged
    ActivityRecordHeartbeatRequest = 206 => ActivityRecordHeartbeatReply = 207,
    /// worker → engine: details of the last recorded heartbeat
    ActivityGetHeartbeatDetailsRequest = 208 => ActivityGetHeartbeatDetailsReply = 209,
    /// engine → worker: cooperative cancellation of a running activity
    ActivityStopRequest = 210 => ActivityStopReply = 211,
    /// client → engine: complete an activity that returned a pending result
    ActivityCompleteRequest = 222 => ActivityCompleteReply = 223,

    /// loopback conformance testing only
    EchoRequest = 300 => EchoReply = 301,
}

impl MessageType {
    /// Wire tag for this type.
    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Whether this tag identifies a request.
    pub fn is_request(self) -> bool {
        !self.is_reply()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
