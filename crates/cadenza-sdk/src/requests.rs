// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and reply building utilities.

use std::time::Duration;

use cadenza_protocol::{Message, MessageType, props};

use crate::args::Args;
use crate::error::{Result, SdkError};
use crate::stub::StubOptions;
use crate::types::Payload;

// ========== Handshake ==========

/// Build the initialize request opening the handshake.
pub(crate) fn build_initialize(library_version: &str, capabilities: &[&str]) -> Message {
    Message::new(MessageType::InitializeRequest)
        .with_string(props::PROTOCOL_VERSION, cadenza_protocol::PROTOCOL_VERSION)
        .with_string(props::LIBRARY_VERSION, library_version)
        .with_string(props::CAPABILITIES, capabilities.join(","))
}

pub(crate) fn build_connect(namespace: &str, identity: &str) -> Message {
    Message::new(MessageType::ConnectRequest)
        .with_string(props::NAMESPACE, namespace)
        .with_string(props::IDENTITY, identity)
}

pub(crate) fn build_workflow_register(workflow_type: &str, task_queue: &str) -> Message {
    Message::new(MessageType::WorkflowRegisterRequest)
        .with_string(props::WORKFLOW_TYPE, workflow_type)
        .with_string(props::TASK_QUEUE, task_queue)
}

pub(crate) fn build_activity_register(activity_type: &str, task_queue: &str) -> Message {
    Message::new(MessageType::ActivityRegisterRequest)
        .with_string(props::ACTIVITY_TYPE, activity_type)
        .with_string(props::TASK_QUEUE, task_queue)
}

pub(crate) fn build_new_worker(task_queue: &str, identity: &str) -> Message {
    Message::new(MessageType::NewWorkerRequest)
        .with_string(props::TASK_QUEUE, task_queue)
        .with_string(props::IDENTITY, identity)
}

pub(crate) fn build_stop_worker(worker_id: i64) -> Message {
    Message::new(MessageType::StopWorkerRequest).with_i64(props::WORKER_ID, worker_id)
}

/// Build a heartbeat (simple "I'm alive" signal) stamped with the send time.
pub(crate) fn build_heartbeat(identity: &str) -> Message {
    Message::new(MessageType::HeartbeatRequest)
        .with_string(props::IDENTITY, identity)
        .with_timestamp(props::SENT_AT, chrono::Utc::now())
}

pub(crate) fn build_ping() -> Message {
    Message::new(MessageType::PingRequest)
}

// ========== Client operations ==========

pub(crate) fn build_workflow_execute(
    workflow_type: &str,
    workflow_id: &str,
    task_queue: &str,
    payload: Payload,
) -> Message {
    Message::new(MessageType::WorkflowExecuteRequest)
        .with_string(props::WORKFLOW_TYPE, workflow_type)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::TASK_QUEUE, task_queue)
        .with_payload(payload)
}

pub(crate) fn build_workflow_signal(
    workflow_id: &str,
    signal_name: &str,
    synchronous: bool,
    payload: Payload,
) -> Message {
    Message::new(MessageType::WorkflowSignalRequest)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::SIGNAL_NAME, signal_name)
        .with_bool(props::SYNCHRONOUS, synchronous)
        .with_payload(payload)
}

/// The workflow arguments travel as the payload, the signal arguments as a
/// JSON property.
pub(crate) fn build_signal_with_start(
    workflow_type: &str,
    workflow_id: &str,
    task_queue: &str,
    signal_name: &str,
    signal_args: &Args,
    payload: Payload,
) -> Result<Message> {
    Ok(Message::new(MessageType::WorkflowSignalWithStartRequest)
        .with_string(props::WORKFLOW_TYPE, workflow_type)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::TASK_QUEUE, task_queue)
        .with_string(props::SIGNAL_NAME, signal_name)
        .with_string(props::SIGNAL_ARGS, serde_json::to_string(signal_args)?)
        .with_payload(payload))
}

pub(crate) fn build_workflow_get_result(workflow_id: &str) -> Message {
    Message::new(MessageType::WorkflowGetResultRequest).with_string(props::WORKFLOW_ID, workflow_id)
}

pub(crate) fn build_workflow_describe(workflow_id: &str) -> Message {
    Message::new(MessageType::WorkflowDescribeExecutionRequest)
        .with_string(props::WORKFLOW_ID, workflow_id)
}

pub(crate) fn build_workflow_query(workflow_id: &str, query_name: &str, payload: Payload) -> Message {
    Message::new(MessageType::WorkflowQueryRequest)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::QUERY_NAME, query_name)
        .with_payload(payload)
}

pub(crate) fn build_workflow_cancel(workflow_id: &str, reason: &str) -> Message {
    Message::new(MessageType::WorkflowCancelRequest)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::REASON, reason)
}

// ========== Workflow stubs ==========

fn with_timeouts(mut message: Message, options: &StubOptions) -> Message {
    if let Some(task_queue) = &options.task_queue {
        message.set_string(props::TASK_QUEUE, task_queue.as_str());
    }
    if let Some(timeout) = options.schedule_to_close {
        message.set_duration(props::SCHEDULE_TO_CLOSE_TIMEOUT, timeout);
    }
    if let Some(timeout) = options.start_to_close {
        message.set_duration(props::START_TO_CLOSE_TIMEOUT, timeout);
    }
    if let Some(timeout) = options.heartbeat_timeout {
        message.set_duration(props::HEARTBEAT_TIMEOUT, timeout);
    }
    message
}

fn stub_request(message_type: MessageType, context_id: i64, operation_id: u64) -> Message {
    Message::new(message_type)
        .with_i64(props::CONTEXT_ID, context_id)
        .with_i64(props::OPERATION_ID, operation_id as i64)
}

pub(crate) fn build_activity_execute(
    context_id: i64,
    operation_id: u64,
    activity_type: &str,
    options: &StubOptions,
    payload: Payload,
) -> Message {
    let message = stub_request(MessageType::ActivityExecuteRequest, context_id, operation_id)
        .with_string(props::ACTIVITY_TYPE, activity_type)
        .with_payload(payload);
    with_timeouts(message, options)
}

pub(crate) fn build_execute_child(
    context_id: i64,
    operation_id: u64,
    workflow_type: &str,
    options: &StubOptions,
    payload: Payload,
) -> Message {
    let mut message = stub_request(
        MessageType::WorkflowExecuteChildRequest,
        context_id,
        operation_id,
    )
    .with_string(props::WORKFLOW_TYPE, workflow_type)
    .with_payload(payload);
    if let Some(workflow_id) = &options.workflow_id {
        message.set_string(props::WORKFLOW_ID, workflow_id.as_str());
    }
    with_timeouts(message, options)
}

pub(crate) fn build_sleep(context_id: i64, operation_id: u64, duration: Duration) -> Message {
    stub_request(MessageType::WorkflowSleepRequest, context_id, operation_id)
        .with_duration(props::DURATION, duration)
}

pub(crate) fn build_signal_child(
    context_id: i64,
    operation_id: u64,
    child_workflow_id: &str,
    signal_name: &str,
    payload: Payload,
) -> Message {
    stub_request(MessageType::WorkflowSignalChildRequest, context_id, operation_id)
        .with_string(props::WORKFLOW_ID, child_workflow_id)
        .with_string(props::SIGNAL_NAME, signal_name)
        .with_payload(payload)
}

pub(crate) fn build_cancel_child(context_id: i64, operation_id: u64, child_workflow_id: &str) -> Message {
    stub_request(MessageType::WorkflowCancelChildRequest, context_id, operation_id)
        .with_string(props::WORKFLOW_ID, child_workflow_id)
}

fn with_result(mut message: Message, result: &Result<Payload>) -> Message {
    match result {
        Ok(payload) => message.set_payload(payload.clone()),
        Err(e) => {
            message.set_error(e.error_type(), e.detail());
            message.set_bool(props::WAS_CANCELLED, e.is_cancelled());
        }
    }
    message
}

/// Report the outcome of a run that suspended before finishing.
pub(crate) fn build_workflow_complete(
    context_id: i64,
    workflow_id: &str,
    run_id: &str,
    result: &Result<Payload>,
) -> Message {
    let message = Message::new(MessageType::WorkflowCompleteRequest)
        .with_i64(props::CONTEXT_ID, context_id)
        .with_string(props::WORKFLOW_ID, workflow_id)
        .with_string(props::RUN_ID, run_id);
    with_result(message, result)
}

// ========== Activities ==========

/// Heartbeat details are forwarded unchanged.
pub(crate) fn build_record_heartbeat(
    activity_context_id: i64,
    activity_type: &str,
    details: Payload,
) -> Message {
    Message::new(MessageType::ActivityRecordHeartbeatRequest)
        .with_i64(props::ACTIVITY_CONTEXT_ID, activity_context_id)
        .with_string(props::ACTIVITY_TYPE, activity_type)
        .with_payload(details)
}

pub(crate) fn build_get_heartbeat_details(activity_context_id: i64) -> Message {
    Message::new(MessageType::ActivityGetHeartbeatDetailsRequest)
        .with_i64(props::ACTIVITY_CONTEXT_ID, activity_context_id)
}

/// Finish an activity that returned a pending result.
pub(crate) fn build_activity_complete(task_token: &str, result: &Result<Payload>) -> Message {
    let message = Message::new(MessageType::ActivityCompleteRequest)
        .with_string(props::TASK_TOKEN, task_token);
    with_result(message, result)
}

// ========== Replies ==========

/// Reply to `request` carrying `error`.
pub(crate) fn error_reply(request: &Message, error: &SdkError) -> Option<Message> {
    let mut reply = Message::reply_to(request)?;
    reply.set_error(error.error_type(), error.detail());
    if error.is_cancelled() {
        reply.set_bool(props::WAS_CANCELLED, true);
    }
    Some(reply)
}

/// Successful reply to `request` carrying `payload`.
pub(crate) fn payload_reply(request: &Message, payload: Payload) -> Option<Message> {
    Message::reply_to(request).map(|reply| reply.with_payload(payload))
}

/// Reply to `request` with the payload or the error of `result`.
pub(crate) fn result_reply(request: &Message, result: &Result<Payload>) -> Option<Message> {
    match result {
        Ok(payload) => payload_reply(request, payload.clone()),
        Err(e) => error_reply(request, e),
    }
}

/// Turn an error-carrying reply into an `SdkError`.
pub(crate) fn check_reply(reply: Message) -> Result<Message> {
    match reply.reply_error()? {
        Some(error) => Err(SdkError::from_reply(error)),
        None => Ok(reply),
    }
}

/// Payload of a reply, empty when there is none.
pub(crate) fn reply_payload(reply: &Message) -> Payload {
    reply.payload().map(|b| b.to_vec()).unwrap_or_default()
}
