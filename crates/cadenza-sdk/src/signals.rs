// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signal queues and the synchronous signal reply protocol.
//!
//! Asynchronous signals land on a `SignalQueue<Args>` and are acknowledged as
//! soon as they are queued. Synchronous signals are either answered
//! immediately by [`crate::Workflow::on_signal`] or deferred: a
//! [`SignalRequest`] is queued and the caller waits until workflow code
//! calls [`SignalRequest::reply`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::args::Args;
use crate::context::ExecutionControl;
use crate::error::{Result, SdkError};
use crate::types::Payload;

/// How a synchronous signal is answered.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDisposition {
    /// Reply right away with this value.
    Immediate(Payload),
    /// Queue a [`SignalRequest`]; workflow code replies later.
    Deferred,
}

impl SignalDisposition {
    /// Immediate reply with a JSON-serialized value.
    pub fn immediate<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(SignalDisposition::Immediate(serde_json::to_vec(value)?))
    }
}

/// A synchronous signal waiting for its reply.
///
/// Exactly one reply can be issued. Dropping the request unanswered tells the
/// caller the signal was never answered.
pub struct SignalRequest {
    name: String,
    args: Args,
    reply: Mutex<Option<oneshot::Sender<Payload>>>,
}

impl SignalRequest {
    pub(crate) fn new(name: impl Into<String>, args: Args) -> (Self, oneshot::Receiver<Payload>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            name: name.into(),
            args,
            reply: Mutex::new(Some(tx)),
        };
        (request, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Reply with a JSON-serialized value.
    pub fn reply<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.reply_payload(serde_json::to_vec(value)?)
    }

    /// Reply with raw bytes. A second reply fails with `AlreadyReplied`.
    pub fn reply_payload(&self, payload: Payload) -> Result<()> {
        let sender = self.reply.lock().take().ok_or(SdkError::AlreadyReplied)?;
        if sender.send(payload).is_err() {
            debug!(signal = %self.name, "signal caller stopped waiting before the reply");
        }
        Ok(())
    }

    pub fn is_replied(&self) -> bool {
        self.reply.lock().is_none()
    }
}

impl std::fmt::Debug for SignalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRequest")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("replied", &self.is_replied())
            .finish()
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct QueueInner<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    available: Notify,
    control: Option<Arc<ExecutionControl>>,
}

/// FIFO queue of signals for one workflow execution.
///
/// Clones share the same queue.
pub struct SignalQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for SignalQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> SignalQueue<T> {
    /// A queue not bound to any execution.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    pub(crate) fn bound(name: impl Into<String>, control: Arc<ExecutionControl>) -> Self {
        Self::build(name.into(), Some(control))
    }

    fn build(name: String, control: Option<Arc<ExecutionControl>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Notify::new(),
                control,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append an item. Fails with `QueueClosed` once the queue is closed.
    pub fn enqueue(&self, item: T) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(SdkError::QueueClosed);
            }
            state.items.push_back(item);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting while the queue is empty.
    ///
    /// Waiting is a suspension point of the owning execution: it resolves
    /// with `Cancelled` if the execution is cancelled, and with
    /// `QueueClosed` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Result<T> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if state.closed {
                    return Err(SdkError::QueueClosed);
                }
            }

            match &self.inner.control {
                Some(control) => {
                    let cancel = control.cancel_token();
                    if cancel.is_cancelled() {
                        return Err(SdkError::Cancelled);
                    }
                    let _suspended = control.suspend();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Close the queue. Queued items are dropped and waiters are woken.
    ///
    /// Dropping queued [`SignalRequest`]s fails their callers with
    /// `SignalNeverAnswered`.
    pub fn close(&self) {
        let dropped: Vec<T> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(queue = %self.inner.name, dropped = dropped.len(), "closed queue with pending signals");
        }
        drop(dropped);
        self.inner.available.notify_waiters();
    }
}
