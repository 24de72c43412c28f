// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation registry: outstanding request ids to their completion handles.
//!
//! Every entry is inserted once and removed exactly once, by a reply, by the
//! caller giving up, or by [`CorrelationRegistry::fail_all`] when the
//! connection goes away. After `fail_all` the registry refuses new entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::ConnectionError;
use crate::message::Message;

/// Completion value delivered to a pending operation.
pub type Completion = Result<Message, ConnectionError>;

#[derive(Default)]
struct Entries {
    pending: HashMap<u64, oneshot::Sender<Completion>>,
    closed: bool,
}

/// Map of in-flight request ids, one per connection.
pub struct CorrelationRegistry {
    next_id: AtomicU64,
    entries: Mutex<Entries>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Allocate the next id and record a pending completion for it.
    ///
    /// Fails with `ConnectionLost` once the registry has been closed.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<Completion>), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(ConnectionError::ConnectionLost);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Complete the pending operation for `id` with `reply`.
    ///
    /// Returns `false` if no operation is pending under that id.
    pub fn resolve(&self, id: u64, reply: Message) -> bool {
        let sender = self.entries.lock().pending.remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(Ok(reply)).is_err() {
                    debug!(request_id = id, "reply arrived after caller stopped waiting");
                }
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without completing it.
    pub fn forget(&self, id: u64) -> bool {
        self.entries.lock().pending.remove(&id).is_some()
    }

    /// Close the registry and complete every pending operation with
    /// `ConnectionLost`. Returns how many were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.closed = true;
            entries.pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(ConnectionError::ConnectionLost));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::MessageType;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let registry = CorrelationRegistry::new();
        let (a, _ra) = registry.register().unwrap();
        let (b, _rb) = registry.register().unwrap();
        let (c, _rc) = registry.register().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(registry.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let registry = CorrelationRegistry::new();
        let (id, rx) = registry.register().unwrap();

        assert!(registry.resolve(id, Message::new(MessageType::PingReply)));
        // second resolution for the same id is unmatched
        assert!(!registry.resolve(id, Message::new(MessageType::PingReply)));

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::PingReply);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve(77, Message::new(MessageType::PingReply)));
    }

    #[test]
    fn test_forget() {
        let registry = CorrelationRegistry::new();
        let (id, _rx) = registry.register().unwrap();
        assert!(registry.forget(id));
        assert!(!registry.forget(id));
        assert!(!registry.resolve(id, Message::new(MessageType::PingReply)));
    }

    #[tokio::test]
    async fn test_fail_all_fans_out() {
        let registry = CorrelationRegistry::new();
        let receivers: Vec<_> = (0..5).map(|_| registry.register().unwrap().1).collect();

        assert_eq!(registry.fail_all(), 5);
        assert!(registry.is_closed());

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(ConnectionError::ConnectionLost)));
        }
        assert!(matches!(
            registry.register(),
            Err(ConnectionError::ConnectionLost)
        ));
    }

    #[test]
    fn test_concurrent_register_unique() {
        let registry = Arc::new(CorrelationRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| registry.register().unwrap().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
