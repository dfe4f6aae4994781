use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::{lock_ignore_poison, CorrelationId, Envelope, Result, RpcError};

struct PendingCall {
    // ---
    created_at: Instant,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Default)]
struct Table {
    // ---
    calls: HashMap<CorrelationId, PendingCall>,
    closed: bool,
}

/// Outstanding calls of one client, keyed by correlation id.
///
/// Shared between the callers, which register and cancel entries, and the
/// reply dispatcher, which completes them. An entry lives until exactly one
/// of complete, remove or close takes it out. Once closed, nothing can be
/// registered again.
pub(super) struct PendingCalls {
    // ---
    table: Mutex<Table>,
}

impl PendingCalls {
    // ---
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
        }
    }

    /// Register a call; the receiver yields its reply envelope.
    ///
    /// Fails with [`RpcError::Transport`] once the table is closed, since
    /// no reply could ever be routed.
    pub fn register(&self, correlation_id: CorrelationId) -> Result<oneshot::Receiver<Envelope>> {
        // ---
        let mut table = lock_ignore_poison(&self.table);
        if table.closed {
            return Err(RpcError::Transport("reply consumer has stopped".into()));
        }

        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            created_at: Instant::now(),
            tx,
        };
        table.calls.insert(correlation_id, call);
        Ok(rx)
    }

    /// Hand `reply` to the waiter registered under `correlation_id`.
    ///
    /// Returns how long the call was outstanding, or `None` if nobody is
    /// waiting (timed out, cancelled, or never ours).
    pub fn complete(&self, correlation_id: &CorrelationId, reply: Envelope) -> Option<Duration> {
        // ---
        let call = lock_ignore_poison(&self.table).calls.remove(correlation_id)?;
        // The waiter may have been dropped between removal and send.
        call.tx.send(reply).ok()?;
        Some(call.created_at.elapsed())
    }

    /// Forget a call without delivering anything.
    pub fn remove(&self, correlation_id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.table).calls.remove(correlation_id).is_some()
    }

    /// Refuse new calls and drop every waiter; their receivers observe a
    /// closed channel. Returns how many calls were dropped.
    pub fn close(&self) -> usize {
        // ---
        let mut table = lock_ignore_poison(&self.table);
        table.closed = true;
        let count = table.calls.len();
        table.calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.table).calls.len()
    }
}

/// Removes its call from the table when dropped.
///
/// Held by the calling future, so a timeout, a failed publish or the caller
/// dropping the future all release the entry. After a normal completion the
/// entry is already gone and the removal is a no-op.
pub(super) struct PendingGuard<'a> {
    // ---
    pending: &'a PendingCalls,
    correlation_id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingCalls, correlation_id: CorrelationId) -> Self {
        Self {
            pending,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Address;
    use bytes::Bytes;
    use std::sync::Arc;

    fn reply(correlation_id: &CorrelationId, body: &'static str) -> Envelope {
        Envelope::response(
            Arc::from("nameko-rpc"),
            Address::from("rpc.reply-test"),
            Bytes::from_static(body.as_bytes()),
            Some(correlation_id.into()),
            None,
        )
    }

    #[test]
    fn test_register_and_complete() {
        // ---
        let pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let rx = pending.register(correlation_id.clone()).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending
            .complete(&correlation_id, reply(&correlation_id, r#"{"result":1}"#))
            .is_some());
        assert_eq!(pending.len(), 0);

        let received = rx.blocking_recv().unwrap();
        assert_eq!(&received.payload[..], br#"{"result":1}"#);
    }

    #[test]
    fn test_complete_unknown_or_abandoned() {
        // ---
        let pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();
        assert!(pending
            .complete(&correlation_id, reply(&correlation_id, "{}"))
            .is_none());

        let rx = pending.register(correlation_id.clone()).unwrap();
        drop(rx);
        assert!(pending
            .complete(&correlation_id, reply(&correlation_id, "{}"))
            .is_none());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_guard_removes_entry() {
        // ---
        let pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let _rx = pending.register(correlation_id.clone()).unwrap();
        {
            let _guard = PendingGuard::new(&pending, correlation_id.clone());
            assert_eq!(pending.len(), 1);
        }
        assert_eq!(pending.len(), 0);
        assert!(!pending.remove(&correlation_id));
    }

    #[test]
    fn test_close_drops_waiters_and_refuses_new_calls() {
        // ---
        let pending = PendingCalls::new();
        let rx_a = pending.register(CorrelationId::generate()).unwrap();
        let rx_b = pending.register(CorrelationId::generate()).unwrap();

        assert_eq!(pending.close(), 2);
        assert!(rx_a.blocking_recv().is_err());
        assert!(rx_b.blocking_recv().is_err());

        assert!(matches!(
            pending.register(CorrelationId::generate()),
            Err(RpcError::Transport(_))
        ));
        assert_eq!(pending.len(), 0);
        assert_eq!(pending.close(), 0);
    }
}
