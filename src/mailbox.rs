//! Single-slot overwrite-on-contention mailbox
//!
//! The delivery pipeline processes requests in coalesced last-write-wins
//! order: at most one request is ever pending, and a newer request replaces
//! a queued one that has not been consumed yet. This replaces the
//! select-send-else-drain-send channel idiom with an explicit abstraction:
//! a mutex-guarded slot plus a wake primitive.
//!
//! Both the inbound (requests to the deployer) and outbound (responses to
//! the downstream consumer) sides of the agent use this mailbox with
//! capacity 1 and identical overwrite discipline.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

/// A bounded mailbox of capacity 1 with a non-blocking overwrite policy
///
/// Cloning yields another handle to the same slot; senders and the single
/// receiver share the mailbox.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Create a new, empty, open mailbox
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    value: None,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue a value, replacing any value not yet consumed
    ///
    /// Returns `false` if the mailbox has been closed; the value is dropped.
    pub fn send(&self, value: T) -> bool {
        {
            let mut slot = self.lock();
            if slot.closed {
                return false;
            }
            slot.value = Some(value);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Take the pending value without blocking, if one is queued
    pub fn try_recv(&self) -> Option<T> {
        self.lock().value.take()
    }

    /// Wait for the next value
    ///
    /// Returns `None` once the mailbox is closed and the slot is drained.
    /// Cancel-safe: a value observed concurrently with cancellation stays
    /// in the slot and is returned by the next call.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut slot = self.lock();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the mailbox
    ///
    /// Pending value (if any) remains receivable; subsequent sends fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_waiters();
        // Wake a receiver that registered after notify_waiters snapshotted
        self.inner.notify.notify_one();
    }

    /// Whether the mailbox has been closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        // A poisoned slot mutex means a panic mid-send/recv; the value is a
        // plain Option so the state is still consistent.
        match self.inner.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
