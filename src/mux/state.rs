//! Per-key connection state (spec §3's `ConnectionState`).
//!
//! Grounded on `federation/upstream.rs::UpstreamConnection` — a broadcast
//! sender plus an atomic refcount and a `CancellationToken` — generalized
//! with the two timers (`first_data_sent`, `last_activity`) spec.md's
//! idle/no-data destruction rules need and the teacher's WS fan-out
//! doesn't.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::ConnectionKey;

pub struct ConnectionState {
    pub key: ConnectionKey,
    pub tx: broadcast::Sender<Bytes>,
    /// Subscribers currently attached, tracked independently of
    /// `tx.receiver_count()` so capacity checks and increment/decrement
    /// stay atomic around the MAX_SUBSCRIBERS_PER_KEY guard.
    pub refcount: Arc<AtomicUsize>,
    pub cancel: CancellationToken,
    pub aborted: Arc<AtomicBool>,
    pub first_data_sent: Arc<AtomicBool>,
    pub last_activity: Arc<Mutex<Instant>>,
    /// `refcount` is born at 1, reserving the slot for the subscriber whose
    /// request triggered this connection's open, so the reader task (which
    /// starts concurrently) never observes a subscriber-less connection
    /// before that subscriber has actually attached. Whichever `add_subscriber`
    /// call reaches the connection first claims that reservation instead of
    /// incrementing past it; this flag (CAS'd exactly once) tracks whether
    /// the claim has happened yet.
    pub initial_reservation_claimed: Arc<AtomicBool>,
}

impl ConnectionState {
    pub fn is_healthy(&self) -> bool {
        !self.aborted.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }
}
