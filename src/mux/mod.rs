//! The Stream Multiplexer: at most one upstream connection per key,
//! fanned out to every subscribed HTTP response (spec §2/§3).

pub mod core;
pub mod state;

pub use core::Multiplexer;
pub use state::ConnectionState;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

/// Opaque per-key identity, produced by an instance's `make_key` closure.
/// Case- and order-sensitive, per spec.md §3 — callers normalize deps
/// (upper-case/dedupe symbols, etc.) before this is derived.
pub type ConnectionKey = String;

/// What an instance's `build_request` closure yields: the fully-built
/// upstream URL for `UpstreamRequester::open_stream`.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
}

/// Returned by `add_subscriber`/`add_exclusive_subscriber`: the broadcast
/// receiver driving the response body, whether this subscriber joined an
/// already-flowing stream (spec.md's `{"LateJoin": true}` prelude line),
/// and a diagnostic connection id.
pub struct SubscriberHandle {
    pub receiver: broadcast::Receiver<Bytes>,
    pub is_late_join: bool,
    pub connection_id: String,
    pub guard: SubscriberGuard,
}

/// RAII subscriber-count guard. Dropping it (the HTTP response body
/// stream ending, for any reason: normal completion, client abort,
/// transport error) decrements the key's refcount and, if it was the
/// last subscriber, notifies the multiplexer's close-watcher — the
/// `onClose` contract from spec.md §3's `SubscriberSink`, implemented as
/// a Rust `Drop` rather than a callback registration.
pub struct SubscriberGuard {
    pub(crate) key: ConnectionKey,
    pub(crate) refcount: Arc<AtomicUsize>,
    pub(crate) closed_tx: mpsc::UnboundedSender<ConnectionKey>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.closed_tx.send(self.key.clone());
        }
    }
}
