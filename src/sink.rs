//! HTTP boundary adapter (spec §4.5): turns a [`crate::mux::SubscriberHandle`]
//! into an Axum streaming response body.
//!
//! Grounded on `realtime/sse.rs`'s `stream::unfold` over a
//! `broadcast::Receiver`, generalized from SSE events to raw bytes and
//! extended with the `{"LateJoin": true}\n` prelude line spec.md §4.3 step
//! 8 requires. Request-level disconnect detection (spec §9's "must be
//! request-level, not response-level" note) is satisfied by the
//! [`SubscriberGuard`] held inside the stream's closure state: when Axum
//! drops the response body future — which happens on both a clean end and
//! a client abort, the two cases `realtime/sse.rs` cannot distinguish
//! between either — the guard's `Drop` fires unconditionally.

use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream;
use tokio::sync::broadcast;

use crate::mux::SubscriberHandle;

const LATE_JOIN_PRELUDE: &[u8] = b"{\"LateJoin\":true}\n";

/// Builds the streaming HTTP response for a subscribed client: headers
/// per spec.md §6's downstream contract, body driven by the mux's
/// broadcast channel, late-join prelude first if applicable.
pub fn streaming_response(handle: SubscriberHandle) -> Response {
    let SubscriberHandle {
        receiver,
        is_late_join,
        guard,
        ..
    } = handle;

    let body = Body::from_stream(stream::unfold(
        (receiver, Some(guard), is_late_join),
        move |(mut rx, guard, pending_late_join)| async move {
            if pending_late_join {
                return Some((
                    Ok::<Bytes, std::io::Error>(Bytes::from_static(LATE_JOIN_PRELUDE)),
                    (rx, guard, false),
                ));
            }

            loop {
                match rx.recv().await {
                    Ok(chunk) => return Some((Ok(chunk), (rx, guard, false))),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // A slow subscriber skipped some chunks; spec.md's
                        // back-pressure policy is to drop, not buffer or
                        // reconnect, on its behalf. Keep reading.
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // guard dropped here, decrementing the key's refcount.
                        return None;
                    }
                }
            }
        },
    ));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response.into_response()
}
