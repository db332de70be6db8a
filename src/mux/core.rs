//! The multiplexer engine (spec §4.3): `ensure_upstream`, `add_subscriber`,
//! `add_exclusive_subscriber`, `close_key`, and the periodic sweep.
//!
//! Grounded on `federation/upstream.rs::UpstreamManager`'s lazy per-key
//! connection with refcounted subscribers and double-check-after-await,
//! generalized per spec.md to add pending-open/pending-cleanup dedup,
//! zombie sweep, exclusive-key eviction with a minimum switch delay, and
//! the late-join signal the teacher's symmetric WS fan-out has no
//! equivalent of. State mutation is serialized behind one
//! `tokio::sync::Mutex<MuxInner>` per instance — the per-mux-mutex
//! alternative spec.md's concurrency section explicitly allows in place of
//! a one-actor-per-instance model.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use once_cell::sync::OnceCell as SyncOnceCell;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Notify, OnceCell};
use uuid::Uuid;

use crate::config::MuxTimings;
use crate::error::MuxError;
use crate::upstream::Requester;

use super::{ConnectionKey, ConnectionState, SubscriberHandle, SubscriberGuard, UpstreamRequest};

const BROADCAST_BUFFER: usize = 256;

pub type MakeKeyFn<D> = Box<dyn Fn(&str, &D) -> Result<ConnectionKey, MuxError> + Send + Sync>;
pub type BuildRequestFn<D> = Box<dyn Fn(&str, &D) -> Result<UpstreamRequest, MuxError> + Send + Sync>;

#[derive(Default)]
struct MuxInner<D> {
    connections: HashMap<ConnectionKey, Arc<ConnectionState>>,
    pending_opens: HashMap<ConnectionKey, Arc<OnceCell<Arc<ConnectionState>>>>,
    pending_open_started_at: HashMap<ConnectionKey, Instant>,
    pending_opens_count: usize,
    pending_cleanups: HashMap<ConnectionKey, Arc<Notify>>,
    user_to_last_key: HashMap<String, ConnectionKey>,
    user_last_switch: HashMap<String, Instant>,
    _marker: std::marker::PhantomData<D>,
}

impl<D> MuxInner<D> {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            pending_opens: HashMap::new(),
            pending_open_started_at: HashMap::new(),
            pending_opens_count: 0,
            pending_cleanups: HashMap::new(),
            user_to_last_key: HashMap::new(),
            user_last_switch: HashMap::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

/// Constructed once per stream type with `{name, makeKey, buildRequest}`,
/// per spec.md §4.3. `D` is the per-instance dependency shape (e.g. a
/// symbol list for quotes, an account id + paper-trading flag for
/// positions) — see `crate::registry::StreamDeps`.
pub struct Multiplexer<D: Send + Sync + 'static> {
    pub name: &'static str,
    exclusive: bool,
    timings: MuxTimings,
    requester: Arc<dyn Requester>,
    make_key: MakeKeyFn<D>,
    build_request: BuildRequestFn<D>,
    inner: AsyncMutex<MuxInner<D>>,
    closed_tx: mpsc::UnboundedSender<ConnectionKey>,
    self_ref: SyncOnceCell<std::sync::Weak<Multiplexer<D>>>,
}

impl<D: Send + Sync + 'static> Multiplexer<D> {
    pub fn new(
        name: &'static str,
        exclusive: bool,
        timings: MuxTimings,
        requester: Arc<dyn Requester>,
        make_key: MakeKeyFn<D>,
        build_request: BuildRequestFn<D>,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let mux = Arc::new(Self {
            name,
            exclusive,
            timings,
            requester,
            make_key,
            build_request,
            inner: AsyncMutex::new(MuxInner::new()),
            closed_tx,
            self_ref: SyncOnceCell::new(),
        });
        let _ = mux.self_ref.set(Arc::downgrade(&mux));

        spawn_close_watcher(mux.clone(), closed_rx);
        spawn_sweep(mux.clone());

        mux
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(|weak| weak.upgrade())
            .expect("Multiplexer always holds a live self-reference while reachable")
    }

    async fn healthy_state(&self, key: &ConnectionKey) -> Option<Arc<ConnectionState>> {
        let inner = self.inner.lock().await;
        inner
            .connections
            .get(key)
            .filter(|s| s.is_healthy())
            .cloned()
    }

    async fn await_pending_cleanup(&self, key: &ConnectionKey) {
        let existing = {
            let inner = self.inner.lock().await;
            inner.pending_cleanups.get(key).cloned()
        };
        if let Some(notify) = existing {
            let _ = tokio::time::timeout(self.timings.pending_cleanup_cap, notify.notified()).await;
        }
    }

    /// `ensureUpstream(userId, deps)`: spec.md §4.3.
    pub async fn ensure_upstream(
        &self,
        user_id: &str,
        deps: &D,
    ) -> Result<Arc<ConnectionState>, MuxError> {
        let key = (self.make_key)(user_id, deps)?;

        self.await_pending_cleanup(&key).await;

        if let Some(state) = self.healthy_state(&key).await {
            return Ok(state);
        }

        let (cell, is_new) = {
            let mut inner = self.inner.lock().await;
            if let Some(cell) = inner.pending_opens.get(&key) {
                (cell.clone(), false)
            } else {
                if inner.pending_opens_count >= self.timings.max_pending_opens {
                    return Err(MuxError::RateLimited(
                        "too many concurrent upstream opens".into(),
                    ));
                }
                inner.pending_opens_count += 1;
                inner
                    .pending_open_started_at
                    .insert(key.clone(), Instant::now());
                let cell = Arc::new(OnceCell::new());
                inner.pending_opens.insert(key.clone(), cell.clone());
                (cell, true)
            }
        };

        let result = cell
            .get_or_try_init(|| self.open_upstream(user_id, deps, &key))
            .await
            .map(|state| state.clone());

        if is_new {
            let mut inner = self.inner.lock().await;
            inner.pending_opens_count = inner.pending_opens_count.saturating_sub(1);
            inner.pending_open_started_at.remove(&key);
            inner.pending_opens.remove(&key);
        }

        result
    }

    async fn open_upstream(
        &self,
        user_id: &str,
        deps: &D,
        key: &ConnectionKey,
    ) -> Result<Arc<ConnectionState>, MuxError> {
        let request = (self.build_request)(user_id, deps)?;
        let open = tokio::time::timeout(
            self.timings.open_safety_timeout,
            self.requester.open_stream(user_id, &request.url),
        )
        .await
        .map_err(|_| MuxError::GatewayTimeout)??;

        let (tx, _rx) = broadcast::channel(BROADCAST_BUFFER);
        let state = Arc::new(ConnectionState {
            key: key.clone(),
            tx,
            // Born at 1: reserves the attaching subscriber's slot before the
            // reader task starts, so it can never see refcount == 0 for a
            // connection nobody has had the chance to subscribe to yet.
            refcount: Arc::new(AtomicUsize::new(1)),
            cancel: open.cancel,
            aborted: Arc::new(AtomicBool::new(false)),
            first_data_sent: Arc::new(AtomicBool::new(false)),
            last_activity: Arc::new(SyncMutex::new(Instant::now())),
            initial_reservation_claimed: Arc::new(AtomicBool::new(false)),
        });

        {
            let mut inner = self.inner.lock().await;
            inner.connections.insert(key.clone(), state.clone());
        }

        if self.exclusive {
            let inner = self.inner.lock().await;
            let stale = inner
                .user_to_last_key
                .get(user_id)
                .map(|current| current != key)
                .unwrap_or(false);
            drop(inner);
            if stale {
                self.destroy_connection(key, "stale exclusive open", false)
                    .await;
                return Err(MuxError::StaleOpen);
            }
        }

        crate::metrics::record_connection_opened(self.name);

        let mux = self.self_arc();
        tokio::spawn(spawn_initial_data_timer(
            mux.clone(),
            key.clone(),
            state.clone(),
            self.timings.initial_data_timeout,
        ));
        tokio::spawn(run_reader_task(mux, key.clone(), open.body, state.clone()));

        Ok(state)
    }

    /// `addSubscriber(userId, deps, sink)`, simplified to Rust's shape: the
    /// caller (the HTTP boundary adapter) owns the sink and the request;
    /// this returns the broadcast receiver and late-join flag it needs to
    /// drive the response body.
    pub async fn add_subscriber(
        &self,
        user_id: &str,
        deps: &D,
    ) -> Result<SubscriberHandle, MuxError> {
        let key = (self.make_key)(user_id, deps)?;

        let is_late_join = self
            .healthy_state(&key)
            .await
            .map(|s| s.first_data_sent.load(Ordering::Acquire))
            .unwrap_or(false);

        let state = self.ensure_upstream(user_id, deps).await?;

        // Whichever caller reaches the connection first claims the
        // reservation `open_upstream` pre-allocated (refcount already
        // includes it, so no increment is needed); every later caller
        // increments normally.
        let already_claimed = state
            .initial_reservation_claimed
            .swap(true, Ordering::AcqRel);
        let previous = if already_claimed {
            state.refcount.fetch_add(1, Ordering::AcqRel)
        } else {
            state.refcount.load(Ordering::Acquire) - 1
        };
        if previous >= self.timings.max_subscribers_per_key {
            state.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(MuxError::RateLimited(format!(
                "{} already has {} subscribers",
                self.name, previous
            )));
        }

        let receiver = state.tx.subscribe();
        let connection_id = Uuid::new_v4().to_string();
        crate::metrics::record_subscriber_attached(self.name);

        Ok(SubscriberHandle {
            receiver,
            is_late_join,
            connection_id,
            guard: SubscriberGuard {
                key,
                refcount: state.refcount.clone(),
                closed_tx: self.closed_tx.clone(),
            },
        })
    }

    /// `addExclusiveSubscriber(userId, deps, sink)`: evicts the user's
    /// previous key before attaching, throttled by `MIN_SWITCH_DELAY`.
    pub async fn add_exclusive_subscriber(
        &self,
        user_id: &str,
        deps: &D,
    ) -> Result<SubscriberHandle, MuxError> {
        let next_key = (self.make_key)(user_id, deps)?;

        let prev_key = {
            let inner = self.inner.lock().await;
            inner.user_to_last_key.get(user_id).cloned()
        };

        if let Some(prev_key) = prev_key {
            if prev_key != next_key {
                let wait = {
                    let inner = self.inner.lock().await;
                    inner.user_last_switch.get(user_id).map(|last| {
                        self.timings
                            .min_switch_delay
                            .saturating_sub(last.elapsed())
                    })
                };
                if let Some(wait) = wait {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }

                self.close_key(&prev_key).await;

                let mut inner = self.inner.lock().await;
                inner
                    .user_last_switch
                    .insert(user_id.to_string(), Instant::now());
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner
                .user_to_last_key
                .insert(user_id.to_string(), next_key.clone());
        }

        self.add_subscriber(user_id, deps).await
    }

    /// `closeKey(key)`: safe external teardown, deduped against a
    /// concurrent in-flight cleanup for the same key.
    pub async fn close_key(&self, key: &ConnectionKey) {
        let existing = {
            let inner = self.inner.lock().await;
            inner.pending_cleanups.get(key).cloned()
        };

        if let Some(notify) = existing {
            let _ =
                tokio::time::timeout(self.timings.pending_cleanup_cap, notify.notified()).await;
            return;
        }

        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().await;
            inner.pending_cleanups.insert(key.clone(), notify.clone());
        }

        self.destroy_connection(key, "force closed", false).await;
        tokio::time::sleep(self.timings.closekey_settle_delay).await;

        {
            let mut inner = self.inner.lock().await;
            inner.pending_cleanups.remove(key);
        }
        notify.notify_waiters();
    }

    /// Called by the close-watcher task after a subscriber guard reports
    /// its refcount reached zero. Re-checks the count before tearing down,
    /// since a new subscriber may have attached in the interim.
    async fn close_if_drained(&self, key: &ConnectionKey) {
        let state = {
            let inner = self.inner.lock().await;
            inner.connections.get(key).cloned()
        };
        if let Some(state) = state {
            if state.refcount.load(Ordering::Acquire) == 0 {
                self.close_key(key).await;
            }
        }
    }

    /// `_destroyConnection(key, reason, err?)`: the single teardown path.
    async fn destroy_connection(&self, key: &ConnectionKey, reason: &str, is_error: bool) {
        let state = {
            let mut inner = self.inner.lock().await;
            inner.connections.remove(key)
        };

        let Some(state) = state else { return };

        if state.aborted.swap(true, Ordering::AcqRel) {
            return;
        }

        if is_error {
            tracing::error!(mux = self.name, key = %key, reason, "upstream connection destroyed");
        } else {
            tracing::debug!(mux = self.name, key = %key, reason, "upstream connection destroyed");
        }
        crate::metrics::record_connection_closed(self.name, reason);

        crate::upstream::cancel_and_settle(&state.cancel, self.timings.closekey_settle_delay).await;
        // `state` (the last strong `Arc<ConnectionState>` once subscriber
        // guards and the reader task have released theirs) drops its `tx`
        // when this function returns; no explicit drop needed or possible
        // through the shared reference.

        let mut inner = self.inner.lock().await;
        inner.user_to_last_key.retain(|_, v| v != key);
        let remaining_users: HashSet<String> = inner.user_to_last_key.keys().cloned().collect();
        inner
            .user_last_switch
            .retain(|user, _| remaining_users.contains(user));
    }

    async fn destroy_connection_on_error(&self, key: &ConnectionKey, reason: &str) {
        self.destroy_connection(key, reason, true).await;
    }

    /// Number of currently live upstream connections, for health reporting.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    async fn sweep_once(&self) {
        let (idle_keys, stale_keys, stale_pending): (
            Vec<ConnectionKey>,
            Vec<ConnectionKey>,
            Vec<ConnectionKey>,
        ) = {
            let inner = self.inner.lock().await;
            let idle = inner
                .connections
                .iter()
                .filter(|(_, s)| s.idle_for() > self.timings.upstream_activity_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            let stale = inner
                .connections
                .iter()
                .filter(|(_, s)| s.refcount.load(Ordering::Acquire) == 0)
                .map(|(k, _)| k.clone())
                .collect();
            let stale_pending = inner
                .pending_open_started_at
                .iter()
                .filter(|(_, started)| started.elapsed() > self.timings.stale_pending_threshold)
                .map(|(k, _)| k.clone())
                .collect();
            (idle, stale, stale_pending)
        };

        for key in idle_keys.into_iter().chain(stale_keys) {
            self.close_key(&key).await;
        }

        if !stale_pending.is_empty() {
            let mut inner = self.inner.lock().await;
            for key in &stale_pending {
                if inner.pending_open_started_at.remove(key).is_some() {
                    inner.pending_opens.remove(key);
                    inner.pending_opens_count = inner.pending_opens_count.saturating_sub(1);
                }
            }
        }

        let (connection_count, pending_count) = {
            let inner = self.inner.lock().await;
            (inner.connections.len(), inner.pending_opens_count)
        };
        metrics::gauge!("mux_active_connections", connection_count as f64, "mux" => self.name);

        if connection_count > 20 {
            tracing::warn!(mux = self.name, connection_count, "high upstream connection count");
        }
        if pending_count > 5 {
            tracing::warn!(mux = self.name, pending_count, "high pending-open count");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{OpenStream, Requester};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_util::sync::CancellationToken;

    /// A fake upstream: each `open_stream` call hands back a channel the
    /// test drives directly, standing in for upstream byte chunks.
    struct FakeRequester {
        open_calls: AtomicUsize,
        senders: AsyncMutex<Vec<mpsc::UnboundedSender<Bytes>>>,
        open_delay: std::time::Duration,
    }

    impl FakeRequester {
        fn new() -> Arc<Self> {
            Self::with_open_delay(std::time::Duration::ZERO)
        }

        fn with_open_delay(open_delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                open_calls: AtomicUsize::new(0),
                senders: AsyncMutex::new(Vec::new()),
                open_delay,
            })
        }

        async fn last_sender(&self) -> mpsc::UnboundedSender<Bytes> {
            self.senders.lock().await.last().unwrap().clone()
        }
    }

    #[async_trait]
    impl Requester for FakeRequester {
        async fn open_stream(&self, _user_id: &str, _url: &str) -> Result<OpenStream, MuxError> {
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
            self.senders.lock().await.push(tx);
            let stream = UnboundedReceiverStream::new(rx).map(Ok::<Bytes, std::io::Error>);
            Ok(OpenStream {
                body: Box::pin(stream),
                cancel: CancellationToken::new(),
            })
        }
    }

    fn make_test_mux<D: Send + Sync + 'static>(
        fake: Arc<FakeRequester>,
        exclusive: bool,
        timings: MuxTimings,
        make_key: MakeKeyFn<D>,
    ) -> Arc<Multiplexer<D>> {
        Multiplexer::new(
            "test",
            exclusive,
            timings,
            fake as Arc<dyn Requester>,
            make_key,
            Box::new(|_user_id, _deps: &D| {
                Ok(UpstreamRequest {
                    url: "http://fake.invalid/stream".to_string(),
                })
            }),
        )
    }

    fn unit_key() -> MakeKeyFn<()> {
        Box::new(|user_id, _deps: &()| Ok(user_id.to_string()))
    }

    fn string_key() -> MakeKeyFn<String> {
        Box::new(|user_id, deps: &String| Ok(format!("{user_id}|{deps}")))
    }

    /// Property 1/2: N concurrent subscribers to the same key cause exactly
    /// one upstream open, and all of them observe the same bytes (property 7).
    #[tokio::test]
    async fn dedup_concurrent_subscribers_share_one_upstream() {
        let fake = FakeRequester::new();
        let mux = make_test_mux(fake.clone(), false, MuxTimings::default(), unit_key());

        let mut joins = Vec::new();
        for _ in 0..10 {
            let mux = mux.clone();
            joins.push(tokio::spawn(
                async move { mux.add_subscriber("u42", &()).await },
            ));
        }
        let mut handles = Vec::new();
        for j in joins {
            handles.push(j.await.unwrap().unwrap());
        }

        assert_eq!(fake.open_calls.load(Ordering::SeqCst), 1);

        let tx = fake.last_sender().await;
        tx.send(Bytes::from_static(b"AAPL 190.00")).unwrap();

        for handle in &mut handles {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(1), handle.receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chunk, Bytes::from_static(b"AAPL 190.00"));
        }
    }

    /// Property 8: a subscriber joining after the first byte was sent is
    /// flagged as a late joiner.
    #[tokio::test]
    async fn late_joiner_is_flagged_after_first_data_sent() {
        let fake = FakeRequester::new();
        let mux = make_test_mux(fake.clone(), false, MuxTimings::default(), unit_key());

        let mut first = mux.add_subscriber("u1", &()).await.unwrap();
        assert!(!first.is_late_join);

        let tx = fake.last_sender().await;
        tx.send(Bytes::from_static(b"first chunk")).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), first.receiver.recv())
            .await
            .unwrap()
            .unwrap();

        let late = mux.add_subscriber("u1", &()).await.unwrap();
        assert!(late.is_late_join);
    }

    /// Property 4: once the last subscriber drops, the key becomes openable
    /// again and a fresh upstream is opened on the next subscribe.
    #[tokio::test]
    async fn prompt_teardown_allows_immediate_reopen() {
        let fake = FakeRequester::new();
        let mux = make_test_mux(fake.clone(), false, MuxTimings::default(), unit_key());

        let handle = mux.add_subscriber("u1", &()).await.unwrap();
        assert_eq!(fake.open_calls.load(Ordering::SeqCst), 1);
        drop(handle);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(mux.connection_count().await, 0);

        let handle2 = mux.add_subscriber("u1", &()).await.unwrap();
        assert_eq!(fake.open_calls.load(Ordering::SeqCst), 2);
        drop(handle2);
    }

    /// Property 5: no bytes within `initial_data_timeout` destroys the state.
    #[tokio::test]
    async fn destroys_connection_with_no_initial_data_within_timeout() {
        let fake = FakeRequester::new();
        let mut timings = MuxTimings::default();
        timings.initial_data_timeout = std::time::Duration::from_millis(50);
        let mux = make_test_mux(fake, false, timings, unit_key());

        let mut handle = mux.add_subscriber("u1", &()).await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle.receiver.recv())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    /// Property 6: an idle connection past `upstream_activity_timeout` is
    /// destroyed by the next sweep tick.
    #[tokio::test]
    async fn destroys_idle_connection_after_activity_timeout() {
        let fake = FakeRequester::new();
        let mut timings = MuxTimings::default();
        timings.upstream_activity_timeout = std::time::Duration::from_millis(50);
        timings.sweep_interval = std::time::Duration::from_millis(30);
        let mux = make_test_mux(fake.clone(), false, timings, unit_key());

        let mut handle = mux.add_subscriber("u1", &()).await.unwrap();
        let tx = fake.last_sender().await;
        tx.send(Bytes::from_static(b"keepalive")).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.receiver.recv())
            .await
            .unwrap()
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle.receiver.recv())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    /// Property 3 / scenario S3: switching deps under an exclusive
    /// multiplexer tears down the previous key before opening the new one.
    #[tokio::test]
    async fn exclusive_subscriber_evicts_previous_key_on_switch() {
        let fake = FakeRequester::new();
        let mux = make_test_mux(fake.clone(), true, MuxTimings::default(), string_key());

        let mut handle1 = mux
            .add_exclusive_subscriber("u1", &"AAPL/5/Minute".to_string())
            .await
            .unwrap();
        let handle2 = mux
            .add_exclusive_subscriber("u1", &"AAPL/15/Minute".to_string())
            .await
            .unwrap();

        assert_eq!(fake.open_calls.load(Ordering::SeqCst), 2);

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle1.receiver.recv())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Closed)
        ));

        drop(handle2);
    }

    /// Property 10: the (N+1)th concurrent pending open for a distinct key
    /// is rejected once `max_pending_opens` is reached.
    #[tokio::test]
    async fn rate_limit_gate_rejects_excess_concurrent_opens() {
        let fake = FakeRequester::with_open_delay(std::time::Duration::from_millis(150));
        let mut timings = MuxTimings::default();
        timings.max_pending_opens = 1;
        let mux = make_test_mux(fake.clone(), false, timings, string_key());

        let mux_bg = mux.clone();
        let first = tokio::spawn(async move {
            mux_bg.add_subscriber("u1", &"KEY_A".to_string()).await
        });

        // give the first call time to register its pending-open entry
        // before the still-running open resolves.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let second = mux.add_subscriber("u1", &"KEY_B".to_string()).await;
        assert!(matches!(second, Err(MuxError::RateLimited(_))));

        let first = first.await.unwrap();
        assert!(first.is_ok());
    }
}

async fn run_reader_task<D: Send + Sync + 'static>(
    mux: Arc<Multiplexer<D>>,
    key: ConnectionKey,
    mut body: crate::upstream::ByteStream,
    state: Arc<ConnectionState>,
) {
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                break;
            }
            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        if !state.is_healthy() {
                            break;
                        }
                        state.touch();
                        if !bytes.is_empty() {
                            state.first_data_sent.store(true, Ordering::Release);
                        }
                        if state.refcount.load(Ordering::Acquire) == 0 {
                            mux.destroy_connection(&key, "zombie: no subscribers", false).await;
                            break;
                        }
                        let _ = state.tx.send(bytes);
                    }
                    Some(Err(_)) => {
                        mux.destroy_connection_on_error(&key, "upstream read error").await;
                        break;
                    }
                    None => {
                        mux.destroy_connection(&key, "upstream ended", false).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn spawn_initial_data_timer<D: Send + Sync + 'static>(
    mux: Arc<Multiplexer<D>>,
    key: ConnectionKey,
    state: Arc<ConnectionState>,
    timeout: std::time::Duration,
) {
    tokio::time::sleep(timeout).await;
    if !state.first_data_sent.load(Ordering::Acquire) && state.is_healthy() {
        mux.close_key(&key).await;
    }
}

fn spawn_close_watcher<D: Send + Sync + 'static>(
    mux: Arc<Multiplexer<D>>,
    mut rx: mpsc::UnboundedReceiver<ConnectionKey>,
) {
    tokio::spawn(async move {
        while let Some(key) = rx.recv().await {
            mux.close_if_drained(&key).await;
        }
    });
}

fn spawn_sweep<D: Send + Sync + 'static>(mux: Arc<Multiplexer<D>>) {
    let interval = mux.timings.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            mux.sweep_once().await;
        }
    });
}
