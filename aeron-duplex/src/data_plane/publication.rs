//! Outbound half of a connection: a bounded send queue drained by the owning
//! event loop with a back-pressured, fragmenting offer cycle.

use crate::channel_uri::ChannelUri;
use crate::control_plane::resources::PublicationCache;
use crate::driver::{frame_flags, DriverPublication, OfferOutcome};
use crate::error::AeronError;
use crate::observability::{events, fields};
use crate::runtime::commands::Command;
use crate::runtime::idle::ConnectBackoff;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

const COMPONENT: &str = "publication";

/// Offers attempted for one publication within a single tick, so one huge
/// fragmented message cannot monopolize a loop shared with other handles.
const MAX_FRAGMENTS_PER_TICK: usize = 256;

/// State shared between a [`MessagePublication`] handle and the loop-side
/// send machinery. The loop writes, handles read.
pub(crate) struct PublicationShared {
    session_id: AtomicI32,
    connected: AtomicBool,
    disposed: AtomicBool,
    max_payload_length: AtomicUsize,
    max_message_length: AtomicUsize,
    closed_tx: watch::Sender<bool>,
    error: Mutex<Option<AeronError>>,
}

impl PublicationShared {
    pub(crate) fn new() -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            session_id: AtomicI32::new(0),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            max_payload_length: AtomicUsize::new(0),
            max_message_length: AtomicUsize::new(0),
            closed_tx,
            error: Mutex::new(None),
        })
    }

    pub(crate) fn bind(&self, driver: &dyn DriverPublication) {
        self.session_id.store(driver.session_id(), Ordering::Release);
        self.max_payload_length
            .store(driver.max_payload_length(), Ordering::Release);
        self.max_message_length
            .store(driver.max_message_length(), Ordering::Release);
        self.connected.store(driver.is_connected(), Ordering::Release);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self, error: Option<AeronError>) {
        if let Some(error) = error {
            let mut slot = self.error.lock().expect("publication error slot poisoned");
            slot.get_or_insert(error);
        }
        self.disposed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.closed_tx.send_replace(true);
    }
}

/// One queued send and its completion handle.
pub(crate) struct SendRequest {
    pub(crate) payload: Bytes,
    pub(crate) completion: oneshot::Sender<Result<(), AeronError>>,
    pub(crate) enqueued_at: Instant,
}

/// Timeouts and fairness knobs snapshotted from the options at creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PublicationSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) publication_timeout: Duration,
    pub(crate) backpressure_timeout: Duration,
    pub(crate) sends_per_tick: usize,
    pub(crate) mtu_override: Option<usize>,
}

/// Handle to a publication pinned to one event loop.
///
/// Cloning is cheap; clones share the send queue and the underlying driver
/// resource. A cached publication (shared, idempotent by channel and stream)
/// is released when its last cache lease is disposed; an exclusive one, as
/// the client connector uses for a session of its own, is released by its
/// own dispose.
#[derive(Clone)]
pub struct MessagePublication {
    id: u64,
    channel: ChannelUri,
    stream_id: i32,
    queue_tx: mpsc::Sender<SendRequest>,
    shared: Arc<PublicationShared>,
    loop_tx: mpsc::UnboundedSender<Command>,
    cache: Option<Arc<PublicationCache>>,
    lease: Arc<AtomicBool>,
    connect_timeout: Duration,
}

impl MessagePublication {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        channel: ChannelUri,
        stream_id: i32,
        queue_tx: mpsc::Sender<SendRequest>,
        shared: Arc<PublicationShared>,
        loop_tx: mpsc::UnboundedSender<Command>,
        cache: Option<Arc<PublicationCache>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            id,
            channel,
            stream_id,
            queue_tx,
            shared,
            loop_tx,
            cache,
            lease: Arc::new(AtomicBool::new(false)),
            connect_timeout,
        }
    }

    /// Hands out a fresh cache lease over the same underlying publication;
    /// used when the cache satisfies a repeat request.
    pub(crate) fn with_fresh_lease(&self) -> Self {
        let mut leased = self.clone();
        leased.lease = Arc::new(AtomicBool::new(false));
        leased
    }

    pub fn channel(&self) -> &ChannelUri {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Session id assigned by the driver when the publication was created.
    pub fn session_id(&self) -> i32 {
        self.shared.session_id.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// The fatal error that closed this publication, if any.
    pub fn error(&self) -> Option<AeronError> {
        self.shared
            .error
            .lock()
            .expect("publication error slot poisoned")
            .clone()
    }

    /// Completes once the driver reports the publication connected, re-polling
    /// with exponential backoff, or fails with `NotConnected` after the
    /// connect timeout.
    pub async fn ensure_connected(&self) -> Result<(), AeronError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut backoff = ConnectBackoff::new();
        loop {
            if self.is_disposed() {
                return Err(self.error().unwrap_or_else(|| {
                    AeronError::Cancelled(format!("publication {} disposed", self.channel))
                }));
            }
            if self.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AeronError::NotConnected(format!(
                    "publication {} saw no subscriber within {:?}",
                    self.channel, self.connect_timeout
                )));
            }
            backoff.wait().await;
        }
    }

    /// Sends one payload, waiting for queue capacity, then for the event loop
    /// to offer every fragment.
    pub async fn send(&self, payload: Bytes) -> Result<(), AeronError> {
        let completion = self.admit(payload, false).await?;
        Self::settle(completion).await
    }

    /// Sends one payload without waiting for queue capacity: a full queue
    /// fails immediately with `Backpressured`.
    pub async fn enqueue(&self, payload: Bytes) -> Result<(), AeronError> {
        let completion = self.admit(payload, true).await?;
        Self::settle(completion).await
    }

    async fn admit(
        &self,
        payload: Bytes,
        non_blocking: bool,
    ) -> Result<oneshot::Receiver<Result<(), AeronError>>, AeronError> {
        if self.is_disposed() {
            return Err(AeronError::Cancelled(format!(
                "publication {} disposed",
                self.channel
            )));
        }
        let max_message = self.shared.max_message_length.load(Ordering::Acquire);
        if max_message > 0 && payload.len() > max_message {
            return Err(AeronError::MessageTooLarge {
                length: payload.len(),
                max: max_message,
            });
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let request = SendRequest {
            payload,
            completion: completion_tx,
            enqueued_at: Instant::now(),
        };
        if non_blocking {
            self.queue_tx.try_send(request).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => AeronError::Backpressured(format!(
                    "send queue of {} is full",
                    self.channel
                )),
                mpsc::error::TrySendError::Closed(_) => {
                    AeronError::Cancelled(format!("publication {} closed", self.channel))
                }
            })?;
        } else {
            self.queue_tx.send(request).await.map_err(|_| {
                AeronError::Cancelled(format!("publication {} closed", self.channel))
            })?;
        }
        Ok(completion_rx)
    }

    async fn settle(
        completion: oneshot::Receiver<Result<(), AeronError>>,
    ) -> Result<(), AeronError> {
        completion
            .await
            .unwrap_or_else(|_| Err(AeronError::Cancelled("publication closed".to_string())))
    }

    /// Releases this lease; the loop-side resource is drained and closed when
    /// the last lease goes.
    pub fn dispose(&self) {
        if self.lease.swap(true, Ordering::AcqRel) {
            return;
        }
        let last = match &self.cache {
            Some(cache) => cache.release(&self.channel, self.stream_id),
            None => true,
        };
        if last {
            let _ = self.loop_tx.send(Command::RemovePublication { id: self.id });
        }
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    pub(crate) fn registration_id(&self) -> u64 {
        self.id
    }

    /// Removes the loop-side resource without going through the cache; used
    /// by resources teardown after the cache has been drained.
    pub(crate) fn force_remove(&self) {
        self.lease.store(true, Ordering::Release);
        let _ = self.loop_tx.send(Command::RemovePublication { id: self.id });
    }
}

struct InFlight {
    payload: Bytes,
    completion: Option<oneshot::Sender<Result<(), AeronError>>>,
    enqueued_at: Instant,
    offset: usize,
    backpressure_since: Option<Instant>,
}

impl InFlight {
    fn new(request: SendRequest) -> Self {
        Self {
            payload: request.payload,
            completion: Some(request.completion),
            enqueued_at: request.enqueued_at,
            offset: 0,
            backpressure_since: None,
        }
    }

    fn next_chunk(&self, max_payload: usize) -> (u8, &[u8]) {
        let remaining = self.payload.len() - self.offset;
        let length = remaining.min(max_payload.max(1));
        let mut flags = 0;
        if self.offset == 0 {
            flags |= frame_flags::BEGIN;
        }
        if self.offset + length == self.payload.len() {
            flags |= frame_flags::END;
        }
        (flags, &self.payload[self.offset..self.offset + length])
    }

    fn advance(&mut self, offered: usize) -> bool {
        self.offset += offered;
        self.offset >= self.payload.len()
    }

    fn complete(mut self, result: Result<(), AeronError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

pub(crate) enum StepVerdict {
    Keep,
    Remove,
}

/// Loop-owned send state. Only the owning event loop touches this.
pub(crate) struct PublicationState {
    id: u64,
    channel: ChannelUri,
    driver: Box<dyn DriverPublication>,
    queue: mpsc::Receiver<SendRequest>,
    head: Option<InFlight>,
    shared: Arc<PublicationShared>,
    settings: PublicationSettings,
    created_at: Instant,
}

impl PublicationState {
    pub(crate) fn new(
        id: u64,
        channel: ChannelUri,
        driver: Box<dyn DriverPublication>,
        queue: mpsc::Receiver<SendRequest>,
        shared: Arc<PublicationShared>,
        settings: PublicationSettings,
    ) -> Self {
        shared.bind(driver.as_ref());
        Self {
            id,
            channel,
            driver,
            queue,
            head: None,
            shared,
            settings,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn max_payload(&self) -> usize {
        let driver_max = self.driver.max_payload_length();
        match self.settings.mtu_override {
            Some(mtu) => mtu.min(driver_max),
            None => driver_max,
        }
    }

    /// One send-cycle step: serve up to the fairness cap of requests from the
    /// queue head, fragmenting and retrying per the offer outcome.
    pub(crate) fn step(&mut self, now: Instant) -> (usize, StepVerdict) {
        self.shared.set_connected(self.driver.is_connected());

        let max_payload = self.max_payload();
        let mut work = 0;
        let mut served = 0;
        let mut fragments = 0;

        while served < self.settings.sends_per_tick && fragments < MAX_FRAGMENTS_PER_TICK {
            if self.head.is_none() {
                match self.queue.try_recv() {
                    Ok(request) => self.head = Some(InFlight::new(request)),
                    Err(_) => break,
                }
            }

            let head = self.head.as_mut().expect("head populated above");
            if now.duration_since(head.enqueued_at) > self.settings.publication_timeout {
                tracing::warn!(
                    event = events::PUB_ITEM_TIMEOUT,
                    component = COMPONENT,
                    session_id = fields::format_session_id(self.driver.session_id()).as_str(),
                    waited_ms = now.duration_since(head.enqueued_at).as_millis() as u64,
                    "dropping send older than publication timeout"
                );
                let head = self.head.take().expect("head present");
                head.complete(Err(AeronError::Timeout(format!(
                    "send on {} outlived the publication timeout",
                    self.channel
                ))));
                served += 1;
                work += 1;
                continue;
            }

            let (flags, chunk) = head.next_chunk(max_payload);
            let chunk_len = chunk.len();
            match self.driver.offer(flags, chunk) {
                OfferOutcome::Position(_) => {
                    fragments += 1;
                    work += 1;
                    let head = self.head.as_mut().expect("head present");
                    head.backpressure_since = None;
                    if head.advance(chunk_len) {
                        let head = self.head.take().expect("head present");
                        head.complete(Ok(()));
                        served += 1;
                    }
                }
                OfferOutcome::BackPressured | OfferOutcome::AdminAction => {
                    let head = self.head.as_mut().expect("head present");
                    let since = *head.backpressure_since.get_or_insert(now);
                    if now.duration_since(since) > self.settings.backpressure_timeout {
                        tracing::warn!(
                            event = events::PUB_BACKPRESSURE_TIMEOUT,
                            component = COMPONENT,
                            session_id =
                                fields::format_session_id(self.driver.session_id()).as_str(),
                            "offer back-pressured beyond the backpressure timeout"
                        );
                        let head = self.head.take().expect("head present");
                        head.complete(Err(AeronError::Timeout(format!(
                            "offer on {} back-pressured beyond the backpressure timeout",
                            self.channel
                        ))));
                        served += 1;
                        work += 1;
                        continue;
                    }
                    break;
                }
                OfferOutcome::NotConnected => {
                    if now.duration_since(self.created_at) <= self.settings.connect_timeout {
                        break;
                    }
                    tracing::warn!(
                        event = events::PUB_NOT_CONNECTED,
                        component = COMPONENT,
                        session_id = fields::format_session_id(self.driver.session_id()).as_str(),
                        channel = fields::format_channel(&self.channel).as_str(),
                        "no subscriber beyond the connect timeout"
                    );
                    let error = AeronError::NotConnected(format!(
                        "no subscriber on {} beyond the connect timeout",
                        self.channel
                    ));
                    self.shutdown(error);
                    return (work + 1, StepVerdict::Remove);
                }
                OfferOutcome::MaxPositionExceeded | OfferOutcome::Closed => {
                    tracing::warn!(
                        event = events::PUB_FATAL,
                        component = COMPONENT,
                        session_id = fields::format_session_id(self.driver.session_id()).as_str(),
                        channel = fields::format_channel(&self.channel).as_str(),
                        "unrecoverable offer outcome"
                    );
                    let error =
                        AeronError::Fatal(format!("publication {} is unusable", self.channel));
                    self.shutdown(error);
                    return (work + 1, StepVerdict::Remove);
                }
            }
        }

        (work, StepVerdict::Keep)
    }

    /// Fails the head with `error`, cancels everything behind it, closes the
    /// driver handle and marks the shared state closed.
    pub(crate) fn shutdown(&mut self, error: AeronError) {
        if let Some(head) = self.head.take() {
            head.complete(Err(error.clone()));
        }
        self.drain_cancelled();
        self.driver.close();
        self.shared.mark_closed(Some(error));
    }

    /// Graceful removal: pending items fail with `Cancelled`.
    pub(crate) fn close(&mut self) {
        let cancelled =
            AeronError::Cancelled(format!("publication {} disposed", self.channel));
        if let Some(head) = self.head.take() {
            head.complete(Err(cancelled.clone()));
        }
        self.drain_cancelled();
        self.driver.close();
        self.shared.mark_closed(None);
    }

    fn drain_cancelled(&mut self) {
        let mut cancelled = 0usize;
        while let Ok(request) = self.queue.try_recv() {
            cancelled += 1;
            InFlight::new(request).complete(Err(AeronError::Cancelled(format!(
                "publication {} disposed before send",
                self.channel
            ))));
        }
        if cancelled > 0 {
            tracing::debug!(
                event = events::PUB_DRAIN_CANCELLED,
                component = COMPONENT,
                session_id = fields::format_session_id(self.driver.session_id()).as_str(),
                cancelled,
                "cancelled pending sends on dispose"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        InFlight, PublicationSettings, PublicationShared, PublicationState, SendRequest,
        StepVerdict,
    };
    use crate::channel_uri::ChannelUri;
    use crate::driver::{frame_flags, DriverPublication, OfferOutcome};
    use crate::error::AeronError;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::{mpsc, oneshot};

    struct ScriptedPublication {
        outcomes: Arc<Mutex<VecDeque<OfferOutcome>>>,
        offers: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
        max_payload: usize,
    }

    impl ScriptedPublication {
        fn new(max_payload: usize) -> (Self, Arc<Mutex<VecDeque<OfferOutcome>>>, Arc<Mutex<Vec<(u8, Vec<u8>)>>>) {
            let outcomes = Arc::new(Mutex::new(VecDeque::new()));
            let offers = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    outcomes: outcomes.clone(),
                    offers: offers.clone(),
                    max_payload,
                },
                outcomes,
                offers,
            )
        }
    }

    impl DriverPublication for ScriptedPublication {
        fn session_id(&self) -> i32 {
            42
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn max_payload_length(&self) -> usize {
            self.max_payload
        }

        fn max_message_length(&self) -> usize {
            self.max_payload * 1024
        }

        fn offer(&mut self, flags: u8, payload: &[u8]) -> OfferOutcome {
            self.offers.lock().unwrap().push((flags, payload.to_vec()));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(OfferOutcome::Position(0))
        }

        fn close(&mut self) {}
    }

    fn settings() -> PublicationSettings {
        PublicationSettings {
            connect_timeout: Duration::from_secs(1),
            publication_timeout: Duration::from_secs(5),
            backpressure_timeout: Duration::from_secs(5),
            sends_per_tick: 8,
            mtu_override: None,
        }
    }

    fn state_with(
        driver: ScriptedPublication,
        settings: PublicationSettings,
    ) -> (PublicationState, mpsc::Sender<SendRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let state = PublicationState::new(
            1,
            ChannelUri::udp().with_endpoint("host:1"),
            Box::new(driver),
            rx,
            PublicationShared::new(),
            settings,
        );
        (state, tx)
    }

    fn request(payload: &[u8]) -> (SendRequest, oneshot::Receiver<Result<(), AeronError>>) {
        let (completion, rx) = oneshot::channel();
        (
            SendRequest {
                payload: Bytes::copy_from_slice(payload),
                completion,
                enqueued_at: Instant::now(),
            },
            rx,
        )
    }

    #[test]
    fn next_chunk_flags_unfragmented_payloads() {
        let (request, _rx) = request(b"small");
        let in_flight = InFlight::new(request);

        let (flags, chunk) = in_flight.next_chunk(1024);

        assert_eq!(flags, frame_flags::UNFRAGMENTED);
        assert_eq!(chunk, b"small");
    }

    #[tokio::test]
    async fn step_fragments_large_payloads_with_begin_middle_end() {
        let (driver, _outcomes, offers) = ScriptedPublication::new(4);
        let (mut state, tx) = state_with(driver, settings());
        let (request, mut completion) = request(b"0123456789");
        tx.try_send(request).unwrap();

        let (work, _verdict) = state.step(Instant::now());

        assert_eq!(work, 3);
        let offers = offers.lock().unwrap();
        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0], (frame_flags::BEGIN, b"0123".to_vec()));
        assert_eq!(offers[1], (0, b"4567".to_vec()));
        assert_eq!(offers[2], (frame_flags::END, b"89".to_vec()));
        assert_eq!(completion.try_recv().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn back_pressure_leaves_the_head_in_place_for_retry() {
        let (driver, outcomes, offers) = ScriptedPublication::new(64);
        outcomes
            .lock()
            .unwrap()
            .push_back(OfferOutcome::BackPressured);
        let (mut state, tx) = state_with(driver, settings());
        let (request, mut completion) = request(b"retry me");
        tx.try_send(request).unwrap();

        state.step(Instant::now());
        assert!(completion.try_recv().is_err());

        state.step(Instant::now());
        assert_eq!(completion.try_recv().unwrap(), Ok(()));
        assert_eq!(offers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_back_pressure_fails_the_item_with_timeout() {
        let (driver, outcomes, _offers) = ScriptedPublication::new(64);
        outcomes
            .lock()
            .unwrap()
            .extend([OfferOutcome::BackPressured, OfferOutcome::BackPressured]);
        let mut tuned = settings();
        tuned.backpressure_timeout = Duration::from_millis(0);
        let (mut state, tx) = state_with(driver, tuned);
        let (request, mut completion) = request(b"stuck");
        tx.try_send(request).unwrap();

        let first_tick = Instant::now();
        state.step(first_tick);
        state.step(first_tick + Duration::from_millis(5));

        assert!(matches!(
            completion.try_recv().unwrap(),
            Err(AeronError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn fatal_outcome_fails_the_item_and_removes_the_publication() {
        let (driver, outcomes, _offers) = ScriptedPublication::new(64);
        outcomes.lock().unwrap().push_back(OfferOutcome::Closed);
        let (mut state, tx) = state_with(driver, settings());
        let (request, mut completion) = request(b"doomed");
        tx.try_send(request).unwrap();

        let (_work, verdict) = state.step(Instant::now());

        assert!(matches!(verdict, StepVerdict::Remove));
        assert!(matches!(
            completion.try_recv().unwrap(),
            Err(AeronError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn close_cancels_head_and_queued_items() {
        let (driver, outcomes, _offers) = ScriptedPublication::new(64);
        outcomes
            .lock()
            .unwrap()
            .push_back(OfferOutcome::BackPressured);
        let (mut state, tx) = state_with(driver, settings());
        let (first, mut first_completion) = request(b"head");
        let (second, mut second_completion) = request(b"queued");
        tx.try_send(first).unwrap();
        tx.try_send(second).unwrap();
        state.step(Instant::now());

        state.close();

        assert!(matches!(
            first_completion.try_recv().unwrap(),
            Err(AeronError::Cancelled(_))
        ));
        assert!(matches!(
            second_completion.try_recv().unwrap(),
            Err(AeronError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn fairness_cap_bounds_requests_served_per_tick() {
        let (driver, _outcomes, _offers) = ScriptedPublication::new(64);
        let mut tuned = settings();
        tuned.sends_per_tick = 2;
        let (mut state, tx) = state_with(driver, tuned);
        let mut completions = Vec::new();
        for _ in 0..4 {
            let (request, completion) = request(b"x");
            tx.try_send(request).unwrap();
            completions.push(completion);
        }

        state.step(Instant::now());

        let mut settled = 0;
        for completion in completions.iter_mut() {
            if completion.try_recv().is_ok() {
                settled += 1;
            }
        }
        assert_eq!(settled, 2);
    }
}
