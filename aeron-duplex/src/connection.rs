/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use crate::data_plane::publication::MessagePublication;
use crate::error::AeronError;
use crate::observability::{events, fields};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info};

const COMPONENT: &str = "connection";

/// Bound on waiting for the publication to drain during teardown; only hit
/// when the owning event loop has already died.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_INIT: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DISPOSING: u8 = 2;
const STATE_DISPOSED: u8 = 3;

/// A resource with an explicit dispose lifecycle.
#[async_trait]
pub trait OnDisposable: Send + Sync {
    /// Requests teardown; safe to call repeatedly.
    fn dispose(&self);

    /// Whether teardown has fully completed.
    fn is_disposed(&self) -> bool;

    /// Completes once teardown has fully completed, however triggered.
    async fn on_dispose(&self);
}

/// User logic attached to a connection; its completion or error disposes the
/// connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, connection: Connection) -> Result<(), AeronError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConnectionHandler for FnHandler<F>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AeronError>> + Send + 'static,
{
    async fn handle(&self, connection: Connection) -> Result<(), AeronError> {
        (self.0)(connection).await
    }
}

/// Wraps an async closure as a [`ConnectionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConnectionHandler>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AeronError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub(crate) struct InboundShared {
    error: StdMutex<Option<AeronError>>,
}

/// Loop-side handle feeding one inbound stream; dropping it completes the
/// stream.
pub struct InboundSink {
    pub(crate) tx: mpsc::Sender<Bytes>,
    shared: Arc<InboundShared>,
}

impl InboundSink {
    /// Records the terminal error and closes the stream.
    pub(crate) fn fail(self, error: AeronError) {
        self.shared.set_error(error);
    }
}

impl InboundShared {
    fn set_error(&self, error: AeronError) {
        let mut slot = self.error.lock().expect("inbound error slot poisoned");
        slot.get_or_insert(error);
    }
}

/// Lazily received stream of reassembled payloads for one connection.
///
/// `recv` yields payloads in arrival order and `None` once the stream
/// terminates; [`Inbound::error`] then reports why, if the termination was
/// not a clean close. The buffer is bounded, so an unread inbound
/// back-pressures the transport (client) or trips the slow-consumer policy
/// (server).
pub struct Inbound {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    shared: Arc<InboundShared>,
}

impl Inbound {
    /// Creates a bounded inbound stream and the sink that feeds it.
    pub fn channel(capacity: usize) -> (InboundSink, Inbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(InboundShared {
            error: StdMutex::new(None),
        });
        (
            InboundSink {
                tx,
                shared: shared.clone(),
            },
            Inbound {
                rx: Mutex::new(rx),
                shared,
            },
        )
    }

    /// Receives the next payload, or `None` once the stream terminates.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// The error that terminated the stream, if any.
    pub fn error(&self) -> Option<AeronError> {
        self.shared
            .error
            .lock()
            .expect("inbound error slot poisoned")
            .clone()
    }

    pub(crate) fn fail(&self, error: AeronError) {
        self.shared.set_error(error);
    }
}

/// Back-pressured send side of one connection.
#[derive(Clone)]
pub struct Outbound {
    publication: MessagePublication,
}

impl Outbound {
    pub(crate) fn new(publication: MessagePublication) -> Self {
        Self { publication }
    }

    pub fn publication(&self) -> &MessagePublication {
        &self.publication
    }

    /// Sends one payload, waiting for send-queue capacity.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), AeronError> {
        self.publication.send(payload.into()).await
    }

    /// Sends one payload without waiting for queue capacity; a full queue
    /// fails immediately with `Backpressured`.
    pub async fn enqueue(&self, payload: impl Into<Bytes>) -> Result<(), AeronError> {
        self.publication.enqueue(payload.into()).await
    }

    /// Drains a lazy sequence of payloads in order, stopping at the first
    /// failure.
    pub async fn send_all(
        &self,
        stream: impl Stream<Item = Bytes> + Unpin,
    ) -> Result<(), AeronError> {
        let mut stream = stream;
        while let Some(payload) = stream.next().await {
            self.send(payload).await?;
        }
        Ok(())
    }
}

struct ConnectionInner {
    session_id: i32,
    inbound: Inbound,
    outbound: Outbound,
    state: AtomicU8,
    dispose_requested: Notify,
    dispose_done: Notify,
    done: AtomicBool,
    cleanup: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// One full-duplex session: an exclusive outbound publication paired with an
/// inbound stream under a single session id.
///
/// Lifecycle: INIT → ACTIVE → DISPOSING → DISPOSED. Teardown is triggered by
/// the first of: [`Connection::dispose`], the session's image becoming
/// unavailable, a fatal publication failure, or the attached handler
/// finishing. [`Connection::on_dispose`] completes exactly once, after the
/// publication has drained and the inbound has terminated.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Builds the connection and wires its dispose triggers. Must run inside
    /// a tokio runtime: the teardown task and the publication-failure watcher
    /// live on it.
    pub(crate) fn new(
        session_id: i32,
        inbound: Inbound,
        outbound: Outbound,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Self {
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                session_id,
                inbound,
                outbound,
                state: AtomicU8::new(STATE_INIT),
                dispose_requested: Notify::new(),
                dispose_done: Notify::new(),
                done: AtomicBool::new(false),
                cleanup: StdMutex::new(Some(Box::new(cleanup))),
            }),
        };

        let watcher = connection.clone();
        let mut closed_rx = connection.inner.outbound.publication().closed_watch();
        tokio::spawn(async move {
            if closed_rx.wait_for(|closed| *closed).await.is_ok() {
                watcher.dispose();
            }
        });

        let teardown = connection.clone();
        tokio::spawn(async move {
            teardown.run_teardown().await;
        });

        connection
    }

    pub fn session_id(&self) -> i32 {
        self.inner.session_id
    }

    pub fn inbound(&self) -> &Inbound {
        &self.inner.inbound
    }

    pub fn outbound(&self) -> &Outbound {
        &self.inner.outbound
    }

    /// Marks the connection live and hands it to the user handler. A
    /// connection that was disposed before activation skips the handler.
    pub(crate) fn activate(&self, handler: Option<Arc<dyn ConnectionHandler>>) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_INIT,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        info!(
            event = events::CONNECTION_ACTIVE,
            component = COMPONENT,
            session_id = fields::format_session_id(self.inner.session_id).as_str(),
            "connection active"
        );

        if let Some(handler) = handler {
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.handle(connection.clone()).await {
                    error!(
                        event = events::HANDLER_FAILED,
                        component = COMPONENT,
                        session_id =
                            fields::format_session_id(connection.session_id()).as_str(),
                        err = %err,
                        "handler finished with error"
                    );
                }
                connection.dispose();
            });
        }
    }

    /// Records the terminal inbound error before teardown makes it visible.
    pub(crate) fn fail_inbound(&self, error: AeronError) {
        self.inner.inbound.fail(error);
    }

    async fn run_teardown(&self) {
        self.inner.dispose_requested.notified().await;
        debug!(
            event = events::CONNECTION_DISPOSING,
            component = COMPONENT,
            session_id = fields::format_session_id(self.inner.session_id).as_str(),
            "connection disposing"
        );

        let publication = self.inner.outbound.publication().clone();
        publication.dispose();
        let mut closed_rx = publication.closed_watch();
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, closed_rx.wait_for(|closed| *closed)).await;

        let cleanup = self
            .inner
            .cleanup
            .lock()
            .expect("connection cleanup slot poisoned")
            .take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }

        self.inner.state.store(STATE_DISPOSED, Ordering::Release);
        self.inner.done.store(true, Ordering::Release);
        self.inner.dispose_done.notify_waiters();
        debug!(
            event = events::CONNECTION_DISPOSED,
            component = COMPONENT,
            session_id = fields::format_session_id(self.inner.session_id).as_str(),
            "connection disposed"
        );
    }

    pub fn dispose(&self) {
        let transition = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < STATE_DISPOSING).then_some(STATE_DISPOSING)
            });
        if transition.is_ok() {
            self.inner.dispose_requested.notify_one();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    pub async fn on_dispose(&self) {
        let mut notified = pin!(self.inner.dispose_done.notified());
        notified.as_mut().enable();
        if self.inner.done.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

#[async_trait]
impl OnDisposable for Connection {
    fn dispose(&self) {
        Connection::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Connection::is_disposed(self)
    }

    async fn on_dispose(&self) {
        Connection::on_dispose(self).await;
    }
}
