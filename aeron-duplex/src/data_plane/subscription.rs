//! Inbound half: a polled subscription routing reassembled payloads to one
//! sink (client) or to per-session sinks (server).

use crate::channel_uri::ChannelUri;
use crate::connection::InboundSink;
use crate::data_plane::fragment::FragmentAssembler;
use crate::driver::{DriverSubscription, ImageLifecycle};
use crate::error::AeronError;
use crate::observability::{events, fields};
use crate::runtime::commands::Command;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const COMPONENT: &str = "subscription";

/// Session lifecycle observed on a subscription, delivered to the owner of
/// the connection lifecycle (client connector or server acceptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport reported an image for this session.
    Available { session_id: i32 },
    /// The transport reported the session's image gone.
    Unavailable { session_id: i32 },
    /// The session's bounded inbound buffer overflowed; its sink has been
    /// failed with `SlowConsumer` and detached.
    InboundOverflow { session_id: i32 },
}

/// How assembled payloads leave a subscription.
pub enum InboundRoute {
    /// Every payload goes to one sink; the subscription stops being polled
    /// while the sink is saturated (client side).
    Single(InboundSink),
    /// Payloads are demultiplexed by header session id into sinks attached
    /// per session (server side).
    PerSession,
}

/// Handle to a subscription pinned to one event loop.
#[derive(Clone)]
pub struct MessageSubscription {
    id: u64,
    channel: ChannelUri,
    stream_id: i32,
    loop_tx: mpsc::UnboundedSender<Command>,
    disposed: Arc<AtomicBool>,
}

impl MessageSubscription {
    pub(crate) fn new(
        id: u64,
        channel: ChannelUri,
        stream_id: i32,
        loop_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            channel,
            stream_id,
            loop_tx,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &ChannelUri {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Registers a per-session sink on the owning loop. Returns `false` when
    /// the session id is already attached (the existing sink is kept) or the
    /// subscription is gone.
    pub async fn attach_session(
        &self,
        session_id: i32,
        sink: InboundSink,
    ) -> Result<bool, AeronError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.loop_tx
            .send(Command::AttachSession {
                subscription_id: self.id,
                session_id,
                sink,
                reply: reply_tx,
            })
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))
    }

    /// Removes a per-session sink; its inbound completes cleanly.
    pub fn detach_session(&self, session_id: i32) {
        let _ = self.loop_tx.send(Command::DetachSession {
            subscription_id: self.id,
            session_id,
        });
    }

    /// Releases the subscription; the loop closes the driver handle and every
    /// attached sink completes.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .loop_tx
            .send(Command::RemoveSubscription { id: self.id });
    }
}

enum RouteState {
    Single {
        sink: InboundSink,
        /// Payloads assembled mid-poll after the sink filled up; bounded by
        /// the fragment limit because polling pauses while it is non-empty.
        stash: VecDeque<Bytes>,
    },
    PerSession {
        sinks: HashMap<i32, InboundSink>,
    },
}

/// Loop-owned receive state. Only the owning event loop touches this.
pub(crate) struct SubscriptionState {
    id: u64,
    driver: Box<dyn DriverSubscription>,
    assembler: FragmentAssembler,
    route: RouteState,
    events: mpsc::UnboundedSender<SessionEvent>,
    fragment_limit: usize,
}

impl SubscriptionState {
    pub(crate) fn new(
        id: u64,
        driver: Box<dyn DriverSubscription>,
        route: InboundRoute,
        events: mpsc::UnboundedSender<SessionEvent>,
        fragment_limit: usize,
    ) -> Self {
        let route = match route {
            InboundRoute::Single(sink) => RouteState::Single {
                sink,
                stash: VecDeque::new(),
            },
            InboundRoute::PerSession => RouteState::PerSession {
                sinks: HashMap::new(),
            },
        };
        Self {
            id,
            driver,
            assembler: FragmentAssembler::new(),
            route,
            events,
            fragment_limit,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Registers a session sink; refuses to replace an existing one.
    pub(crate) fn attach(&mut self, session_id: i32, sink: InboundSink) -> bool {
        match &mut self.route {
            RouteState::PerSession { sinks } => {
                if sinks.contains_key(&session_id) {
                    return false;
                }
                sinks.insert(session_id, sink);
                debug!(
                    event = events::SUB_SESSION_ATTACHED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    sessions = sinks.len(),
                    "attached session sink"
                );
                true
            }
            RouteState::Single { .. } => false,
        }
    }

    pub(crate) fn detach(&mut self, session_id: i32) {
        if let RouteState::PerSession { sinks } = &mut self.route {
            if sinks.remove(&session_id).is_some() {
                debug!(
                    event = events::SUB_SESSION_DETACHED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    sessions = sinks.len(),
                    "detached session sink"
                );
            }
            self.assembler.abandon_session(session_id);
        }
    }

    /// One receive-cycle step: image lifecycle first, then fragments, unless
    /// the single sink is saturated and polling must pause.
    pub(crate) fn poll_tick(&mut self) -> usize {
        let fragment_limit = self.fragment_limit;
        let Self {
            driver,
            assembler,
            route,
            events,
            ..
        } = self;

        let mut work = 0;
        work += driver.poll_images(&mut |image| match image {
            ImageLifecycle::Available { session_id } => {
                let _ = events.send(SessionEvent::Available { session_id });
            }
            ImageLifecycle::Unavailable { session_id } => {
                assembler.abandon_session(session_id);
                let _ = events.send(SessionEvent::Unavailable { session_id });
            }
        });

        work += route.drain_stash();
        if route.ready_to_poll() {
            work += driver.poll(
                &mut |header, data| {
                    if let Some(payload) = assembler.on_fragment(header, data) {
                        route.deliver(header.session_id, payload, events);
                    }
                },
                fragment_limit,
            );
        }
        work
    }

    pub(crate) fn close(&mut self) {
        self.driver.close();
    }
}

impl RouteState {
    fn ready_to_poll(&self) -> bool {
        match self {
            RouteState::Single { sink, stash } => stash.is_empty() && sink.tx.capacity() > 0,
            RouteState::PerSession { .. } => true,
        }
    }

    fn drain_stash(&mut self) -> usize {
        let RouteState::Single { sink, stash } = self else {
            return 0;
        };
        let mut delivered = 0;
        while let Some(payload) = stash.pop_front() {
            match sink.tx.try_send(payload) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    stash.push_front(payload);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stash.clear();
                    break;
                }
            }
        }
        delivered
    }

    fn deliver(
        &mut self,
        session_id: i32,
        payload: Bytes,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        match self {
            RouteState::Single { sink, stash } => match sink.tx.try_send(payload) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    stash.push_back(payload);
                }
            },
            RouteState::PerSession { sinks } => {
                let Some(sink) = sinks.get(&session_id) else {
                    warn!(
                        event = events::SUB_UNKNOWN_SESSION,
                        component = COMPONENT,
                        session_id = fields::format_session_id(session_id).as_str(),
                        sessions = sinks.len(),
                        "received message but no session sink attached"
                    );
                    return;
                };
                match sink.tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        sinks.remove(&session_id);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            event = events::SUB_SLOW_CONSUMER,
                            component = COMPONENT,
                            session_id = fields::format_session_id(session_id).as_str(),
                            "session inbound buffer overflowed, dropping session"
                        );
                        let sink = sinks.remove(&session_id).expect("sink present");
                        sink.fail(AeronError::SlowConsumer { session_id });
                        let _ = events.send(SessionEvent::InboundOverflow { session_id });
                    }
                }
            }
        }
    }
}
