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

//! Full-duplex server handler. Schematically:
//!
//! ```text
//! Server
//! serverPort        -> inbound  -> Sub(endpoint, demux by sessionId)
//! + image available:
//! serverControlPort -> outbound -> MDC(sessionId) -> Pub(control-endpoint, sessionId)
//! ```

use crate::channel_uri::ChannelUri;
use crate::connection::{Connection, ConnectionHandler, Inbound, OnDisposable, Outbound};
use crate::control_plane::resources::AeronResources;
use crate::data_plane::subscription::{InboundRoute, MessageSubscription, SessionEvent};
use crate::error::AeronError;
use crate::observability::{events, fields};
use crate::options::AeronOptions;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "server";

type ConnectionMap = Arc<Mutex<HashMap<i32, Connection>>>;

/// Binds one shared subscription and demultiplexes every arriving session
/// into its own [`Connection`] with a per-session MDC reverse publication.
pub struct AeronServer {
    resources: AeronResources,
    options: AeronOptions,
    inbound_uri: Option<ChannelUri>,
    outbound_uri: Option<ChannelUri>,
    handler: Option<Arc<dyn ConnectionHandler>>,
}

impl AeronServer {
    pub fn create(resources: AeronResources) -> Self {
        Self {
            resources,
            options: AeronOptions::default(),
            inbound_uri: None,
            outbound_uri: None,
            handler: None,
        }
    }

    pub fn options(mut self, options: AeronOptions) -> Self {
        self.options = options;
        self
    }

    /// The endpoint clients publish to; one subscription serves them all.
    pub fn inbound_uri(mut self, uri: ChannelUri) -> Self {
        self.inbound_uri = Some(uri);
        self
    }

    /// Template for reverse publications: the control endpoint, qualified per
    /// session with the arriving session id.
    pub fn outbound_uri(mut self, uri: ChannelUri) -> Self {
        self.outbound_uri = Some(uri);
        self
    }

    pub fn handle(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Opens the shared subscription and starts accepting sessions.
    pub async fn bind(&self) -> Result<ServerBinding, AeronError> {
        let inbound_uri = self
            .inbound_uri
            .clone()
            .ok_or_else(|| AeronError::InvalidChannel("server inbound URI not set".to_string()))?;
        let outbound_uri = self
            .outbound_uri
            .clone()
            .ok_or_else(|| AeronError::InvalidChannel("server outbound URI not set".to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscription = self
            .resources
            .subscription(
                &inbound_uri,
                self.options.server_stream_id(),
                InboundRoute::PerSession,
                events_tx,
                &self.options,
            )
            .await?;

        let binding = ServerBinding::new(subscription.clone());
        let acceptor = Arc::new(Acceptor {
            resources: self.resources.clone(),
            options: self.options.clone(),
            outbound_uri,
            handler: self.handler.clone(),
            subscription,
            connections: binding.connections(),
        });
        tokio::spawn(Acceptor::run(acceptor, events_rx));
        binding.spawn_teardown();

        info!(
            event = events::SERVER_BOUND,
            component = COMPONENT,
            channel = fields::format_channel(&inbound_uri).as_str(),
            "server handler bound"
        );
        Ok(binding)
    }
}

struct Acceptor {
    resources: AeronResources,
    options: AeronOptions,
    outbound_uri: ChannelUri,
    handler: Option<Arc<dyn ConnectionHandler>>,
    subscription: MessageSubscription,
    connections: ConnectionMap,
}

impl Acceptor {
    /// Consumes session events until the shared subscription goes away.
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Available { session_id } => {
                    if self.connections.lock().await.contains_key(&session_id) {
                        // duplicate session ids mean the driver changed its
                        // contract; refuse and keep the existing connection
                        error!(
                            event = events::SERVER_SESSION_REFUSED,
                            component = COMPONENT,
                            session_id = fields::format_session_id(session_id).as_str(),
                            err = %AeronError::SessionCollision { session_id },
                            "server connection already exists"
                        );
                        continue;
                    }
                    let acceptor = self.clone();
                    tokio::spawn(async move {
                        acceptor.create_session(session_id).await;
                    });
                }
                SessionEvent::Unavailable { session_id } => {
                    self.drop_session(session_id, AeronError::ImageLost { session_id }, true)
                        .await;
                }
                SessionEvent::InboundOverflow { session_id } => {
                    // the loop already failed and detached the session's sink
                    self.drop_session(
                        session_id,
                        AeronError::SlowConsumer { session_id },
                        false,
                    )
                    .await;
                }
            }
        }
    }

    /// Builds the reverse MDC publication and the per-session connection for
    /// a freshly arrived image.
    async fn create_session(&self, session_id: i32) {
        let outbound_channel = self.outbound_uri.clone().with_session_id(session_id);
        debug!(
            component = COMPONENT,
            session_id = fields::format_session_id(session_id).as_str(),
            channel = fields::format_channel(&outbound_channel).as_str(),
            "creating server connection"
        );

        // the sink goes in first so payloads racing the reverse-publication
        // setup buffer instead of dropping
        let (sink, inbound) = Inbound::channel(self.options.send_queue_capacity());
        match self.subscription.attach_session(session_id, sink).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    event = events::SERVER_SESSION_REFUSED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    err = %AeronError::SessionCollision { session_id },
                    "session sink already attached"
                );
                return;
            }
            Err(err) => {
                warn!(
                    event = events::SERVER_SESSION_FAILED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    err = %err,
                    "failed to attach session sink"
                );
                return;
            }
        }

        let publication = match self
            .resources
            .publication(&outbound_channel, self.options.client_stream_id(), &self.options)
            .await
        {
            Ok(publication) => publication,
            Err(err) => {
                warn!(
                    event = events::SERVER_SESSION_FAILED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    err = %err,
                    "failed to create server outbound"
                );
                self.subscription.detach_session(session_id);
                return;
            }
        };
        if let Err(err) = publication.ensure_connected().await {
            warn!(
                event = events::SERVER_SESSION_FAILED,
                component = COMPONENT,
                session_id = fields::format_session_id(session_id).as_str(),
                err = %err,
                "server outbound never connected, session not accepted"
            );
            publication.dispose();
            self.subscription.detach_session(session_id);
            return;
        }

        let detach_subscription = self.subscription.clone();
        let connection = Connection::new(
            session_id,
            inbound,
            Outbound::new(publication),
            move || detach_subscription.detach_session(session_id),
        );

        {
            let mut connections = self.connections.lock().await;
            if connections.contains_key(&session_id) {
                error!(
                    event = events::SERVER_SESSION_REFUSED,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    err = %AeronError::SessionCollision { session_id },
                    "server connection already exists"
                );
                connection.dispose();
                return;
            }
            connections.insert(session_id, connection.clone());
        }

        // whichever way the connection ends, drop it from the session map
        let connections = self.connections.clone();
        let tracked = connection.clone();
        tokio::spawn(async move {
            tracked.on_dispose().await;
            connections.lock().await.remove(&session_id);
        });

        connection.activate(self.handler.clone());
        info!(
            event = events::SERVER_SESSION_CREATED,
            component = COMPONENT,
            session_id = fields::format_session_id(session_id).as_str(),
            channel = fields::format_channel(&outbound_channel).as_str(),
            "created server connection"
        );
    }

    async fn drop_session(&self, session_id: i32, error: AeronError, fail_inbound: bool) {
        let connection = self.connections.lock().await.remove(&session_id);
        let Some(connection) = connection else {
            debug!(
                component = COMPONENT,
                session_id = fields::format_session_id(session_id).as_str(),
                "session to remove was not found"
            );
            return;
        };
        info!(
            event = events::SERVER_SESSION_LOST,
            component = COMPONENT,
            session_id = fields::format_session_id(session_id).as_str(),
            reason = error.kind(),
            "removing and disposing server connection"
        );
        if fail_inbound {
            connection.fail_inbound(error);
        }
        connection.dispose();
    }
}

struct BindingInner {
    subscription: MessageSubscription,
    connections: ConnectionMap,
    disposing: AtomicBool,
    dispose_requested: Notify,
    dispose_done: Notify,
    done: AtomicBool,
}

/// Handle to a bound server; disposing it tears down every session
/// concurrently, then the shared subscription.
#[derive(Clone)]
pub struct ServerBinding {
    inner: Arc<BindingInner>,
}

impl ServerBinding {
    fn new(subscription: MessageSubscription) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                subscription,
                connections: Arc::new(Mutex::new(HashMap::new())),
                disposing: AtomicBool::new(false),
                dispose_requested: Notify::new(),
                dispose_done: Notify::new(),
                done: AtomicBool::new(false),
            }),
        }
    }

    fn connections(&self) -> ConnectionMap {
        self.inner.connections.clone()
    }

    /// Number of live sessions.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    fn spawn_teardown(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.dispose_requested.notified().await;
            info!(
                event = events::SERVER_DISPOSING,
                component = COMPONENT,
                "server handler disposing"
            );

            let connections: Vec<Connection> = {
                let mut map = inner.connections.lock().await;
                map.drain().map(|(_, connection)| connection).collect()
            };
            for connection in &connections {
                connection.dispose();
            }
            join_all(connections.iter().map(|connection| connection.on_dispose())).await;

            inner.subscription.dispose();
            inner.done.store(true, Ordering::Release);
            inner.dispose_done.notify_waiters();
            debug!(component = COMPONENT, "server handler disposed");
        });
    }
}

#[async_trait]
impl OnDisposable for ServerBinding {
    fn dispose(&self) {
        if !self.inner.disposing.swap(true, Ordering::AcqRel) {
            self.inner.dispose_requested.notify_one();
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    async fn on_dispose(&self) {
        let mut notified = pin!(self.inner.dispose_done.notified());
        notified.as_mut().enable();
        if self.inner.done.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}
