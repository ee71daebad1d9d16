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

//! Full-duplex client connector. Schematically:
//!
//! ```text
//! Client
//! serverPort        -> outbound -> Pub(endpoint, sessionId)
//! serverControlPort -> inbound  -> MDC(sessionId) -> Sub(control-endpoint, sessionId)
//! ```

use crate::channel_uri::ChannelUri;
use crate::connection::{Connection, ConnectionHandler, Inbound, Outbound};
use crate::control_plane::resources::AeronResources;
use crate::data_plane::subscription::{InboundRoute, SessionEvent};
use crate::error::AeronError;
use crate::observability::{events, fields};
use crate::options::AeronOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const COMPONENT: &str = "client";

enum Attempt {
    Done(Connection),
    /// The rendezvous image never arrived; a fresh publication gets a fresh
    /// session id, so this is worth retrying.
    Retry(AeronError),
    Fail(AeronError),
}

/// Connects one outbound publication and one inbound MDC subscription into a
/// full-duplex [`Connection`], using the publication's session id as the
/// rendezvous token.
///
/// The outbound URI addresses the server's endpoint; the inbound URI is a
/// template addressing the server's control endpoint, qualified per
/// connection with the session id the driver assigns.
pub struct AeronClient {
    resources: AeronResources,
    options: AeronOptions,
    outbound_uri: Option<ChannelUri>,
    inbound_uri: Option<ChannelUri>,
    handler: Option<Arc<dyn ConnectionHandler>>,
}

impl AeronClient {
    pub fn create(resources: AeronResources) -> Self {
        Self {
            resources,
            options: AeronOptions::default(),
            outbound_uri: None,
            inbound_uri: None,
            handler: None,
        }
    }

    pub fn options(mut self, options: AeronOptions) -> Self {
        self.options = options;
        self
    }

    /// The server's data endpoint the client publishes to.
    pub fn outbound_uri(mut self, uri: ChannelUri) -> Self {
        self.outbound_uri = Some(uri);
        self
    }

    /// Template for the inbound channel: the server's MDC control endpoint,
    /// qualified with the session id once known.
    pub fn inbound_uri(mut self, uri: ChannelUri) -> Self {
        self.inbound_uri = Some(uri);
        self
    }

    pub fn handle(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Establishes the connection, retrying the rendezvous with a fresh
    /// publication (fresh session id) when the server never materializes the
    /// reverse image, the symptom of a session-id collision.
    pub async fn connect(&self) -> Result<Connection, AeronError> {
        let outbound_uri = self
            .outbound_uri
            .clone()
            .ok_or_else(|| AeronError::InvalidChannel("client outbound URI not set".to_string()))?;
        let inbound_uri = self
            .inbound_uri
            .clone()
            .ok_or_else(|| AeronError::InvalidChannel("client inbound URI not set".to_string()))?;

        let mut attempt = 0;
        loop {
            match self.try_connect(&outbound_uri, &inbound_uri).await {
                Attempt::Done(connection) => return Ok(connection),
                Attempt::Fail(err) => {
                    warn!(
                        event = events::CLIENT_CONNECT_FAILED,
                        component = COMPONENT,
                        err = %err,
                        "client connect failed"
                    );
                    return Err(err);
                }
                Attempt::Retry(err) => {
                    attempt += 1;
                    if attempt > self.options.session_retry_limit() {
                        warn!(
                            event = events::CLIENT_CONNECT_FAILED,
                            component = COMPONENT,
                            attempts = attempt,
                            err = %err,
                            "client connect failed after rendezvous retries"
                        );
                        return Err(err);
                    }
                    warn!(
                        event = events::CLIENT_RENDEZVOUS_RETRY,
                        component = COMPONENT,
                        attempt,
                        err = %err,
                        "rendezvous did not complete, retrying with a fresh session id"
                    );
                }
            }
        }
    }

    async fn try_connect(&self, outbound_uri: &ChannelUri, inbound_uri: &ChannelUri) -> Attempt {
        let publication = match self
            .resources
            .exclusive_publication(outbound_uri, self.options.server_stream_id(), &self.options)
            .await
        {
            Ok(publication) => publication,
            Err(err) => return Attempt::Fail(err),
        };
        if let Err(err) = publication.ensure_connected().await {
            publication.dispose();
            return Attempt::Fail(err);
        }

        let session_id = publication.session_id();
        let inbound_channel = inbound_uri.clone().with_session_id(session_id);
        debug!(
            event = events::CLIENT_CONNECTING,
            component = COMPONENT,
            session_id = fields::format_session_id(session_id).as_str(),
            channel = fields::format_channel(&inbound_channel).as_str(),
            "creating client connection"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (sink, inbound) = Inbound::channel(self.options.send_queue_capacity());
        let subscription = match self
            .resources
            .subscription(
                &inbound_channel,
                self.options.client_stream_id(),
                InboundRoute::Single(sink),
                events_tx,
                &self.options,
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    err = %err,
                    "failed to create client inbound"
                );
                publication.dispose();
                return Attempt::Fail(err);
            }
        };

        let image_arrived = tokio::time::timeout(self.options.connect_timeout(), async {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, SessionEvent::Available { .. }) {
                    return true;
                }
            }
            false
        })
        .await;
        match image_arrived {
            Ok(true) => {}
            Ok(false) => {
                subscription.dispose();
                publication.dispose();
                return Attempt::Fail(AeronError::Cancelled(
                    "client inbound closed before an image arrived".to_string(),
                ));
            }
            Err(_) => {
                subscription.dispose();
                publication.dispose();
                return Attempt::Retry(AeronError::NotConnected(format!(
                    "no inbound image on {} within {:?}",
                    inbound_channel,
                    self.options.connect_timeout()
                )));
            }
        }

        let cleanup_subscription = subscription.clone();
        let connection = Connection::new(
            session_id,
            inbound,
            Outbound::new(publication),
            move || cleanup_subscription.dispose(),
        );

        // image-unavailable drives disposal for the life of the connection
        let watched = connection.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let SessionEvent::Unavailable { session_id } = event {
                    watched.fail_inbound(AeronError::ImageLost { session_id });
                    watched.dispose();
                    break;
                }
            }
        });

        connection.activate(self.handler.clone());
        info!(
            event = events::CLIENT_CONNECTED,
            component = COMPONENT,
            session_id = fields::format_session_id(session_id).as_str(),
            channel = fields::format_channel(&inbound_channel).as_str(),
            "created client connection"
        );
        Attempt::Done(connection)
    }
}
