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

use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PUBLICATION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IMAGE_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 128;
const DEFAULT_FRAGMENT_LIMIT: usize = 8;
const DEFAULT_SENDS_PER_TICK: usize = 8;
const DEFAULT_SESSION_RETRY_LIMIT: usize = 3;
const DEFAULT_SERVER_STREAM_ID: i32 = 1;
const DEFAULT_CLIENT_STREAM_ID: i32 = 1001;

/// Per-connector tuning: timeouts, queue capacities, stream ids.
///
/// All setters consume `self`, so options read as a chain:
///
/// ```
/// use std::time::Duration;
/// use aeron_duplex::AeronOptions;
///
/// let options = AeronOptions::default()
///     .with_connect_timeout(Duration::from_secs(1))
///     .with_send_queue_capacity(64);
///
/// assert_eq!(options.connect_timeout(), Duration::from_secs(1));
/// assert_eq!(options.fragment_limit(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct AeronOptions {
    connect_timeout: Duration,
    publication_timeout: Duration,
    backpressure_timeout: Duration,
    image_liveness_timeout: Duration,
    send_queue_capacity: usize,
    fragment_limit: usize,
    mtu_length: Option<usize>,
    sends_per_tick: usize,
    session_retry_limit: usize,
    server_stream_id: i32,
    client_stream_id: i32,
}

impl Default for AeronOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publication_timeout: DEFAULT_PUBLICATION_TIMEOUT,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            image_liveness_timeout: DEFAULT_IMAGE_LIVENESS_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            fragment_limit: DEFAULT_FRAGMENT_LIMIT,
            mtu_length: None,
            sends_per_tick: DEFAULT_SENDS_PER_TICK,
            session_retry_limit: DEFAULT_SESSION_RETRY_LIMIT,
            server_stream_id: DEFAULT_SERVER_STREAM_ID,
            client_stream_id: DEFAULT_CLIENT_STREAM_ID,
        }
    }
}

impl AeronOptions {
    /// How long `ensure_connected` (and the client rendezvous) may wait.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long the oldest pending item may sit in the send queue.
    pub fn with_publication_timeout(mut self, timeout: Duration) -> Self {
        self.publication_timeout = timeout;
        self
    }

    /// How long a single offer may be retried on BACK_PRESSURED.
    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    /// Transport-level image liveness window, also the bound on how late an
    /// image-unavailable driven disposal may run.
    pub fn with_image_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.image_liveness_timeout = timeout;
        self
    }

    /// Capacity of a publication's send queue and of each session's inbound
    /// buffer.
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    /// Fragments consumed per subscription poll call.
    pub fn with_fragment_limit(mut self, limit: usize) -> Self {
        self.fragment_limit = limit.max(1);
        self
    }

    /// Fragmentation threshold override; defaults to the driver's value.
    pub fn with_mtu_length(mut self, mtu_length: usize) -> Self {
        self.mtu_length = Some(mtu_length);
        self
    }

    /// Send requests served per publication per event-loop tick.
    pub fn with_sends_per_tick(mut self, sends_per_tick: usize) -> Self {
        self.sends_per_tick = sends_per_tick.max(1);
        self
    }

    /// How many times the client connector retries the rendezvous with a
    /// fresh publication when a session-id collision is suspected.
    pub fn with_session_retry_limit(mut self, limit: usize) -> Self {
        self.session_retry_limit = limit;
        self
    }

    pub fn with_server_stream_id(mut self, stream_id: i32) -> Self {
        self.server_stream_id = stream_id;
        self
    }

    pub fn with_client_stream_id(mut self, stream_id: i32) -> Self {
        self.client_stream_id = stream_id;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn publication_timeout(&self) -> Duration {
        self.publication_timeout
    }

    pub fn backpressure_timeout(&self) -> Duration {
        self.backpressure_timeout
    }

    pub fn image_liveness_timeout(&self) -> Duration {
        self.image_liveness_timeout
    }

    pub fn send_queue_capacity(&self) -> usize {
        self.send_queue_capacity
    }

    pub fn fragment_limit(&self) -> usize {
        self.fragment_limit
    }

    pub fn mtu_length(&self) -> Option<usize> {
        self.mtu_length
    }

    pub fn sends_per_tick(&self) -> usize {
        self.sends_per_tick
    }

    pub fn session_retry_limit(&self) -> usize {
        self.session_retry_limit
    }

    pub fn server_stream_id(&self) -> i32 {
        self.server_stream_id
    }

    pub fn client_stream_id(&self) -> i32 {
        self.client_stream_id
    }
}

const DEFAULT_EVENT_LOOP_COUNT: usize = 1;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-level resource tuning: event loops and teardown patience.
#[derive(Debug, Clone)]
pub struct ResourcesConfig {
    event_loop_count: usize,
    shutdown_timeout: Duration,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            event_loop_count: DEFAULT_EVENT_LOOP_COUNT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ResourcesConfig {
    /// Number of polling event loops; publications and subscriptions are
    /// pinned to one loop by channel hash.
    pub fn with_event_loop_count(mut self, count: usize) -> Self {
        self.event_loop_count = count.max(1);
        self
    }

    /// Bound on waiting for event loops to drain and terminate at dispose.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn event_loop_count(&self) -> usize {
        self.event_loop_count
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}
