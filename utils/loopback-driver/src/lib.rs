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

//! In-process media driver for `aeron-duplex`.
//!
//! Channels live in a registry keyed by (address, stream id), where the
//! address is a publication's target: the unicast endpoint, or the control
//! endpoint for MDC channels. Session ids are driver-assigned unless forced
//! through the channel URI. A subscription receives an image-available event
//! when a publication binds to it and image-unavailable when that
//! publication closes; frames flow only along announced images, through
//! bounded per-subscriber queues that exercise the back-pressure paths of
//! the library above.

use aeron_duplex::driver::{
    DriverPublication, DriverSubscription, FragmentHeader, ImageLifecycle, MediaDriver,
    OfferOutcome,
};
use aeron_duplex::{AeronError, ChannelUri};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 1376;
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

static DIRECTORY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tuning for an in-process driver instance.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    max_payload_length: usize,
    max_message_length: usize,
    subscriber_queue_capacity: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

impl LoopbackConfig {
    /// Largest fragment payload; the library fragments above this.
    pub fn with_max_payload_length(mut self, length: usize) -> Self {
        self.max_payload_length = length.max(1);
        self
    }

    pub fn with_max_message_length(mut self, length: usize) -> Self {
        self.max_message_length = length.max(1);
        self
    }

    /// Frames buffered per subscriber before offers see `BackPressured`.
    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(1);
        self
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    address: String,
    stream_id: i32,
}

struct Frame {
    header: FragmentHeader,
    payload: Bytes,
}

#[derive(Default)]
struct SubscriberQueue {
    frames: VecDeque<Frame>,
    images: VecDeque<ImageLifecycle>,
    /// Publication registrations whose image this subscriber has seen.
    announced: HashSet<u64>,
}

struct SubscriberState {
    id: u64,
    session_filter: Option<i32>,
    capacity: usize,
    closed: AtomicBool,
    queue: Mutex<SubscriberQueue>,
}

impl SubscriberState {
    fn accepts(&self, session_id: i32) -> bool {
        self.session_filter.map_or(true, |filter| filter == session_id)
    }

    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn announce(&self, publication: &PubRecord) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.announced.insert(publication.id) {
            queue.images.push_back(ImageLifecycle::Available {
                session_id: publication.session_id,
            });
        }
    }

    fn withdraw(&self, publication: &PubRecord) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.announced.remove(&publication.id) {
            queue.images.push_back(ImageLifecycle::Unavailable {
                session_id: publication.session_id,
            });
        }
    }

    fn has_announced(&self, publication_id: u64) -> bool {
        self.queue
            .lock()
            .expect("subscriber queue poisoned")
            .announced
            .contains(&publication_id)
    }
}

struct PubRecord {
    id: u64,
    session_id: i32,
    closed: AtomicBool,
}

#[derive(Default)]
struct ChannelRegistry {
    subscribers: Vec<Arc<SubscriberState>>,
    publications: Vec<Arc<PubRecord>>,
}

struct DriverInner {
    config: LoopbackConfig,
    channels: Mutex<HashMap<ChannelKey, ChannelRegistry>>,
    next_session_id: AtomicI32,
    next_registration: AtomicU64,
    directory: PathBuf,
    closed: AtomicBool,
}

impl DriverInner {
    fn announced_targets(
        &self,
        key: &ChannelKey,
        publication: &PubRecord,
    ) -> Vec<Arc<SubscriberState>> {
        let channels = self.channels.lock().expect("channel registry poisoned");
        let Some(registry) = channels.get(key) else {
            return Vec::new();
        };
        registry
            .subscribers
            .iter()
            .filter(|subscriber| {
                subscriber.is_live()
                    && subscriber.accepts(publication.session_id)
                    && subscriber.has_announced(publication.id)
            })
            .cloned()
            .collect()
    }

    fn close_publication(&self, key: &ChannelKey, publication: &PubRecord) {
        if publication.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        let Some(registry) = channels.get_mut(key) else {
            return;
        };
        for subscriber in &registry.subscribers {
            subscriber.withdraw(publication);
        }
        registry.publications.retain(|record| record.id != publication.id);
    }

    fn close_subscription(&self, key: &ChannelKey, state: &SubscriberState) {
        if state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        if let Some(registry) = channels.get_mut(key) {
            registry.subscribers.retain(|subscriber| subscriber.id != state.id);
        }
    }
}

/// An embedded, in-process media driver.
pub struct LoopbackDriver {
    inner: Arc<DriverInner>,
}

impl LoopbackDriver {
    /// Launches a driver with default tuning and a fresh driver directory
    /// under the system temp dir.
    pub fn launch() -> Result<Self, AeronError> {
        Self::launch_with(LoopbackConfig::default())
    }

    pub fn launch_with(config: LoopbackConfig) -> Result<Self, AeronError> {
        let directory = std::env::temp_dir().join(format!(
            "aeron-loopback-{}-{}",
            std::process::id(),
            DIRECTORY_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&directory)
            .map_err(|err| AeronError::Driver(format!("failed to create driver directory: {err}")))?;
        std::fs::write(directory.join("cnc.dat"), [])
            .map_err(|err| AeronError::Driver(format!("failed to seed driver directory: {err}")))?;
        debug!(directory = %directory.display(), "loopback driver launched");

        Ok(Self {
            inner: Arc::new(DriverInner {
                config,
                channels: Mutex::new(HashMap::new()),
                next_session_id: AtomicI32::new(1),
                next_registration: AtomicU64::new(1),
                directory,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn channel_key(channel: &ChannelUri, stream_id: i32) -> Result<ChannelKey, AeronError> {
        let address = channel.target_address().ok_or_else(|| {
            AeronError::InvalidChannel(format!(
                "channel {channel} carries neither an endpoint nor a control address"
            ))
        })?;
        Ok(ChannelKey {
            address: address.to_string(),
            stream_id,
        })
    }
}

impl MediaDriver for LoopbackDriver {
    fn add_publication(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
    ) -> Result<Box<dyn DriverPublication>, AeronError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AeronError::Driver("driver is closed".to_string()));
        }
        let key = Self::channel_key(channel, stream_id)?;
        let session_id = channel
            .session_id()
            .unwrap_or_else(|| self.inner.next_session_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(PubRecord {
            id: self.inner.next_registration.fetch_add(1, Ordering::Relaxed),
            session_id,
            closed: AtomicBool::new(false),
        });

        let mut channels = self.inner.channels.lock().expect("channel registry poisoned");
        let registry = channels.entry(key.clone()).or_default();
        registry.publications.push(record.clone());
        for subscriber in &registry.subscribers {
            if subscriber.is_live() && subscriber.accepts(session_id) {
                subscriber.announce(&record);
            }
        }
        drop(channels);

        Ok(Box::new(LoopbackPublication {
            inner: self.inner.clone(),
            key,
            record,
            position: 0,
        }))
    }

    fn add_subscription(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
    ) -> Result<Box<dyn DriverSubscription>, AeronError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AeronError::Driver("driver is closed".to_string()));
        }
        let key = Self::channel_key(channel, stream_id)?;
        let state = Arc::new(SubscriberState {
            id: self.inner.next_registration.fetch_add(1, Ordering::Relaxed),
            session_filter: channel.session_id(),
            capacity: self.inner.config.subscriber_queue_capacity,
            closed: AtomicBool::new(false),
            queue: Mutex::new(SubscriberQueue::default()),
        });

        let mut channels = self.inner.channels.lock().expect("channel registry poisoned");
        let registry = channels.entry(key.clone()).or_default();

        // a session already imaged at a sibling subscriber with the same
        // filter stays there; the rendezvous is one image per session
        let contested: HashSet<i32> = registry
            .subscribers
            .iter()
            .filter(|other| other.is_live() && other.session_filter == state.session_filter)
            .flat_map(|other| other.session_filter)
            .collect();
        for publication in &registry.publications {
            if publication.closed.load(Ordering::Acquire) {
                continue;
            }
            if !state.accepts(publication.session_id) {
                continue;
            }
            if contested.contains(&publication.session_id) {
                continue;
            }
            state.announce(publication);
        }
        registry.subscribers.push(state.clone());
        drop(channels);

        Ok(Box::new(LoopbackSubscription {
            inner: self.inner.clone(),
            key,
            state,
        }))
    }

    fn directory(&self) -> Option<PathBuf> {
        Some(self.inner.directory.clone())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct LoopbackPublication {
    inner: Arc<DriverInner>,
    key: ChannelKey,
    record: Arc<PubRecord>,
    position: i64,
}

impl DriverPublication for LoopbackPublication {
    fn session_id(&self) -> i32 {
        self.record.session_id
    }

    fn is_connected(&self) -> bool {
        !self.record.closed.load(Ordering::Acquire)
            && !self.inner.announced_targets(&self.key, &self.record).is_empty()
    }

    fn max_payload_length(&self) -> usize {
        self.inner.config.max_payload_length
    }

    fn max_message_length(&self) -> usize {
        self.inner.config.max_message_length
    }

    fn offer(&mut self, flags: u8, payload: &[u8]) -> OfferOutcome {
        if self.record.closed.load(Ordering::Acquire) || self.inner.closed.load(Ordering::Acquire)
        {
            return OfferOutcome::Closed;
        }
        let targets = self.inner.announced_targets(&self.key, &self.record);
        if targets.is_empty() {
            return OfferOutcome::NotConnected;
        }
        for target in &targets {
            let queue = target.queue.lock().expect("subscriber queue poisoned");
            if queue.frames.len() >= target.capacity {
                return OfferOutcome::BackPressured;
            }
        }

        let header = FragmentHeader {
            session_id: self.record.session_id,
            stream_id: self.key.stream_id,
            flags,
        };
        let payload = Bytes::copy_from_slice(payload);
        for target in targets {
            let mut queue = target.queue.lock().expect("subscriber queue poisoned");
            queue.frames.push_back(Frame {
                header,
                payload: payload.clone(),
            });
        }
        self.position += payload.len() as i64;
        OfferOutcome::Position(self.position)
    }

    fn close(&mut self) {
        self.inner.close_publication(&self.key, &self.record);
    }
}

impl Drop for LoopbackPublication {
    fn drop(&mut self) {
        self.inner.close_publication(&self.key, &self.record);
    }
}

struct LoopbackSubscription {
    inner: Arc<DriverInner>,
    key: ChannelKey,
    state: Arc<SubscriberState>,
}

impl DriverSubscription for LoopbackSubscription {
    fn poll(
        &mut self,
        on_fragment: &mut dyn FnMut(FragmentHeader, &[u8]),
        fragment_limit: usize,
    ) -> usize {
        let mut consumed = 0;
        while consumed < fragment_limit {
            let frame = {
                let mut queue = self.state.queue.lock().expect("subscriber queue poisoned");
                queue.frames.pop_front()
            };
            let Some(frame) = frame else {
                break;
            };
            on_fragment(frame.header, &frame.payload);
            consumed += 1;
        }
        consumed
    }

    fn poll_images(&mut self, on_image: &mut dyn FnMut(ImageLifecycle)) -> usize {
        let mut delivered = 0;
        loop {
            let image = {
                let mut queue = self.state.queue.lock().expect("subscriber queue poisoned");
                queue.images.pop_front()
            };
            let Some(image) = image else {
                break;
            };
            on_image(image);
            delivered += 1;
        }
        delivered
    }

    fn close(&mut self) {
        self.inner.close_subscription(&self.key, &self.state);
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        self.inner.close_subscription(&self.key, &self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::{LoopbackConfig, LoopbackDriver};
    use aeron_duplex::driver::{frame_flags, ImageLifecycle, MediaDriver, OfferOutcome};
    use aeron_duplex::ChannelUri;

    fn endpoint(address: &str) -> ChannelUri {
        ChannelUri::udp().with_endpoint(address)
    }

    fn mdc(control: &str, session_id: i32) -> ChannelUri {
        ChannelUri::udp()
            .with_control(control)
            .with_dynamic_control_mode()
            .with_session_id(session_id)
    }

    #[test]
    fn publication_connects_and_delivers_once_a_subscriber_exists() {
        let driver = LoopbackDriver::launch().unwrap();
        let mut publication = driver.add_publication(&endpoint("host:1"), 1).unwrap();
        assert!(!publication.is_connected());
        assert_eq!(
            publication.offer(frame_flags::UNFRAGMENTED, b"early"),
            OfferOutcome::NotConnected
        );

        let mut subscription = driver.add_subscription(&endpoint("host:1"), 1).unwrap();
        assert!(publication.is_connected());
        assert!(matches!(
            publication.offer(frame_flags::UNFRAGMENTED, b"hello"),
            OfferOutcome::Position(_)
        ));

        let mut images = Vec::new();
        subscription.poll_images(&mut |image| images.push(image));
        assert_eq!(
            images,
            vec![ImageLifecycle::Available {
                session_id: publication.session_id()
            }]
        );

        let mut received = Vec::new();
        let polled = subscription.poll(
            &mut |header, data| received.push((header.session_id, data.to_vec())),
            8,
        );
        assert_eq!(polled, 1);
        assert_eq!(
            received,
            vec![(publication.session_id(), b"hello".to_vec())]
        );
    }

    #[test]
    fn session_ids_are_driver_assigned_unless_forced() {
        let driver = LoopbackDriver::launch().unwrap();
        let first = driver.add_publication(&endpoint("host:1"), 1).unwrap();
        let second = driver.add_publication(&endpoint("host:1"), 1).unwrap();
        assert_ne!(first.session_id(), second.session_id());

        let forced = driver
            .add_publication(&endpoint("host:1").with_session_id(77), 1)
            .unwrap();
        assert_eq!(forced.session_id(), 77);
    }

    #[test]
    fn mdc_subscriber_only_images_its_own_session() {
        let driver = LoopbackDriver::launch().unwrap();
        let mut own = driver.add_publication(&mdc("ctrl:9", 5), 1).unwrap();
        let mut other = driver.add_publication(&mdc("ctrl:9", 6), 1).unwrap();
        let mut subscription = driver.add_subscription(&mdc("ctrl:9", 5), 1).unwrap();

        assert!(own.is_connected());
        assert!(!other.is_connected());
        assert!(matches!(
            own.offer(frame_flags::UNFRAGMENTED, b"mine"),
            OfferOutcome::Position(_)
        ));
        assert_eq!(
            other.offer(frame_flags::UNFRAGMENTED, b"not mine"),
            OfferOutcome::NotConnected
        );

        let mut sessions = Vec::new();
        subscription.poll(&mut |header, _| sessions.push(header.session_id), 8);
        assert_eq!(sessions, vec![5]);
    }

    #[test]
    fn an_imaged_session_is_not_reannounced_to_a_competing_subscriber() {
        let driver = LoopbackDriver::launch().unwrap();
        let mut first_sub = driver.add_subscription(&mdc("ctrl:9", 5), 1).unwrap();
        let _publication = driver.add_publication(&mdc("ctrl:9", 5), 1).unwrap();
        let mut second_sub = driver.add_subscription(&mdc("ctrl:9", 5), 1).unwrap();

        let mut first_images = 0;
        first_sub.poll_images(&mut |_| first_images += 1);
        let mut second_images = 0;
        second_sub.poll_images(&mut |_| second_images += 1);

        assert_eq!(first_images, 1);
        assert_eq!(second_images, 0);
    }

    #[test]
    fn closing_a_publication_delivers_image_unavailable() {
        let driver = LoopbackDriver::launch().unwrap();
        let mut subscription = driver.add_subscription(&endpoint("host:1"), 1).unwrap();
        let mut publication = driver.add_publication(&endpoint("host:1"), 1).unwrap();
        let session_id = publication.session_id();
        subscription.poll_images(&mut |_| {});

        publication.close();

        let mut images = Vec::new();
        subscription.poll_images(&mut |image| images.push(image));
        assert_eq!(images, vec![ImageLifecycle::Unavailable { session_id }]);
    }

    #[test]
    fn full_subscriber_queue_back_pressures_offers() {
        let driver =
            LoopbackDriver::launch_with(LoopbackConfig::default().with_subscriber_queue_capacity(2))
                .unwrap();
        let _subscription = driver.add_subscription(&endpoint("host:1"), 1).unwrap();
        let mut publication = driver.add_publication(&endpoint("host:1"), 1).unwrap();

        assert!(matches!(
            publication.offer(frame_flags::UNFRAGMENTED, b"1"),
            OfferOutcome::Position(_)
        ));
        assert!(matches!(
            publication.offer(frame_flags::UNFRAGMENTED, b"2"),
            OfferOutcome::Position(_)
        ));
        assert_eq!(
            publication.offer(frame_flags::UNFRAGMENTED, b"3"),
            OfferOutcome::BackPressured
        );
    }

    #[test]
    fn driver_directory_exists_until_deleted_by_the_owner() {
        let driver = LoopbackDriver::launch().unwrap();
        let directory = driver.directory().unwrap();

        assert!(directory.join("cnc.dat").is_file());
        std::fs::remove_dir_all(&directory).unwrap();
        assert!(!directory.exists());
    }
}
