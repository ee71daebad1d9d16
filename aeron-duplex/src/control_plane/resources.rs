//! Process-wide owner of the driver, the event loops and the cached
//! publication/subscription handles.

use crate::channel_uri::ChannelUri;
use crate::control_plane::delete_driver_directory;
use crate::data_plane::publication::{
    MessagePublication, PublicationSettings, PublicationShared,
};
use crate::data_plane::subscription::{InboundRoute, MessageSubscription, SessionEvent};
use crate::driver::MediaDriver;
use crate::error::AeronError;
use crate::observability::events;
use crate::options::{AeronOptions, ResourcesConfig};
use crate::runtime::commands::{AddPublication, AddSubscription, Command};
use crate::runtime::event_loop::{spawn_event_loop, EventLoopHandle};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const COMPONENT: &str = "resources";

type CacheKey = (String, i32);

struct CacheSlot {
    ref_count: usize,
    publication: MessagePublication,
    seq: u64,
}

pub(crate) enum CacheOutcome {
    Inserted(MessagePublication),
    Joined {
        winner: MessagePublication,
        loser_id: u64,
    },
}

/// Refcounted registry making publications idempotent by (channel, stream).
pub(crate) struct PublicationCache {
    slots: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl PublicationCache {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn key(channel: &ChannelUri, stream_id: i32) -> CacheKey {
        (channel.to_string(), stream_id)
    }

    fn acquire(&self, channel: &ChannelUri, stream_id: i32) -> Option<MessagePublication> {
        let mut slots = self.slots.lock().expect("publication cache poisoned");
        let slot = slots.get_mut(&Self::key(channel, stream_id))?;
        slot.ref_count += 1;
        Some(slot.publication.with_fresh_lease())
    }

    /// Publishes a freshly created handle into the cache, or joins the slot a
    /// concurrent creator won; the loser's registration id is handed back so
    /// the duplicate driver resource can be removed.
    fn insert_or_join(&self, publication: MessagePublication, seq: u64) -> CacheOutcome {
        let key = Self::key(publication.channel(), publication.stream_id());
        let mut slots = self.slots.lock().expect("publication cache poisoned");
        match slots.get_mut(&key) {
            Some(slot) => {
                slot.ref_count += 1;
                CacheOutcome::Joined {
                    winner: slot.publication.with_fresh_lease(),
                    loser_id: publication.registration_id(),
                }
            }
            None => {
                slots.insert(
                    key,
                    CacheSlot {
                        ref_count: 1,
                        publication: publication.clone(),
                        seq,
                    },
                );
                CacheOutcome::Inserted(publication)
            }
        }
    }

    /// Drops one reference. Returns `true` when the slot is gone and the
    /// loop-side resource should be removed.
    pub(crate) fn release(&self, channel: &ChannelUri, stream_id: i32) -> bool {
        let mut slots = self.slots.lock().expect("publication cache poisoned");
        let key = Self::key(channel, stream_id);
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return false;
        }
        slots.remove(&key);
        true
    }

    fn drain(&self) -> Vec<(u64, MessagePublication)> {
        let mut slots = self.slots.lock().expect("publication cache poisoned");
        slots
            .drain()
            .map(|(_, slot)| (slot.seq, slot.publication))
            .collect()
    }
}

struct ResourcesInner {
    driver: Arc<dyn MediaDriver>,
    loop_senders: Vec<mpsc::UnboundedSender<Command>>,
    loops: Mutex<Vec<EventLoopHandle>>,
    publication_cache: Arc<PublicationCache>,
    exclusive_publications: Mutex<Vec<(u64, MessagePublication)>>,
    subscriptions: Mutex<Vec<(u64, MessageSubscription)>>,
    next_registration: AtomicU64,
    disposed: AtomicBool,
    shutdown_timeout: Duration,
}

/// Owner of everything with a lifecycle: the driver, the polling event
/// loops, and the cached publications and subscriptions.
///
/// Publications and subscriptions stay pinned to one event loop for their
/// whole life; every driver interaction happens on that loop, reached
/// through its command queue.
#[derive(Clone)]
pub struct AeronResources {
    inner: Arc<ResourcesInner>,
}

impl AeronResources {
    /// Spawns the event loops over the given driver. The driver may be an
    /// embedded one (see `DriverManager`) or externally managed; disposal
    /// closes it and deletes its directory either way.
    pub fn start(
        driver: Arc<dyn MediaDriver>,
        config: ResourcesConfig,
    ) -> Result<Self, AeronError> {
        let mut loops = Vec::with_capacity(config.event_loop_count());
        for index in 0..config.event_loop_count() {
            loops.push(spawn_event_loop(
                index,
                driver.clone(),
                config.shutdown_timeout(),
            )?);
        }
        let loop_senders = loops.iter().map(|handle| handle.sender()).collect();

        info!(
            event = events::RESOURCES_STARTED,
            component = COMPONENT,
            event_loops = config.event_loop_count(),
            "resources started"
        );
        Ok(Self {
            inner: Arc::new(ResourcesInner {
                driver,
                loop_senders,
                loops: Mutex::new(loops),
                publication_cache: Arc::new(PublicationCache::new()),
                exclusive_publications: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                next_registration: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                shutdown_timeout: config.shutdown_timeout(),
            }),
        })
    }

    fn ensure_open(&self) -> Result<(), AeronError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(AeronError::Cancelled("resources disposed".to_string()));
        }
        Ok(())
    }

    fn loop_for(&self, channel: &ChannelUri) -> mpsc::UnboundedSender<Command> {
        let mut hasher = DefaultHasher::new();
        channel.to_string().hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.inner.loop_senders.len();
        self.inner.loop_senders[index].clone()
    }

    /// Returns a publication for (channel, stream), creating it on its
    /// pinned event loop or handing out another lease on a cached one. The
    /// returned future completes once the driver has produced a valid
    /// handle.
    pub async fn publication(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
        options: &AeronOptions,
    ) -> Result<MessagePublication, AeronError> {
        self.ensure_open()?;
        if let Some(existing) = self.inner.publication_cache.acquire(channel, stream_id) {
            return Ok(existing);
        }

        let cache = self.inner.publication_cache.clone();
        let publication = self
            .create_publication(channel, stream_id, options, Some(cache.clone()))
            .await?;
        let seq = publication.registration_id();
        match cache.insert_or_join(publication, seq) {
            CacheOutcome::Inserted(publication) => Ok(publication),
            CacheOutcome::Joined { winner, loser_id } => {
                let _ = self
                    .loop_for(channel)
                    .send(Command::RemovePublication { id: loser_id });
                Ok(winner)
            }
        }
    }

    /// Creates a publication outside the cache: every call gets its own
    /// driver resource and with it a fresh session id. This is what a
    /// connector wanting a session of its own uses.
    pub async fn exclusive_publication(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
        options: &AeronOptions,
    ) -> Result<MessagePublication, AeronError> {
        self.ensure_open()?;
        let publication = self
            .create_publication(channel, stream_id, options, None)
            .await?;
        self.inner
            .exclusive_publications
            .lock()
            .expect("exclusive publication registry poisoned")
            .push((publication.registration_id(), publication.clone()));
        Ok(publication)
    }

    async fn create_publication(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
        options: &AeronOptions,
        cache: Option<Arc<PublicationCache>>,
    ) -> Result<MessagePublication, AeronError> {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        let loop_tx = self.loop_for(channel);
        let shared = PublicationShared::new();
        let (queue_tx, queue_rx) = mpsc::channel(options.send_queue_capacity());
        let settings = PublicationSettings {
            connect_timeout: options.connect_timeout(),
            publication_timeout: options.publication_timeout(),
            backpressure_timeout: options.backpressure_timeout(),
            sends_per_tick: options.sends_per_tick(),
            mtu_override: options.mtu_length(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        loop_tx
            .send(Command::AddPublication(AddPublication {
                id,
                channel: channel.clone(),
                stream_id,
                queue: queue_rx,
                shared: shared.clone(),
                settings,
                reply: reply_tx,
            }))
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))??;

        Ok(MessagePublication::new(
            id,
            channel.clone(),
            stream_id,
            queue_tx,
            shared,
            loop_tx,
            cache,
            options.connect_timeout(),
        ))
    }

    /// Adds a subscription on its pinned event loop. The returned future
    /// completes as soon as the handle is registered with the loop, not when
    /// an image appears; session lifecycle arrives on `events`.
    pub async fn subscription(
        &self,
        channel: &ChannelUri,
        stream_id: i32,
        route: InboundRoute,
        events: mpsc::UnboundedSender<SessionEvent>,
        options: &AeronOptions,
    ) -> Result<MessageSubscription, AeronError> {
        self.ensure_open()?;

        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        let loop_tx = self.loop_for(channel);
        let (reply_tx, reply_rx) = oneshot::channel();
        loop_tx
            .send(Command::AddSubscription(AddSubscription {
                id,
                channel: channel.clone(),
                stream_id,
                route,
                events,
                fragment_limit: options.fragment_limit(),
                reply: reply_tx,
            }))
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AeronError::Cancelled("event loop stopped".to_string()))??;

        let subscription = MessageSubscription::new(id, channel.clone(), stream_id, loop_tx);
        self.inner
            .subscriptions
            .lock()
            .expect("subscription registry poisoned")
            .push((id, subscription.clone()));
        Ok(subscription)
    }

    /// Stops accepting work, disposes cached resources in LIFO order, stops
    /// the event loops and awaits their termination within the shutdown
    /// timeout, then closes the driver and deletes its directory. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            event = events::RESOURCES_DISPOSING,
            component = COMPONENT,
            "resources disposing"
        );

        enum Cached {
            Publication(MessagePublication),
            Subscription(MessageSubscription),
        }

        let mut cached: Vec<(u64, Cached)> = Vec::new();
        for (seq, publication) in self.inner.publication_cache.drain() {
            cached.push((seq, Cached::Publication(publication)));
        }
        {
            let mut exclusives = self
                .inner
                .exclusive_publications
                .lock()
                .expect("exclusive publication registry poisoned");
            for (seq, publication) in exclusives.drain(..) {
                cached.push((seq, Cached::Publication(publication)));
            }
        }
        {
            let mut subscriptions = self
                .inner
                .subscriptions
                .lock()
                .expect("subscription registry poisoned");
            for (seq, subscription) in subscriptions.drain(..) {
                cached.push((seq, Cached::Subscription(subscription)));
            }
        }
        cached.sort_by(|(left, _), (right, _)| right.cmp(left));
        for (_, resource) in cached {
            match resource {
                Cached::Publication(publication) => publication.force_remove(),
                Cached::Subscription(subscription) => subscription.dispose(),
            }
        }

        for sender in &self.inner.loop_senders {
            let _ = sender.send(Command::Stop);
        }
        let handles = {
            let mut loops = self.inner.loops.lock().expect("loop registry poisoned");
            std::mem::take(&mut *loops)
        };
        for mut handle in handles {
            let Some(join) = handle.take_join() else {
                continue;
            };
            let waited = tokio::time::timeout(
                self.inner.shutdown_timeout,
                tokio::task::spawn_blocking(move || {
                    let _ = join.join();
                }),
            )
            .await;
            if waited.is_err() {
                warn!(
                    component = COMPONENT,
                    loop_thread = handle.thread_name(),
                    "event loop did not terminate within the shutdown timeout"
                );
            }
        }

        self.inner.driver.close();
        if let Some(directory) = self.inner.driver.directory() {
            delete_driver_directory(&directory);
        }
        info!(
            event = events::RESOURCES_DISPOSED,
            component = COMPONENT,
            "resources disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheOutcome, PublicationCache};
    use crate::channel_uri::ChannelUri;
    use crate::data_plane::publication::{MessagePublication, PublicationShared};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_publication(cache: &Arc<PublicationCache>, id: u64) -> MessagePublication {
        let (queue_tx, _queue_rx) = mpsc::channel(4);
        let (loop_tx, _loop_rx) = mpsc::unbounded_channel();
        MessagePublication::new(
            id,
            ChannelUri::udp().with_endpoint("cache:1"),
            7,
            queue_tx,
            PublicationShared::new(),
            loop_tx,
            Some(cache.clone()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn acquire_misses_until_inserted_then_counts_references() {
        let cache = Arc::new(PublicationCache::new());
        let channel = ChannelUri::udp().with_endpoint("cache:1");

        assert!(cache.acquire(&channel, 7).is_none());

        let publication = test_publication(&cache, 1);
        assert!(matches!(
            cache.insert_or_join(publication, 1),
            CacheOutcome::Inserted(_)
        ));
        assert!(cache.acquire(&channel, 7).is_some());
        assert!(cache.acquire(&channel, 99).is_none());

        // two references now: the insert and the successful acquire
        assert!(!cache.release(&channel, 7));
        assert!(cache.release(&channel, 7));
        assert!(!cache.release(&channel, 7));
        assert!(cache.acquire(&channel, 7).is_none());
    }

    #[test]
    fn concurrent_creation_joins_the_winner() {
        let cache = Arc::new(PublicationCache::new());
        let winner = test_publication(&cache, 1);
        let loser = test_publication(&cache, 2);

        assert!(matches!(
            cache.insert_or_join(winner, 1),
            CacheOutcome::Inserted(_)
        ));
        match cache.insert_or_join(loser, 2) {
            CacheOutcome::Joined { loser_id, .. } => assert_eq!(loser_id, 2),
            CacheOutcome::Inserted(_) => panic!("expected join"),
        }
    }
}
