//! Single-threaded cooperative event loops.
//!
//! Each loop is a dedicated OS thread running a current-thread tokio runtime.
//! Per tick it drains its command queue, polls its subscriptions, steps its
//! publications' send queues and idles with backoff. The loop never blocks on
//! I/O and never runs user code beyond non-blocking sink delivery.

use crate::data_plane::publication::{PublicationState, StepVerdict};
use crate::data_plane::subscription::SubscriptionState;
use crate::driver::MediaDriver;
use crate::error::AeronError;
use crate::observability::{events, fields};
use crate::runtime::commands::Command;
use crate::runtime::idle::BackoffIdle;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const COMPONENT: &str = "event_loop";

const LOOP_THREAD_NAME_PREFIX: &str = "aeron-loop-";
// Linux truncates thread names beyond 15 bytes.
const LOOP_THREAD_NAME_MAX_LEN: usize = 15;
const DEFAULT_LOOP_THREAD_NAME: &str = "aeron-loop";

pub(crate) struct EventLoopHandle {
    thread_name: String,
    tx: mpsc::UnboundedSender<Command>,
    join: Option<thread::JoinHandle<()>>,
}

impl EventLoopHandle {
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    pub(crate) fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    pub(crate) fn take_join(&mut self) -> Option<thread::JoinHandle<()>> {
        self.join.take()
    }
}

fn build_thread_name(index: usize) -> String {
    let name = format!("{LOOP_THREAD_NAME_PREFIX}{index}");
    if name.len() <= LOOP_THREAD_NAME_MAX_LEN {
        name
    } else {
        DEFAULT_LOOP_THREAD_NAME.to_string()
    }
}

/// Spawns one event-loop thread owning a pinned set of publications and
/// subscriptions.
pub(crate) fn spawn_event_loop(
    index: usize,
    driver: Arc<dyn MediaDriver>,
    shutdown_timeout: Duration,
) -> Result<EventLoopHandle, AeronError> {
    let thread_name = build_thread_name(index);
    let (tx, rx) = mpsc::unbounded_channel();

    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to create event-loop tokio runtime");
            runtime.block_on(run_loop(driver, rx, shutdown_timeout));
        })
        .map_err(|err| AeronError::Driver(format!("failed to spawn event loop: {err}")))?;

    Ok(EventLoopHandle {
        thread_name,
        tx,
        join: Some(join),
    })
}

struct LoopState {
    driver: Arc<dyn MediaDriver>,
    publications: HashMap<u64, PublicationState>,
    subscriptions: HashMap<u64, SubscriptionState>,
    stop_deadline: Option<Instant>,
    shutdown_timeout: Duration,
}

async fn run_loop(
    driver: Arc<dyn MediaDriver>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    shutdown_timeout: Duration,
) {
    let thread_name = fields::current_thread_name_or_default();
    info!(
        event = events::LOOP_STARTED,
        component = COMPONENT,
        loop_thread = thread_name.as_str(),
        "event loop started"
    );

    let mut state = LoopState {
        driver,
        publications: HashMap::new(),
        subscriptions: HashMap::new(),
        stop_deadline: None,
        shutdown_timeout,
    };
    let mut idle = BackoffIdle::new();
    let mut removals: Vec<u64> = Vec::new();

    loop {
        let mut work = 0;

        loop {
            match rx.try_recv() {
                Ok(command) => {
                    work += 1;
                    state.apply(command);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // every handle dropped without a stop; wind down anyway
                    state.begin_stop();
                    break;
                }
            }
        }

        for subscription in state.subscriptions.values_mut() {
            work += subscription.poll_tick();
        }

        let now = Instant::now();
        removals.clear();
        for (id, publication) in state.publications.iter_mut() {
            let (step_work, verdict) = publication.step(now);
            work += step_work;
            if matches!(verdict, StepVerdict::Remove) {
                removals.push(*id);
            }
        }
        for id in removals.drain(..) {
            state.publications.remove(&id);
        }

        if let Some(deadline) = state.stop_deadline {
            if state.publications.is_empty() && state.subscriptions.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    event = events::LOOP_FORCED_SHUTDOWN,
                    component = COMPONENT,
                    loop_thread = thread_name.as_str(),
                    publications = state.publications.len(),
                    subscriptions = state.subscriptions.len(),
                    "stop deadline reached, force-closing remaining resources"
                );
                state.force_close_all();
                break;
            }
        }

        idle.idle(work).await;
    }

    info!(
        event = events::LOOP_STOPPED,
        component = COMPONENT,
        loop_thread = thread_name.as_str(),
        "event loop stopped"
    );
}

impl LoopState {
    fn apply(&mut self, command: Command) {
        match command {
            Command::AddPublication(add) => {
                match self.driver.add_publication(&add.channel, add.stream_id) {
                    Ok(driver_publication) => {
                        let session_id = driver_publication.session_id();
                        let publication = PublicationState::new(
                            add.id,
                            add.channel.clone(),
                            driver_publication,
                            add.queue,
                            add.shared,
                            add.settings,
                        );
                        self.publications.insert(publication.id(), publication);
                        debug!(
                            event = events::PUB_ADDED,
                            component = COMPONENT,
                            session_id = fields::format_session_id(session_id).as_str(),
                            channel = fields::format_channel(&add.channel).as_str(),
                            "publication added"
                        );
                        let _ = add.reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = add.reply.send(Err(err));
                    }
                }
            }
            Command::RemovePublication { id } => {
                if let Some(mut publication) = self.publications.remove(&id) {
                    publication.close();
                    debug!(
                        event = events::PUB_REMOVED,
                        component = COMPONENT,
                        registration = id,
                        "publication removed"
                    );
                }
            }
            Command::AddSubscription(add) => {
                match self.driver.add_subscription(&add.channel, add.stream_id) {
                    Ok(driver_subscription) => {
                        let subscription = SubscriptionState::new(
                            add.id,
                            driver_subscription,
                            add.route,
                            add.events,
                            add.fragment_limit,
                        );
                        self.subscriptions.insert(subscription.id(), subscription);
                        debug!(
                            event = events::SUB_ADDED,
                            component = COMPONENT,
                            channel = fields::format_channel(&add.channel).as_str(),
                            "subscription added"
                        );
                        let _ = add.reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = add.reply.send(Err(err));
                    }
                }
            }
            Command::RemoveSubscription { id } => {
                if let Some(mut subscription) = self.subscriptions.remove(&id) {
                    subscription.close();
                    debug!(
                        event = events::SUB_REMOVED,
                        component = COMPONENT,
                        registration = id,
                        "subscription removed"
                    );
                }
            }
            Command::AttachSession {
                subscription_id,
                session_id,
                sink,
                reply,
            } => {
                let attached = match self.subscriptions.get_mut(&subscription_id) {
                    Some(subscription) => subscription.attach(session_id, sink),
                    None => false,
                };
                let _ = reply.send(attached);
            }
            Command::DetachSession {
                subscription_id,
                session_id,
            } => {
                if let Some(subscription) = self.subscriptions.get_mut(&subscription_id) {
                    subscription.detach(session_id);
                }
            }
            Command::Stop => self.begin_stop(),
        }
    }

    fn begin_stop(&mut self) {
        if self.stop_deadline.is_none() {
            self.stop_deadline = Some(Instant::now() + self.shutdown_timeout);
            debug!(
                event = events::LOOP_STOPPING,
                component = COMPONENT,
                "stop command seen"
            );
        }
    }

    fn force_close_all(&mut self) {
        for (_, mut publication) in self.publications.drain() {
            publication.close();
        }
        for (_, mut subscription) in self.subscriptions.drain() {
            subscription.close();
        }
    }
}
