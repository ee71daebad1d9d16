//! Command-queue payloads through which callers on other threads reach the
//! single-threaded event loops.

use crate::channel_uri::ChannelUri;
use crate::connection::InboundSink;
use crate::data_plane::publication::{PublicationSettings, PublicationShared, SendRequest};
use crate::data_plane::subscription::{InboundRoute, SessionEvent};
use crate::error::AeronError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub(crate) struct AddPublication {
    pub(crate) id: u64,
    pub(crate) channel: ChannelUri,
    pub(crate) stream_id: i32,
    pub(crate) queue: mpsc::Receiver<SendRequest>,
    pub(crate) shared: Arc<PublicationShared>,
    pub(crate) settings: PublicationSettings,
    pub(crate) reply: oneshot::Sender<Result<(), AeronError>>,
}

pub(crate) struct AddSubscription {
    pub(crate) id: u64,
    pub(crate) channel: ChannelUri,
    pub(crate) stream_id: i32,
    pub(crate) route: InboundRoute,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) fragment_limit: usize,
    pub(crate) reply: oneshot::Sender<Result<(), AeronError>>,
}

pub(crate) enum Command {
    AddPublication(AddPublication),
    RemovePublication {
        id: u64,
    },
    AddSubscription(AddSubscription),
    RemoveSubscription {
        id: u64,
    },
    AttachSession {
        subscription_id: u64,
        session_id: i32,
        sink: InboundSink,
        reply: oneshot::Sender<bool>,
    },
    DetachSession {
        subscription_id: u64,
        session_id: i32,
    },
    Stop,
}
