//! Canonical structured event names used across `aeron-duplex`.

// Publication send-path events.
pub const PUB_ADDED: &str = "pub_added";
pub const PUB_REMOVED: &str = "pub_removed";
pub const PUB_ITEM_TIMEOUT: &str = "pub_item_timeout";
pub const PUB_BACKPRESSURE_TIMEOUT: &str = "pub_backpressure_timeout";
pub const PUB_NOT_CONNECTED: &str = "pub_not_connected";
pub const PUB_FATAL: &str = "pub_fatal";
pub const PUB_DRAIN_CANCELLED: &str = "pub_drain_cancelled";

// Subscription receive-path events.
pub const SUB_ADDED: &str = "sub_added";
pub const SUB_REMOVED: &str = "sub_removed";
pub const SUB_UNKNOWN_SESSION: &str = "sub_unknown_session";
pub const SUB_ORPHAN_FRAGMENT: &str = "sub_orphan_fragment";
pub const SUB_SLOW_CONSUMER: &str = "sub_slow_consumer";
pub const SUB_SESSION_ATTACHED: &str = "sub_session_attached";
pub const SUB_SESSION_DETACHED: &str = "sub_session_detached";

// Event-loop lifecycle events.
pub const LOOP_STARTED: &str = "loop_started";
pub const LOOP_STOPPING: &str = "loop_stopping";
pub const LOOP_STOPPED: &str = "loop_stopped";
pub const LOOP_FORCED_SHUTDOWN: &str = "loop_forced_shutdown";

// Resource and driver lifecycle events.
pub const RESOURCES_STARTED: &str = "resources_started";
pub const RESOURCES_DISPOSING: &str = "resources_disposing";
pub const RESOURCES_DISPOSED: &str = "resources_disposed";
pub const DRIVER_LAUNCHED: &str = "driver_launched";
pub const DRIVER_SHUTDOWN: &str = "driver_shutdown";
pub const DRIVER_DIR_DELETE_FAILED: &str = "driver_dir_delete_failed";

// Connection lifecycle events.
pub const CONNECTION_ACTIVE: &str = "connection_active";
pub const CONNECTION_DISPOSING: &str = "connection_disposing";
pub const CONNECTION_DISPOSED: &str = "connection_disposed";
pub const HANDLER_FAILED: &str = "handler_failed";

// Connector events.
pub const CLIENT_CONNECTING: &str = "client_connecting";
pub const CLIENT_CONNECTED: &str = "client_connected";
pub const CLIENT_RENDEZVOUS_RETRY: &str = "client_rendezvous_retry";
pub const CLIENT_CONNECT_FAILED: &str = "client_connect_failed";
pub const SERVER_BOUND: &str = "server_bound";
pub const SERVER_SESSION_CREATED: &str = "server_session_created";
pub const SERVER_SESSION_REFUSED: &str = "server_session_refused";
pub const SERVER_SESSION_LOST: &str = "server_session_lost";
pub const SERVER_SESSION_FAILED: &str = "server_session_failed";
pub const SERVER_DISPOSING: &str = "server_disposing";
