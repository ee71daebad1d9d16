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

use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Failure kinds surfaced by connections, publications and subscriptions.
///
/// A failure inside one connection never takes down the server or sibling
/// connections; only resource-level failures (driver loss) propagate broadly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AeronError {
    /// A publication (or the client rendezvous) did not reach the connected
    /// state within the connect timeout. Retryable by the caller.
    NotConnected(String),
    /// A queued item exceeded the publication timeout, or a single offer was
    /// back-pressured longer than the backpressure timeout. The connection
    /// stays alive.
    Timeout(String),
    /// The send queue was full and the caller asked for non-blocking
    /// admission. The connection stays alive.
    Backpressured(String),
    /// A session's inbound buffer overflowed because its consumer stalled.
    /// Only that session's connection is disposed.
    SlowConsumer { session_id: i32 },
    /// The transport reported the session's image gone.
    ImageLost { session_id: i32 },
    /// An image arrived carrying a session id already in use; the new image
    /// is ignored.
    SessionCollision { session_id: i32 },
    /// The item was still pending when its publication was disposed.
    Cancelled(String),
    /// Unrecoverable publication state (closed, max position exceeded) or a
    /// fragment handler failure. Disposes the connection.
    Fatal(String),
    /// The user handler failed. Disposes the connection.
    Handler(String),
    /// The media driver rejected a resource operation.
    Driver(String),
    /// A channel URI failed to parse or validate.
    InvalidChannel(String),
    /// The payload exceeds the driver's maximum message length.
    MessageTooLarge { length: usize, max: usize },
}

impl AeronError {
    /// Stable lower-case name of the failure kind, used as a structured log
    /// field value.
    pub fn kind(&self) -> &'static str {
        match self {
            AeronError::NotConnected(_) => "not_connected",
            AeronError::Timeout(_) => "timeout",
            AeronError::Backpressured(_) => "backpressured",
            AeronError::SlowConsumer { .. } => "slow_consumer",
            AeronError::ImageLost { .. } => "image_lost",
            AeronError::SessionCollision { .. } => "session_collision",
            AeronError::Cancelled(_) => "cancelled",
            AeronError::Fatal(_) => "fatal",
            AeronError::Handler(_) => "handler",
            AeronError::Driver(_) => "driver",
            AeronError::InvalidChannel(_) => "invalid_channel",
            AeronError::MessageTooLarge { .. } => "message_too_large",
        }
    }
}

impl Display for AeronError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AeronError::NotConnected(detail) => write!(f, "not connected: {detail}"),
            AeronError::Timeout(detail) => write!(f, "timed out: {detail}"),
            AeronError::Backpressured(detail) => write!(f, "back-pressured: {detail}"),
            AeronError::SlowConsumer { session_id } => {
                write!(f, "{session_id:x}: inbound consumer too slow, session dropped")
            }
            AeronError::ImageLost { session_id } => {
                write!(f, "{session_id:x}: image became unavailable")
            }
            AeronError::SessionCollision { session_id } => {
                write!(f, "{session_id:x}: session id already in use, image ignored")
            }
            AeronError::Cancelled(detail) => write!(f, "cancelled: {detail}"),
            AeronError::Fatal(detail) => write!(f, "fatal publication failure: {detail}"),
            AeronError::Handler(detail) => write!(f, "handler failed: {detail}"),
            AeronError::Driver(detail) => write!(f, "driver rejected operation: {detail}"),
            AeronError::InvalidChannel(detail) => write!(f, "invalid channel URI: {detail}"),
            AeronError::MessageTooLarge { length, max } => {
                write!(f, "message of {length} bytes exceeds driver maximum of {max}")
            }
        }
    }
}

impl Error for AeronError {}
