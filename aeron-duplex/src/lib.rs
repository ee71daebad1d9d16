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

//! # aeron-duplex
//!
//! `aeron-duplex` layers reactive, full-duplex message connections on top of
//! an Aeron-style log-buffer transport: unidirectional, sessioned,
//! best-effort-ordered fragments over channels named by URI and stream id.
//!
//! A client opens an outbound publication and derives the driver-assigned
//! session id from it; that session id qualifies an MDC inbound channel on
//! the server's control endpoint, so the server can answer each client over
//! a per-session reverse publication while serving every client from one
//! shared subscription. [`AeronResources`] owns the driver and the polling
//! event loops; [`AeronClient`] and [`AeronServer`] build [`Connection`]s on
//! top of it.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use aeron_duplex::{
//!     handler_fn, AeronClient, AeronResources, AeronServer, ChannelUri, OnDisposable,
//!     ResourcesConfig,
//! };
//! use loopback_driver::LoopbackDriver;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let driver = Arc::new(LoopbackDriver::launch().unwrap());
//! let resources = AeronResources::start(driver, ResourcesConfig::default()).unwrap();
//!
//! let server = AeronServer::create(resources.clone())
//!     .inbound_uri(ChannelUri::udp().with_endpoint("127.0.0.1:13000"))
//!     .outbound_uri(
//!         ChannelUri::udp()
//!             .with_control("127.0.0.1:13001")
//!             .with_dynamic_control_mode(),
//!     )
//!     .handle(handler_fn(|connection| async move {
//!         while let Some(payload) = connection.inbound().recv().await {
//!             connection.outbound().send(payload).await?;
//!         }
//!         Ok(())
//!     }))
//!     .bind()
//!     .await
//!     .unwrap();
//!
//! let connection = AeronClient::create(resources.clone())
//!     .outbound_uri(ChannelUri::udp().with_endpoint("127.0.0.1:13000"))
//!     .inbound_uri(
//!         ChannelUri::udp()
//!             .with_control("127.0.0.1:13001")
//!             .with_dynamic_control_mode(),
//!     )
//!     .connect()
//!     .await
//!     .unwrap();
//!
//! connection.outbound().send("ping".as_bytes().to_vec()).await.unwrap();
//! let echoed = connection.inbound().recv().await.unwrap();
//! assert_eq!(&echoed[..], b"ping");
//!
//! connection.dispose();
//! connection.on_dispose().await;
//! server.dispose();
//! server.on_dispose().await;
//! resources.dispose().await;
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - API facade: outward `AeronClient`/`AeronServer`/`Connection` surface
//! - Control plane: resource ownership, the publication cache, driver
//!   lifecycle
//! - Data plane: publication send queues, subscription demux, fragment
//!   reassembly
//! - Runtime: event-loop threads, command queues and the idle strategy
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits
//! events/spans and does not unconditionally initialize a global subscriber.
//! Binaries and tests are responsible for one-time `tracing_subscriber`
//! initialization at process boundaries.

mod channel_uri;
pub use channel_uri::ChannelUri;

mod error;
pub use error::AeronError;

mod options;
pub use options::{AeronOptions, ResourcesConfig};

pub mod driver;

mod connection;
pub use connection::{
    handler_fn, Connection, ConnectionHandler, Inbound, InboundSink, OnDisposable, Outbound,
};

mod control_plane;
pub use control_plane::driver_manager::DriverManager;
pub use control_plane::resources::AeronResources;

mod data_plane;
pub use data_plane::publication::MessagePublication;
pub use data_plane::subscription::{InboundRoute, MessageSubscription, SessionEvent};

mod observability;
mod runtime;

mod client;
pub use client::AeronClient;

mod server;
pub use server::{AeronServer, ServerBinding};
