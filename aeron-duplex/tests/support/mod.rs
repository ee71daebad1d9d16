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

use aeron_duplex::{AeronOptions, AeronResources, ChannelUri, ResourcesConfig};
use loopback_driver::LoopbackDriver;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PORT: AtomicU16 = AtomicU16::new(21000);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A fresh (data endpoint, MDC control endpoint) pair so tests cannot cross
/// paths inside a shared process.
pub fn endpoints() -> (ChannelUri, ChannelUri) {
    let data_port = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
    let data = ChannelUri::udp().with_endpoint(format!("127.0.0.1:{data_port}"));
    let control = ChannelUri::udp()
        .with_control(format!("127.0.0.1:{}", data_port + 1))
        .with_dynamic_control_mode();
    (data, control)
}

pub fn test_options() -> AeronOptions {
    AeronOptions::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_image_liveness_timeout(Duration::from_secs(1))
        .with_send_queue_capacity(16)
}

pub fn start_resources() -> AeronResources {
    init_logging();
    let driver = Arc::new(LoopbackDriver::launch().expect("loopback driver should launch"));
    AeronResources::start(
        driver,
        ResourcesConfig::default().with_shutdown_timeout(Duration::from_secs(2)),
    )
    .expect("resources should start")
}

/// Deterministic pseudo-random payload for ordering checks.
#[allow(dead_code)]
pub fn payload_for(index: u64) -> Vec<u8> {
    let mut state = index
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    let length = 1 + (state % 48) as usize;
    let mut payload = Vec::with_capacity(length);
    for _ in 0..length {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        payload.push((state >> 32) as u8);
    }
    payload
}
