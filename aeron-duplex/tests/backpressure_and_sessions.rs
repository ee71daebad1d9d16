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

mod support;

use aeron_duplex::{
    handler_fn, AeronClient, AeronError, AeronServer, Connection, OnDisposable,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

const ISOLATED_MESSAGES: u64 = 500;

#[tokio::test(flavor = "multi_thread")]
async fn a_slow_session_is_dropped_while_its_sibling_keeps_flowing() {
    let resources = support::start_resources();
    let (data_uri, control_uri) = support::endpoints();
    let options = support::test_options().with_send_queue_capacity(8);

    // the first session's handler never reads; every later session echoes
    let accepted = Arc::new(AtomicUsize::new(0));
    let (stalled_tx, mut stalled_rx) = mpsc::unbounded_channel::<Connection>();
    let server = AeronServer::create(resources.clone())
        .options(options.clone())
        .inbound_uri(data_uri.clone())
        .outbound_uri(control_uri.clone())
        .handle(handler_fn(move |connection| {
            let accepted = accepted.clone();
            let stalled_tx = stalled_tx.clone();
            async move {
                if accepted.fetch_add(1, Ordering::SeqCst) == 0 {
                    let _ = stalled_tx.send(connection.clone());
                    connection.on_dispose().await;
                    return Ok(());
                }
                while let Some(payload) = connection.inbound().recv().await {
                    connection.outbound().send(payload).await?;
                }
                Ok(())
            }
        }))
        .bind()
        .await
        .expect("server should bind");

    let stalled_client = AeronClient::create(resources.clone())
        .options(options.clone())
        .outbound_uri(data_uri.clone())
        .inbound_uri(control_uri.clone())
        .connect()
        .await
        .expect("first client should connect");
    let stalled_server_side = timeout(Duration::from_secs(2), stalled_rx.recv())
        .await
        .expect("first session should be accepted")
        .unwrap();

    let flowing_client = AeronClient::create(resources.clone())
        .options(options.clone())
        .outbound_uri(data_uri.clone())
        .inbound_uri(control_uri.clone())
        .connect()
        .await
        .expect("second client should connect");

    // overflow the stalled session's bounded inbound buffer
    for index in 0..64u64 {
        if stalled_client
            .outbound()
            .send(support::payload_for(index))
            .await
            .is_err()
        {
            break;
        }
    }

    timeout(Duration::from_secs(5), stalled_server_side.on_dispose())
        .await
        .expect("the stalled session should be dropped");
    assert_eq!(
        stalled_server_side.inbound().error(),
        Some(AeronError::SlowConsumer {
            session_id: stalled_server_side.session_id()
        })
    );

    // the sibling session is unaffected
    let sender = {
        let flowing_client = flowing_client.clone();
        tokio::spawn(async move {
            for index in 0..ISOLATED_MESSAGES {
                flowing_client
                    .outbound()
                    .send(support::payload_for(index))
                    .await
                    .expect("sibling sends should succeed");
            }
        })
    };
    for index in 0..ISOLATED_MESSAGES {
        let echoed = timeout(Duration::from_secs(5), flowing_client.inbound().recv())
            .await
            .expect("sibling echo should arrive")
            .expect("sibling inbound should stay open");
        assert_eq!(&echoed[..], &support::payload_for(index)[..], "message {index}");
    }
    sender.await.unwrap();

    stalled_client.dispose();
    flowing_client.dispose();
    stalled_client.on_dispose().await;
    flowing_client.on_dispose().await;
    server.dispose();
    server.on_dispose().await;
    resources.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_colliding_session_id_is_refused_and_times_out() {
    let resources = support::start_resources();
    let (data_uri, control_uri) = support::endpoints();
    let connect_timeout = Duration::from_millis(500);
    let options = support::test_options()
        .with_connect_timeout(connect_timeout)
        .with_session_retry_limit(0);
    let forced_session = 42;

    let server = AeronServer::create(resources.clone())
        .options(support::test_options())
        .inbound_uri(data_uri.clone())
        .outbound_uri(control_uri.clone())
        .handle(handler_fn(|connection| async move {
            while connection.inbound().recv().await.is_some() {}
            Ok(())
        }))
        .bind()
        .await
        .expect("server should bind");

    let first = AeronClient::create(resources.clone())
        .options(options.clone())
        .outbound_uri(data_uri.clone().with_session_id(forced_session))
        .inbound_uri(control_uri.clone())
        .connect()
        .await
        .expect("first client should connect");
    assert_eq!(first.session_id(), forced_session);

    // the same forced session id is refused; with no data flowing the second
    // client never sees an inbound image
    let started = Instant::now();
    let second = AeronClient::create(resources.clone())
        .options(options)
        .outbound_uri(data_uri.with_session_id(forced_session))
        .inbound_uri(control_uri)
        .connect()
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(second, Err(AeronError::NotConnected(_))));
    assert!(
        elapsed >= connect_timeout,
        "refusal should only surface after the connect timeout: {elapsed:?}"
    );

    first.dispose();
    first.on_dispose().await;
    server.dispose();
    server.on_dispose().await;
    resources.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn nonblocking_enqueue_fails_fast_on_a_full_queue() {
    let resources = support::start_resources();
    let (data_uri, _) = support::endpoints();
    let options = support::test_options()
        .with_send_queue_capacity(4)
        .with_connect_timeout(Duration::from_secs(30));

    // no peer: within the connect grace the head offer keeps returning
    // NOT_CONNECTED, so admitted sends pile up in the bounded queue
    let publication = resources
        .publication(&data_uri, 1, &options)
        .await
        .expect("publication should be created");

    let mut admitted = Vec::new();
    for index in 0..4u64 {
        let publication = publication.clone();
        let payload = support::payload_for(index);
        admitted.push(tokio::spawn(
            async move { publication.enqueue(payload.into()).await },
        ));
    }
    // let the loop pull at most one item into its in-flight slot
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut failed_fast = false;
    for index in 0..8u64 {
        let publication = publication.clone();
        let payload = support::payload_for(100 + index);
        let attempt = tokio::spawn(async move { publication.enqueue(payload.into()).await });
        match timeout(Duration::from_millis(50), attempt).await {
            Ok(Ok(Err(AeronError::Backpressured(_)))) => {
                failed_fast = true;
                break;
            }
            Ok(other) => panic!("unexpected enqueue outcome: {other:?}"),
            Err(_) => {
                // admission took the last free slot; the next attempt must
                // refuse immediately
            }
        }
    }
    assert!(failed_fast, "a full send queue must refuse without blocking");

    publication.dispose();
    for task in admitted {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(AeronError::Cancelled(_))));
    }
    resources.dispose().await;
}
