// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S3: a transfer large enough to repeatedly cross the backpressure
//! watermarks (§ I5, HIGH_WATER/LOW_WATER) still arrives byte-identical.
//! The read and write sides run concurrently so TCP's own flow control
//! can't deadlock the test against the bridge's own buffering.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::integration_tests::common::*;

/// Large enough to cross HIGH_WATER (8 KiB) many times over without making
/// the test suite slow.
const TRANSFER_BYTES: usize = 2 * 1024 * 1024;

#[tokio::test]
async fn large_transfer_survives_backpressure_byte_identical() {
    let backend_addr = spawn_echo_backend().await.expect("spawn echo backend");
    let (client_listener, client_listen_addr) =
        bind_client_facing_listener().await.expect("bind client-facing listener");

    let (proxy_puic, agent_puic, _listen_addr) = puic_loopback_pair().await.expect("puic handshake");

    let (client, agent_tcp) = connect_client_and_accept_agent_tcp(&client_listener, client_listen_addr)
        .await
        .expect("client connect / agent accept");
    let proxy_tcp = puic_bridge::tcp::endpoint::TcpEndpoint::connect(backend_addr)
        .await
        .expect("proxy connect to backend");

    let (_agent_task, _proxy_task) = spawn_bridge_pair(agent_tcp, agent_puic, proxy_tcp, proxy_puic);

    let payload: std::sync::Arc<Vec<u8>> =
        std::sync::Arc::new((0..TRANSFER_BYTES).map(|i| (i % 256) as u8).collect());

    let (mut read_half, mut write_half) = client.into_split();

    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            write_half.write_all(&payload).await.expect("client write");
        })
    };
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; TRANSFER_BYTES];
        read_half.read_exact(&mut buf).await.expect("client read");
        buf
    });

    writer.await.expect("writer task panicked");
    let echoed = reader.await.expect("reader task panicked");

    assert_eq!(echoed.len(), payload.len());
    assert_eq!(&echoed, payload.as_ref());
}
