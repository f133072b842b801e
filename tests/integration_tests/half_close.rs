// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S2: the client half-closes (shuts down writes) after sending a fixed
//! amount of data. The backend must see exactly that many bytes followed by
//! EOF, and its own reply — sent only after observing that EOF — must still
//! reach the client before the tunnel fully tears down.

use tokio::io::AsyncWriteExt;

use crate::integration_tests::common::*;

const REPLY: &[u8] = b"response-after-client-eof";

#[tokio::test]
async fn client_half_close_propagates_then_reply_still_arrives() {
    let (backend_addr, received_len) = spawn_count_then_reply_backend(REPLY)
        .await
        .expect("spawn count-then-reply backend");
    let (client_listener, client_listen_addr) =
        bind_client_facing_listener().await.expect("bind client-facing listener");

    let (proxy_puic, agent_puic, _listen_addr) = puic_loopback_pair().await.expect("puic handshake");

    let (mut client, agent_tcp) = connect_client_and_accept_agent_tcp(&client_listener, client_listen_addr)
        .await
        .expect("client connect / agent accept");
    let proxy_tcp = puic_bridge::tcp::endpoint::TcpEndpoint::connect(backend_addr)
        .await
        .expect("proxy connect to backend");

    let (_agent_task, _proxy_task) = spawn_bridge_pair(agent_tcp, agent_puic, proxy_tcp, proxy_puic);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    client.write_all(&payload).await.expect("client write");
    client.shutdown().await.expect("client shutdown write");

    let seen_by_backend = received_len.await.expect("backend reported byte count");
    assert_eq!(seen_by_backend, 1000);

    let echoed_reply = read_to_eof(&mut client).await.expect("read reply to eof");
    assert_eq!(echoed_reply, REPLY);
}
