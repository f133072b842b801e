// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S1: a small payload makes a full round trip, client -> agent -> proxy ->
//! upstream (echoed) -> proxy -> agent -> client, byte-identical.

use tokio::io::AsyncWriteExt;

use crate::integration_tests::common::*;

#[tokio::test]
async fn small_payload_round_trips_through_both_jobs() {
    let backend_addr = spawn_echo_backend().await.expect("spawn echo backend");
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

    let payload = b"hello, world!";
    client.write_all(payload).await.expect("client write");

    let mut echoed = vec![0u8; payload.len()];
    tokio::io::AsyncReadExt::read_exact(&mut client, &mut echoed)
        .await
        .expect("client read echo");

    assert_eq!(&echoed, payload);
}
