// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Exercises [`BridgeJob`] against [`FakePuicSession`] instead of a real
//! `quinn` handshake: real loopback TCP on both sides, an in-memory channel
//! pair standing in for the PUIC session, so these assert the state
//! machine's own forwarding/half-close logic without PUIC handshake cost.

use puic_bridge::{
    job::bridge::BridgeJob,
    tcp::endpoint::TcpEndpoint,
    transport::puic::FakePuicSession,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Binds a loopback listener and returns `(accepted endpoint, other end)`.
async fn tcp_pair() -> (TcpEndpoint, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let (accepted, connected) =
        tokio::try_join!(listener.accept(), TcpStream::connect(addr)).expect("tcp pair");
    (TcpEndpoint::from_stream(accepted.0).expect("wrap endpoint"), connected)
}

#[tokio::test]
async fn agent_and_proxy_jobs_relay_bytes_both_ways() {
    let remote_a = "127.0.0.1:9001".parse().unwrap();
    let remote_b = "127.0.0.1:9002".parse().unwrap();
    let (puic_agent_side, puic_proxy_side) = FakePuicSession::pair(remote_a, remote_b);

    let (agent_tcp, mut client) = tcp_pair().await;
    let (proxy_tcp, mut backend) = tcp_pair().await;

    let agent_job = BridgeJob::for_agent(agent_tcp, puic_agent_side, CancellationToken::new());
    let proxy_job = BridgeJob::for_proxy(proxy_tcp, puic_proxy_side, CancellationToken::new());
    let agent_task = tokio::spawn(agent_job.run());
    let proxy_task = tokio::spawn(proxy_job.run());

    client.write_all(b"ping").await.expect("client write");
    let mut from_client = [0u8; 4];
    backend.read_exact(&mut from_client).await.expect("backend read");
    assert_eq!(&from_client, b"ping");

    backend.write_all(b"pong!").await.expect("backend write");
    let mut from_backend = [0u8; 5];
    client.read_exact(&mut from_backend).await.expect("client read");
    assert_eq!(&from_backend, b"pong!");

    client.shutdown().await.expect("client shutdown");
    backend.shutdown().await.expect("backend shutdown");

    tokio::time::timeout(std::time::Duration::from_secs(5), agent_task)
        .await
        .expect("agent job timed out")
        .expect("agent job panicked");
    tokio::time::timeout(std::time::Duration::from_secs(5), proxy_task)
        .await
        .expect("proxy job timed out")
        .expect("proxy job panicked");
}

#[tokio::test]
async fn cancellation_tears_a_running_job_down_promptly() {
    let remote_a = "127.0.0.1:9003".parse().unwrap();
    let remote_b = "127.0.0.1:9004".parse().unwrap();
    let (puic_agent_side, _puic_proxy_side) = FakePuicSession::pair(remote_a, remote_b);

    let (agent_tcp, _client) = tcp_pair().await;
    let cancel = CancellationToken::new();
    let job = BridgeJob::for_agent(agent_tcp, puic_agent_side, cancel.clone());
    let task = tokio::spawn(job.run());

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .expect("cancelled job should tear down promptly")
        .expect("job panicked");
}
