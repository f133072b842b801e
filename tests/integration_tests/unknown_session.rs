// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S5: a UDP datagram that cannot be matched to any session is dropped; no
//! session is created and no callback is raised.
//!
//! `transport::adapter::parse_session_id`'s unit tests cover this against
//! §6.1's own framing in isolation (see that module's doc comment on why it
//! isn't wired into the live binaries); this test covers the same property
//! against the real running path, where `quinn::Endpoint` does its own
//! demux internally. Garbage bytes aren't a valid QUIC Initial packet for
//! any connection, so the listener must never hand them to `accept()`.

use std::time::Duration;

use puic_bridge::transport::puic::{PuicConfig, PuicListener, QuinnListener};
use tokio::net::UdpSocket;

#[tokio::test]
async fn garbage_datagram_is_dropped_without_creating_a_session() {
    let listener = QuinnListener::new(&PuicConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    })
    .expect("build puic listener");
    let listen_addr = listener.local_addr().expect("listener local_addr");

    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind raw udp socket");
    sender
        .send_to(b"not a quic packet at all", listen_addr)
        .await
        .expect("send garbage datagram");

    let accepted = tokio::time::timeout(Duration::from_millis(250), listener.accept()).await;
    assert!(
        accepted.is_err(),
        "listener.accept() should not resolve for an unroutable datagram"
    );
}
