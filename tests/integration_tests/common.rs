// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared loopback wiring for the bridging-job integration tests.
//!
//! Each test drives the same components `puic-agent`/`puic-proxy` wire up
//! in `main()` (a [`QuinnListener`]/[`QuinnDialer`] pair plus a pair of
//! [`BridgeJob`]s), just without going through argv or a real second
//! process, so the tests exercise the exact forwarding path the binaries
//! run in production.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use puic_bridge::{
    job::bridge::BridgeJob,
    tcp::endpoint::{self, TcpEndpoint},
    transport::puic::{PuicConfig, PuicDialer, PuicListener, PuicSession, QuinnDialer, QuinnListener},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

const LOOPBACK_ANY_PORT: &str = "127.0.0.1:0";

/// Dials a fresh PUIC session over loopback UDP and returns both ends plus
/// the listener's own address: `(proxy_side, agent_side, listen_addr)`,
/// matching which process originates which role in the real binaries (the
/// proxy accepts, the agent dials). `listen_addr` stands in for the proxy's
/// own PUIC listen address (§6.2's `dst_*` fields).
pub async fn puic_loopback_pair() -> Result<(Arc<dyn PuicSession>, Arc<dyn PuicSession>, SocketAddr)> {
    let listener = QuinnListener::new(&PuicConfig {
        bind_addr: LOOPBACK_ANY_PORT.parse().unwrap(),
        ..Default::default()
    })
    .context("build puic listener")?;
    let listen_addr = listener.local_addr().context("listener local_addr")?;

    let dialer = QuinnDialer::new(
        &PuicConfig {
            bind_addr: LOOPBACK_ANY_PORT.parse().unwrap(),
            ..Default::default()
        },
        "puic-proxy",
    )
    .context("build puic dialer")?;

    let (proxy_side, agent_side) = tokio::try_join!(listener.accept(), dialer.dial(listen_addr))
        .map_err(|err| anyhow::anyhow!("puic handshake failed: {err}"))?;
    Ok((proxy_side, agent_side, listen_addr))
}

/// Binds a TCP listener representing the agent's local-facing socket and
/// returns its address plus the listener itself, so a test can dial it as
/// a "local client" and accept the other end as the agent's [`TcpEndpoint`].
pub async fn bind_client_facing_listener() -> Result<(TcpListener, SocketAddr)> {
    let listener = endpoint::bind(LOOPBACK_ANY_PORT.parse().unwrap())
        .await
        .context("bind client-facing tcp listener")?;
    let addr = listener.local_addr().context("tcp listener local_addr")?;
    Ok((listener, addr))
}

/// Connects a plain `TcpStream` standing in for a local client, and
/// accepts the agent-side [`TcpEndpoint`] for the same connection.
pub async fn connect_client_and_accept_agent_tcp(
    listener: &TcpListener,
    client_target: SocketAddr,
) -> Result<(TcpStream, TcpEndpoint)> {
    let (client, accepted) = tokio::try_join!(
        TcpStream::connect(client_target),
        endpoint::accept(listener),
    )
    .map_err(|err| anyhow::anyhow!("client connect / agent accept failed: {err}"))?;
    Ok((client, accepted))
}

/// Spawns both halves of a bridging job: the agent-inbound job wrapping
/// `client_side_tcp`, and the proxy-outbound job wrapping `backend_tcp`.
/// Returns the tasks so a test can await completion.
pub fn spawn_bridge_pair(
    agent_tcp: TcpEndpoint,
    agent_puic: Arc<dyn PuicSession>,
    proxy_tcp: TcpEndpoint,
    proxy_puic: Arc<dyn PuicSession>,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let agent_job = BridgeJob::for_agent(agent_tcp, agent_puic, CancellationToken::new());
    let proxy_job = BridgeJob::for_proxy(proxy_tcp, proxy_puic, CancellationToken::new());
    (tokio::spawn(agent_job.run()), tokio::spawn(proxy_job.run()))
}

/// A backend that echoes every byte it reads back verbatim until EOF, then
/// shuts its write side down. Stands in for the upstream service the proxy
/// forwards to (S1 / S3 in the scenario list).
pub async fn spawn_echo_backend() -> Result<SocketAddr> {
    let listener = endpoint::bind(LOOPBACK_ANY_PORT.parse().unwrap()).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 8192];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    },
                }
            }
            let _ = stream.shutdown().await;
        }
    });
    Ok(addr)
}

/// A backend that reads until EOF (recording how many bytes it saw), then
/// writes `reply` and shuts down. Used for the half-close scenario (S2),
/// where the client's EOF must arrive before the backend's own reply does.
pub async fn spawn_count_then_reply_backend(
    reply: &'static [u8],
) -> Result<(SocketAddr, tokio::sync::oneshot::Receiver<usize>)> {
    let listener = endpoint::bind(LOOPBACK_ANY_PORT.parse().unwrap()).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 8192];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
            let _ = tx.send(total);
            let _ = stream.write_all(reply).await;
            let _ = stream.shutdown().await;
        }
    });
    Ok((addr, rx))
}

/// A backend that records every byte it reads until EOF, without replying.
/// Used to inspect what the proxy actually put on the wire (e.g. the
/// PROXY-protocol header in S4) ahead of the tunneled payload.
pub async fn spawn_capture_backend() -> Result<(SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>)> {
    let listener = endpoint::bind(LOOPBACK_ANY_PORT.parse().unwrap()).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut captured = Vec::new();
            let _ = stream.read_to_end(&mut captured).await;
            let _ = tx.send(captured);
        }
    });
    Ok((addr, rx))
}

/// Reads from `stream` until EOF, returning everything read.
pub async fn read_to_eof(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.context("read_to_end")?;
    Ok(out)
}
