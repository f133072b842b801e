// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection TCP endpoint (§4.3, C3).
//!
//! Socket options (`TCP_NODELAY`, 1s keepalive, 512KiB send/recv buffers)
//! match the original proxy's `TCPConn::Start` exactly. `tokio::net::TcpStream`
//! doesn't expose buffer sizing or keepalive interval directly, so the
//! socket is built and tuned with `socket2` first, the same approach used
//! for the UDP endpoint in [`crate::transport::udp_endpoint`].

use std::{net::SocketAddr, time::Duration};

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use crate::error::BridgeError;

const RECV_BUFFER_BYTES: usize = 512 * 1024;
const SEND_BUFFER_BYTES: usize = 512 * 1024;
const KEEPALIVE_DELAY: Duration = Duration::from_secs(1);

/// One TCP half of a bridging job: an accepted or dialed connection, tuned
/// the way the original proxy tunes every backend and agent socket.
pub struct TcpEndpoint {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    pub async fn connect(target: SocketAddr) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| BridgeError::TransportIo { op: "tcp connect", source })?;
        tune(&stream)?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, BridgeError> {
        let peer_addr = stream.peer_addr().map_err(|source| BridgeError::TransportIo {
            op: "tcp peer_addr",
            source,
        })?;
        let local_addr = stream.local_addr().map_err(|source| BridgeError::TransportIo {
            op: "tcp local_addr",
            source,
        })?;
        Ok(Self {
            stream,
            peer_addr,
            local_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Half-closes the write side (§4, I2: tcp-eof propagates as a
    /// PUIC stream FIN, never a full socket close).
    pub async fn shutdown_write(&mut self) -> Result<(), BridgeError> {
        self.stream
            .shutdown()
            .await
            .map_err(|source| BridgeError::TransportIo { op: "tcp shutdown", source })
    }
}

/// Binds a listener with the same buffer tuning applied to every accepted
/// connection in [`accept`].
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, BridgeError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|source| {
        BridgeError::TransportIo { op: "tcp socket create", source }
    })?;
    socket.set_reuse_address(true).map_err(|source| BridgeError::TransportIo {
        op: "tcp set_reuse_address",
        source,
    })?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| BridgeError::TransportIo { op: "tcp bind", source })?;
    socket
        .listen(1024)
        .map_err(|source| BridgeError::TransportIo { op: "tcp listen", source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| BridgeError::TransportIo { op: "tcp set_nonblocking", source })?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|source| BridgeError::TransportIo {
        op: "tcp listener from_std",
        source,
    })
}

/// Accepts one connection and applies the original's per-connection socket
/// tuning (nodelay, 1s keepalive, 512KiB buffers).
pub async fn accept(listener: &TcpListener) -> Result<TcpEndpoint, BridgeError> {
    let (stream, _peer) = listener.accept().await.map_err(|source| BridgeError::TransportIo {
        op: "tcp accept",
        source,
    })?;
    tune(&stream)?;
    TcpEndpoint::from_stream(stream)
}

fn tune(stream: &TcpStream) -> Result<(), BridgeError> {
    stream.set_nodelay(true).map_err(|source| BridgeError::TransportIo {
        op: "tcp set_nodelay",
        source,
    })?;

    let socket_ref = socket2::SockRef::from(stream);
    socket_ref
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_DELAY))
        .map_err(|source| BridgeError::TransportIo { op: "tcp set_keepalive", source })?;
    socket_ref
        .set_recv_buffer_size(RECV_BUFFER_BYTES)
        .map_err(|source| BridgeError::TransportIo { op: "tcp set_recv_buffer_size", source })?;
    socket_ref
        .set_send_buffer_size(SEND_BUFFER_BYTES)
        .map_err(|source| BridgeError::TransportIo { op: "tcp set_send_buffer_size", source })?;
    Ok(())
}

