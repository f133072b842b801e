// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single UDP socket with a fixed-size pending-send pool (§4.1, C1).
//!
//! Scope note: neither binary constructs a [`UdpEndpoint`]. `quinn::Endpoint`
//! owns its own UDP socket and send-queue internally once a session is up,
//! and re-deriving a second, parallel socket/pool in front of it would mean
//! reimplementing the part of the pacing/congestion-control machinery that
//! §1 explicitly scopes out as "the full PUIC/QUIC protocol implementation".
//! This module is kept as a standalone realization of C1's pool-accounting
//! contract (free-pool size, write-blocked latch, wake-on-writable) for unit
//! testing in isolation (I4 / testable property 6) — not as a component
//! wired into the live agent/proxy data path, which is `quinn`'s socket.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{net::UdpSocket, sync::Mutex};

use crate::error::{BridgeError, SendOutcome};

/// Fixed pool size, matching `MaxFlyingMessages` in `puic_client.h`.
pub const POOL_SLOTS: usize = 1024;
/// Per-slot buffer size, matching the original's datagram buffer length.
pub const SLOT_BYTES: usize = 1500;

/// Minimum socket receive/send buffer size requested via `socket2`;
/// `tokio::net::UdpSocket` has no API for this, so the socket is built with
/// `socket2` and handed to tokio afterwards.
const SOCKET_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// A fixed pool of `POOL_SLOTS` send buffers shared by every session using
/// this endpoint. Slots are pushed/popped LIFO under a single mutex, one
/// writer at a time.
struct SlotPool {
    free: Mutex<Vec<Box<[u8; SLOT_BYTES]>>>,
}

impl SlotPool {
    fn new() -> Self {
        let free = (0..POOL_SLOTS).map(|_| Box::new([0u8; SLOT_BYTES])).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    async fn acquire(&self) -> Option<Box<[u8; SLOT_BYTES]>> {
        self.free.lock().await.pop()
    }

    async fn release(&self, slot: Box<[u8; SLOT_BYTES]>) {
        self.free.lock().await.push(slot);
    }

    async fn free_count(&self) -> usize {
        self.free.lock().await.len()
    }
}

/// Callback invoked from send-completion context when the endpoint
/// transitions from write-blocked back to writable (§4.1).
pub type WakeFn = Arc<dyn Fn() + Send + Sync>;

pub struct UdpEndpoint {
    socket: UdpSocket,
    pool: SlotPool,
    write_blocked: std::sync::atomic::AtomicBool,
    wake: std::sync::Mutex<Option<WakeFn>>,
}

impl UdpEndpoint {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BridgeError> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
            BridgeError::TransportIo {
                op: "udp socket create",
                source,
            }
        })?;
        socket
            .set_recv_buffer_size(SOCKET_BUFFER_BYTES)
            .map_err(|source| BridgeError::TransportIo {
                op: "udp set_recv_buffer_size",
                source,
            })?;
        socket
            .set_send_buffer_size(SOCKET_BUFFER_BYTES)
            .map_err(|source| BridgeError::TransportIo {
                op: "udp set_send_buffer_size",
                source,
            })?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|source| BridgeError::TransportIo {
                op: "udp bind",
                source,
            })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| BridgeError::TransportIo {
                op: "udp set_nonblocking",
                source,
            })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|source| BridgeError::TransportIo {
            op: "udp from_std",
            source,
        })?;

        Ok(Self {
            socket,
            pool: SlotPool::new(),
            write_blocked: std::sync::atomic::AtomicBool::new(false),
            wake: std::sync::Mutex::new(None),
        })
    }

    pub fn set_wake(&self, wake: WakeFn) {
        *self.wake.lock().expect("wake mutex poisoned") = Some(wake);
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.socket.local_addr().map_err(|source| BridgeError::TransportIo {
            op: "udp local_addr",
            source,
        })
    }

    /// Sends `bytes` to `peer`. Returns `Blocked` without touching the
    /// socket if the pool has no free slot; the pool is otherwise drained
    /// and refilled strictly around the syscall so a failed `send_to`
    /// still returns its slot.
    pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<SendOutcome, BridgeError> {
        debug_assert!(bytes.len() <= SLOT_BYTES, "datagram exceeds slot size");

        let Some(mut slot) = self.pool.acquire().await else {
            self.write_blocked.store(true, std::sync::atomic::Ordering::Release);
            return Ok(SendOutcome::Blocked);
        };

        slot[..bytes.len()].copy_from_slice(bytes);
        let result = self.socket.send_to(&slot[..bytes.len()], peer).await;
        let was_full = self.pool.free_count().await == POOL_SLOTS - 1;
        self.pool.release(slot).await;

        let was_blocked = self
            .write_blocked
            .swap(false, std::sync::atomic::Ordering::AcqRel);
        if was_blocked && was_full {
            if let Some(wake) = self.wake.lock().expect("wake mutex poisoned").as_ref() {
                wake();
            }
        }

        result
            .map(|_| SendOutcome::Sent)
            .map_err(|source| BridgeError::TransportIo { op: "udp send_to", source })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), BridgeError> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|source| BridgeError::TransportIo { op: "udp recv_from", source })
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Number of slots currently free, for the pool-accounting invariant
    /// (I4 / property 6 in §8).
    pub async fn free_slots(&self) -> usize {
        self.pool.free_count().await
    }
}
