// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The PUIC transport adapter (§4.2, §6.1, C2).
//!
//! Bridges the raw [`crate::transport::udp_endpoint::UdpEndpoint`] to the
//! session registry: parses the session id out of each inbound datagram,
//! dispatches it to the owning session if one exists, and tracks which
//! sessions are currently write-blocked so the registry can notify them in
//! order when the underlying socket becomes writable again.
//!
//! Scope note: neither binary calls [`parse_session_id`] or constructs a
//! [`BlockedWriters`]. `quinn::Endpoint` does its own datagram demux
//! (matching inbound packets to connections by QUIC's own wire-level
//! connection id, not the original protocol's public-flags-byte framing
//! from §6.1) and its own per-connection pacing internally, and both are
//! inseparable from the congestion control and packet-number-space
//! machinery §1 scopes out as "the full PUIC/QUIC protocol implementation".
//! This module is kept as a standalone, unit-tested realization of C2's
//! demux/blocked-writer contract (§6.1's parse rule, insertion-ordered
//! wake order) exercised without a socket or handshake — not as a
//! component wired into the live agent/proxy data path, which is
//! `quinn::Endpoint`'s own internal dispatch. `tests/integration_tests/unknown_session.rs`
//! covers the S5 drop behavior (§8) against that real path directly.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Bit in the QUIC public-flags byte indicating an 8-byte connection id
/// follows (`PACKET_PUBLIC_FLAGS_8BYTE_CONNECTION_ID`).
const FLAG_8BYTE_CONNECTION_ID: u8 = 0x01;

/// Parses a session id from the first nine bytes of an inbound datagram
/// (§6.1). Returns `0` if the datagram is too short or doesn't carry an
/// 8-byte connection id, matching the original dispatcher's "return 0 ⇒
/// drop" convention.
pub fn parse_session_id(datagram: &[u8]) -> u64 {
    if datagram.len() < 9 {
        return 0;
    }
    if datagram[0] & FLAG_8BYTE_CONNECTION_ID == 0 {
        return 0;
    }
    u64::from_be_bytes(datagram[1..9].try_into().expect("checked length above"))
}

/// Tracks sessions currently reporting write-blocked, in insertion order, so
/// a writable transition can notify them one at a time (§4.2).
#[derive(Default)]
pub struct BlockedWriters {
    order: std::sync::Mutex<VecDeque<u64>>,
    present: DashMap<u64, ()>,
}

impl BlockedWriters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `session_id` blocked. No-op if already tracked.
    pub fn mark_blocked(&self, session_id: u64) {
        if self.present.insert(session_id, ()).is_none() {
            self.order.lock().expect("blocked-writers mutex poisoned").push_back(session_id);
        }
    }

    /// Removes `session_id` from the blocked set, e.g. once it has drained
    /// its own backlog.
    pub fn clear(&self, session_id: u64) {
        if self.present.remove(&session_id).is_some() {
            self.order
                .lock()
                .expect("blocked-writers mutex poisoned")
                .retain(|id| *id != session_id);
        }
    }

    /// Pops the next blocked session in insertion order, if any.
    pub fn pop_next(&self) -> Option<u64> {
        let mut order = self.order.lock().expect("blocked-writers mutex poisoned");
        while let Some(id) = order.pop_front() {
            if self.present.remove(&id).is_some() {
                return Some(id);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}
