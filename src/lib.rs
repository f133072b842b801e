// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bridging engine for a QUIC-like transport ("PUIC") and TCP tunnels.
//!
//! See `src/bin/puic_agent` and `src/bin/puic_proxy` for the two processes
//! built on top of this crate.

pub mod cfg;
pub mod error;
pub mod job;
pub mod manager;
pub mod tcp;
pub mod transport;

/// Which side of the tunnel a process is running as. Named after the two
/// binaries rather than "client"/"server" to avoid confusion with the TCP
/// client/server roles on the other side of the bridge (a `puic-proxy`
/// dials TCP but listens for PUIC; a `puic-agent` does the opposite).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Proxy,
}
