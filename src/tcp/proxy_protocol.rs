// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PROXY protocol v1 header emission (§6.2, C4).
//!
//! The proxy writes this header to the downstream TCP connection before any
//! tunneled bytes so the backend can recover the original client address.
//! Field order: `PROXY TCP4|TCP6 <src> <dst> <src-port> <dst-port>\r\n`.

use std::net::SocketAddr;

/// Renders the PROXY v1 header line for a connection originating at `src`
/// and terminating (from the backend's point of view) at `dst`.
pub fn format_header(src: SocketAddr, dst: SocketAddr) -> String {
    let proto = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {proto} {} {} {} {}\r\n",
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
}
