// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the bridging engine.
//!
//! Errors below the job boundary are never propagated upward as process
//! failures: a [`BridgeError`] causes its owning job to transition to
//! `Closing` (see [`crate::job::bridge`]) and is otherwise only logged.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can terminate a single bridging job.
///
/// None of these variants are retried; per the job model every error path
/// is terminal for the affected tunnel (see the module docs on
/// [`crate::job::bridge`]).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("tcp io error during {op}: {source}")]
    TransportIo {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("puic protocol error (code={code}, from_remote={from_remote}): {details}")]
    PuicProtocol {
        code: i32,
        from_remote: bool,
        details: String,
    },

    /// The shim was asked to write to a stream that already sent FIN. The
    /// core never triggers this on any of its own code paths; seeing it
    /// indicates a bridging-job bug, not a peer misbehavior.
    #[error("write after fin on stream {stream_id}")]
    PuicWriteAfterFin { stream_id: u64 },

    #[error("no bridging job registered for session {0:#x}")]
    UnknownSession(u64),

    #[error("proxy-protocol header write failed: {0}")]
    ProxyProtocol(#[source] std::io::Error),
}

/// Errors raised while parsing configuration / CLI arguments.
///
/// These surface a line to stderr and cause the process to exit with
/// status 1; they never reach a running job.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required flag {0}")]
    MissingFlag(&'static str),

    #[error("unknown flag {0}")]
    UnknownFlag(String),

    #[error("flag {flag} expects a value")]
    MissingValue { flag: &'static str },

    #[error("invalid address {addr:?} for flag {flag}: {source}")]
    InvalidAddress {
        flag: &'static str,
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("too many -l addresses: {0} (max 256)")]
    TooManyListeners(usize),

    #[error("LOW_WATER ({low}) must be less than HIGH_WATER ({high})")]
    BadWatermarks { low: usize, high: usize },
}

/// Result of a UDP endpoint send attempt (§4.1). Not an error: a blocked
/// send is an expected, recoverable flow-control signal, so it is kept out
/// of [`BridgeError`] and modeled as its own small enum instead of an
/// `Err` variant that callers would need to special-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Blocked,
}

/// A resolved socket address paired with the flag it came from, used by
/// [`ConfigError::InvalidAddress`] call sites to keep error messages
/// actionable.
pub(crate) fn parse_addr(
    flag: &'static str,
    raw: &str,
) -> Result<SocketAddr, ConfigError> {
    raw.parse::<SocketAddr>()
        .map_err(|source| ConfigError::InvalidAddress {
            flag,
            addr: raw.to_string(),
            source,
        })
}
