// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The bridging job (§4.5, C5): the per-tunnel state machine that couples
//! one TCP endpoint with one PUIC session stream.
//!
//! Structured as an explicit state enum driven by a `tokio::select!` loop: a
//! background task racing socket readiness against a `CancellationToken`,
//! rather than a request/response state-machine trait, which fits a single
//! linear exchange and not a long-lived job with several independent event
//! sources.

use std::sync::{atomic::AtomicBool, Arc};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    job::backpressure::{self, Action},
    tcp::endpoint::TcpEndpoint,
    transport::puic::{PuicSession, ReadOutcome},
    Role,
};

/// Matches `TCPCONN_READBUF_SIZE` in the original proxy.
const TCP_READ_BUF: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    HalfClosedTcpEof,
    HalfClosedPuicEof,
    Closing,
    Dead,
}

/// One tunnel: a TCP endpoint paired with a PUIC session stream.
pub struct BridgeJob {
    role: Role,
    session_id: u64,
    tcp: TcpEndpoint,
    puic: Arc<dyn PuicSession>,
    state: JobState,
    tcp_read_enabled: bool,
    cancel: CancellationToken,
}

impl BridgeJob {
    pub fn for_agent(tcp: TcpEndpoint, puic: Arc<dyn PuicSession>, cancel: CancellationToken) -> Self {
        Self::new(Role::Agent, tcp, puic, cancel)
    }

    pub fn for_proxy(tcp: TcpEndpoint, puic: Arc<dyn PuicSession>, cancel: CancellationToken) -> Self {
        Self::new(Role::Proxy, tcp, puic, cancel)
    }

    fn new(role: Role, tcp: TcpEndpoint, puic: Arc<dyn PuicSession>, cancel: CancellationToken) -> Self {
        let session_id = puic.id();
        Self {
            role,
            session_id,
            tcp,
            puic,
            state: JobState::Starting,
            tcp_read_enabled: true,
            cancel,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Drives the job to completion. Runs until the tunnel is fully torn
    /// down in both directions or the job is cancelled.
    pub async fn run(mut self) {
        self.state = JobState::Running;
        let mut tcp_buf = BytesMut::zeroed(TCP_READ_BUF);

        loop {
            if self.state == JobState::Closing || self.state == JobState::Dead {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(session = self.session_id, ?self.role, "bridging job cancelled");
                    self.state = JobState::Closing;
                }

                result = self.tcp.stream_mut().read(&mut tcp_buf), if self.tcp_read_enabled && self.state != JobState::HalfClosedTcpEof => {
                    if let Err(err) = self.handle_tcp_readable(result, &tcp_buf).await {
                        warn!(session = self.session_id, ?self.role, %err, "tcp->puic path failed");
                        self.state = JobState::Closing;
                    }
                }

                // Guarded the same way as the TCP arm above: once the puic
                // side has already reported Eof, every further read()
                // resolves immediately with another Eof (non-blocking), so
                // without this guard the loop would busy-spin re-running
                // `handle_puic_readable` until the TCP side also reaches
                // EOF instead of waiting on it.
                result = self.puic.read(), if self.state != JobState::HalfClosedPuicEof => {
                    if let Err(err) = self.handle_puic_readable(result).await {
                        warn!(session = self.session_id, ?self.role, %err, "puic->tcp path failed");
                        self.state = JobState::Closing;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// §4.5 `OnAgentConnRcvd`/`may_tcp_to_puic`: forward bytes read from TCP
    /// onto the PUIC stream, then re-evaluate the write-buffer hysteresis.
    async fn handle_tcp_readable(
        &mut self,
        result: std::io::Result<usize>,
        buf: &BytesMut,
    ) -> Result<(), BridgeError> {
        let n = result.map_err(|source| BridgeError::TransportIo { op: "tcp read", source })?;

        if n == 0 {
            debug!(session = self.session_id, ?self.role, "tcp eof, sending puic fin");
            self.puic.write(&[], true).await?;
            self.state = match self.state {
                JobState::HalfClosedPuicEof => JobState::Closing,
                _ => JobState::HalfClosedTcpEof,
            };
            return Ok(());
        }

        self.puic.write(&buf[..n], false).await?;
        self.apply_backpressure();
        Ok(())
    }

    /// §4.5 `may_puic_to_tcp`: forward bytes read from the PUIC stream onto
    /// TCP; an `Eof` half-closes the TCP write side without killing the job
    /// until the TCP side also reaches EOF (I2/I3: half-close is
    /// independent in each direction).
    async fn handle_puic_readable(&mut self, result: Result<ReadOutcome, BridgeError>) -> Result<(), BridgeError> {
        match result? {
            ReadOutcome::Data(data) => {
                self.tcp
                    .stream_mut()
                    .write_all(&data)
                    .await
                    .map_err(|source| BridgeError::TransportIo { op: "tcp write", source })?;
                Ok(())
            },
            ReadOutcome::Eof => {
                debug!(session = self.session_id, ?self.role, "puic eof, half-closing tcp write");
                self.tcp.shutdown_write().await?;
                self.state = match self.state {
                    JobState::HalfClosedTcpEof => JobState::Closing,
                    _ => JobState::HalfClosedPuicEof,
                };
                Ok(())
            },
        }
    }

    /// I5: toggles `tcp_read_enabled` only when the PUIC write buffer
    /// crosses a watermark; holds the last decision in between.
    fn apply_backpressure(&mut self) {
        match backpressure::decide(self.puic.write_buffered()) {
            Action::DisableRead => self.tcp_read_enabled = false,
            Action::EnableRead => self.tcp_read_enabled = true,
            Action::Hold => {},
        }
    }

    async fn teardown(mut self) {
        self.state = JobState::Dead;
        if let Err(err) = self.tcp.shutdown_write().await {
            debug!(session = self.session_id, ?self.role, %err, "tcp shutdown during teardown (already closed)");
        }
        self.puic.disconnect(0, "bridge job closing").await;
        info!(session = self.session_id, ?self.role, "bridging job torn down");
    }
}

/// Non-owning handle used by the session manager's closed-sessions queue to
/// know when a job has fully drained without holding a strong reference
/// cycle back to the job itself.
pub struct JobHandle {
    pub session_id: u64,
    pub dead: Arc<AtomicBool>,
}
