// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `puic-proxy`: accepts inbound PUIC sessions and tunnels each one to a
//! backend TCP target (§4.5, proxy-outbound job).

use std::process::ExitCode;

use anyhow::Context;
use puic_bridge::{
    cfg::{
        cli::{self, RawArgs},
        config::RuntimeConfig,
        logger::{self, LogConfig},
    },
    job::bridge::BridgeJob,
    manager::SessionManager,
    tcp::{self, proxy_protocol},
    transport::puic::{PuicListener, PuicSession, QuinnListener},
    Role,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args: RawArgs = match cli::parse_args(argv) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            println!("{}", cli::USAGE);
            anyhow::bail!("argument error");
        },
    };

    if args.help {
        println!("{}", cli::USAGE);
        return Ok(());
    }

    let mut config = RuntimeConfig::from_args(Role::Proxy, args).context("invalid configuration")?;
    let _guard = logger::init_logger(LogConfig::default()).context("failed to initialize logger")?;

    // §6.3: proxy's -l is the PUIC listen address; only one is meaningful
    // per `quinn::Endpoint`, so extra -l values are rejected here rather
    // than silently ignored.
    if config.listen.addrs.len() != 1 {
        anyhow::bail!("puic-proxy takes exactly one -l address (got {})", config.listen.addrs.len());
    }
    let puic_listen = config.listen.addrs.remove(0);
    config.puic.bind_addr = puic_listen;

    info!(listen = %puic_listen, forward = %config.forward.addr, use_proxy_protocol = config.use_proxy_protocol, "starting puic-proxy");

    let listener = QuinnListener::new(&config.puic).context("failed to build puic listener")?;
    let manager = SessionManager::new();
    let cancel = CancellationToken::new();

    let reap_task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reap_loop(manager, cancel).await })
    };

    let accept_loop = {
        let manager = manager.clone();
        let forward_addr = config.forward.addr;
        let use_proxy_protocol = config.use_proxy_protocol;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(session) => {
                                let manager = manager.clone();
                                let job_cancel = cancel.child_token();
                                tokio::spawn(async move {
                                    if let Err(err) = start_proxy_job(session, forward_addr, puic_listen, use_proxy_protocol, manager, job_cancel).await {
                                        warn!(%err, "proxy-outbound job setup failed");
                                    }
                                });
                            },
                            Err(err) => warn!(%err, "puic accept failed"),
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("failed waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    manager.cancel_all();
    accept_loop.abort();
    reap_task.abort();
    Ok(())
}

/// §4.6: the session manager's deferred-delete queue is drained once per
/// event-loop iteration in the original; this worker is that tick,
/// realized as a periodic wakeup rather than a callback hook into a
/// single-threaded reactor.
async fn reap_loop(manager: std::sync::Arc<SessionManager>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => manager.reap().await,
        }
    }
}

/// Proxy-outbound job entry point (§4.5): PUIC session already accepted;
/// connect to the backend, optionally emit the PROXY header, then hand
/// both ends to a [`BridgeJob`].
async fn start_proxy_job(
    session: std::sync::Arc<dyn PuicSession>,
    forward_addr: std::net::SocketAddr,
    puic_listen: std::net::SocketAddr,
    use_proxy_protocol: bool,
    manager: std::sync::Arc<SessionManager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let session_id = session.id();
    let mut tcp_endpoint = tcp::endpoint::TcpEndpoint::connect(forward_addr)
        .await
        .context("failed to connect to backend")?;

    if use_proxy_protocol {
        // §6.2: src is the original client as seen by this PUIC session,
        // dst is this proxy's own PUIC listen address — not the new
        // backend connection's local address.
        let header = proxy_protocol::format_header(session.remote_addr(), puic_listen);
        tokio::io::AsyncWriteExt::write_all(tcp_endpoint.stream_mut(), header.as_bytes())
            .await
            .context("failed to write proxy-protocol header")?;
    }

    let job = BridgeJob::for_proxy(tcp_endpoint, session, cancel.clone());
    manager.spawn_job(session_id, job, cancel);
    Ok(())
}
