// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `puic-agent`: accepts local TCP connections and tunnels each one over a
//! dialed PUIC session to a `puic-proxy` (§4.5, agent-inbound job).

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
    tcp,
    transport::puic::{PuicDialer, QuinnDialer},
    Role,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

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

    let config = RuntimeConfig::from_args(Role::Agent, args).context("invalid configuration")?;
    let _guard = logger::init_logger(LogConfig::default()).context("failed to initialize logger")?;

    info!(listen = ?config.listen.addrs, forward = %config.forward.addr, "starting puic-agent");

    let dialer = std::sync::Arc::new(
        QuinnDialer::new(&config.puic, "puic-proxy").context("failed to build puic dialer")?,
    );
    let manager = SessionManager::new();
    let root_cancel = CancellationToken::new();

    let reap_task = {
        let manager = manager.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move { reap_loop(manager, cancel).await })
    };

    let mut listener_tasks = Vec::new();
    for addr in &config.listen.addrs {
        let listener = tcp::endpoint::bind(*addr).await.context("failed to bind listen address")?;
        let dialer = dialer.clone();
        let manager = manager.clone();
        let forward_addr = config.forward.addr;
        let cancel = root_cancel.clone();

        listener_tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = tcp::endpoint::accept(&listener) => {
                        match accepted {
                            Ok(tcp_endpoint) => {
                                let dialer = dialer.clone();
                                let manager = manager.clone();
                                let job_cancel = cancel.child_token();
                                tokio::spawn(async move {
                                    if let Err(err) = start_agent_job(tcp_endpoint, forward_addr, dialer, manager, job_cancel).await {
                                        warn!(%err, "agent-inbound job setup failed");
                                    }
                                });
                            },
                            Err(err) => warn!(%err, "tcp accept failed"),
                        }
                    }
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("failed waiting for ctrl-c")?;
    info!("shutting down");
    root_cancel.cancel();
    manager.cancel_all();
    for task in listener_tasks {
        task.abort();
    }
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

/// Agent-inbound job entry point (§4.5): TCP accept already happened;
/// dial the PUIC session, then hand both ends to a [`BridgeJob`].
async fn start_agent_job(
    tcp_endpoint: tcp::endpoint::TcpEndpoint,
    forward_addr: std::net::SocketAddr,
    dialer: std::sync::Arc<impl PuicDialer + 'static>,
    manager: std::sync::Arc<SessionManager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let session = dialer.dial(forward_addr).await.context("failed to dial puic proxy")?;
    let session_id = session.id();
    let job = BridgeJob::for_agent(tcp_endpoint, session, cancel.clone());
    manager.spawn_job(session_id, job, cancel);
    Ok(())
}
