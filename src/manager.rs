// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session registry and job lifecycle (§4.6, C6).
//!
//! A `DashMap` keyed registry, a `OnceCell<Weak<Self>>` so spawned tasks can
//! reach back to the manager without creating a reference cycle, and
//! deferred destruction — a "graveyard" queue drained once per call to
//! [`SessionManager::reap`] rather than inline from the task that finishes,
//! since a job must never be freed from within its own completion callback.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::job::bridge::BridgeJob;

struct JobEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns every bridging job for one process (one `puic-agent` or
/// `puic-proxy` instance). Jobs are looked up by session id for the
/// lifetime callbacks the PUIC shim raises (disconnect, blocked/writable).
pub struct SessionManager {
    jobs: DashMap<u64, JobEntry>,
    graveyard: Mutex<Vec<u64>>,
    self_weak: OnceCell<Weak<SessionManager>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self {
            jobs: DashMap::new(),
            graveyard: Mutex::new(Vec::new()),
            self_weak: OnceCell::new(),
        });
        manager
            .self_weak
            .set(Arc::downgrade(&manager))
            .expect("self_weak set exactly once at construction");
        manager
    }

    fn weak_self(&self) -> Weak<SessionManager> {
        self.self_weak
            .get()
            .expect("self_weak always set in SessionManager::new")
            .clone()
    }

    /// Registers and starts a bridging job under `session_id`. Spawns the
    /// job's run loop as its own task and a small reaper task that queues
    /// the session id for deferred removal once the job exits, instead of
    /// removing it from `jobs` directly (that would race a concurrent
    /// lookup in-flight for the same session id).
    pub fn spawn_job(&self, session_id: u64, job: BridgeJob, cancel: CancellationToken) {
        let weak = self.weak_self();
        let task = tokio::spawn(async move {
            job.run().await;
            if let Some(manager) = weak.upgrade() {
                manager.graveyard.lock().await.push(session_id);
            }
        });

        if let Some(previous) = self.jobs.insert(session_id, JobEntry { cancel, task }) {
            warn!(session = session_id, "session id reused before previous job reaped");
            previous.cancel.cancel();
            previous.task.abort();
        }
    }

    /// Cancels the job for `session_id`, if one is registered. Used when
    /// the PUIC shim reports the underlying session has disconnected.
    pub fn cancel(&self, session_id: u64) {
        if let Some(entry) = self.jobs.get(&session_id) {
            entry.cancel.cancel();
        }
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.jobs.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drains the graveyard, removing every job that has finished running.
    /// Mirrors the original agent's `ProxyManager::Monitor`, which is
    /// called once per event-loop iteration; here it's intended to be
    /// called from a periodic tick in the binary's main loop.
    pub async fn reap(&self) {
        let finished: Vec<u64> = std::mem::take(&mut *self.graveyard.lock().await);
        for session_id in finished {
            if let Some((_, entry)) = self.jobs.remove(&session_id) {
                debug!(session = session_id, "reaped finished bridging job");
                debug_assert!(entry.task.is_finished(), "only the job's own reaper queues it for reap");
            }
        }
    }

    /// Cancels every registered job; used on process shutdown.
    pub fn cancel_all(&self) {
        for entry in self.jobs.iter() {
            entry.cancel.cancel();
        }
    }
}
