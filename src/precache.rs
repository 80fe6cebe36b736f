// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The precache queue: a time-ordered list of `(number, context)` entries,
//! each driving one full precache push to our subscribers when due. A
//! successful push re-times its entry from the answers' expiration, so a
//! mapped number keeps refreshing its subscribers' caches.

use std::time::{Duration, Instant};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::EngineHandle;

/// Introspection snapshot of one queued precache.
#[derive(Debug, Clone)]
pub struct PrecacheEntry {
    pub number: String,
    pub context: String,
    pub due_in: Duration,
}

#[derive(Debug)]
enum PrecacheCmd {
    Reschedule {
        number: String,
        context: String,
        delay_secs: u64,
    },
    Entries(oneshot::Sender<Vec<PrecacheEntry>>),
}

/// Handle feeding the precache runner.
#[derive(Debug, Clone)]
pub struct PrecacheHandle {
    tx: mpsc::Sender<PrecacheCmd>,
}

impl PrecacheHandle {
    pub async fn reschedule(&self, number: String, context: String, delay_secs: u64) {
        let _ = self
            .tx
            .send(PrecacheCmd::Reschedule {
                number,
                context,
                delay_secs,
            })
            .await;
    }

    pub async fn entries(&self) -> Vec<PrecacheEntry> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PrecacheCmd::Entries(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[derive(Debug)]
struct QueueEntry {
    number: String,
    context: String,
    due: Instant,
}

/// Spawns the queue runner. Due entries fire a full precache push through
/// the engine; the push itself runs as its own task so a slow fan-out
/// never stalls the queue.
pub fn spawn_precache_runner(
    engine: EngineHandle,
    default_ttl: u16,
    cancel: CancellationToken,
) -> (PrecacheHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PrecacheCmd>(256);
    let handle = PrecacheHandle { tx: tx.clone() };
    let task = tokio::spawn(async move {
        let mut queue: Vec<QueueEntry> = Vec::new();
        loop {
            let next_due = queue.first().map(|e| e.due);
            let sleep_until = next_due
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        PrecacheCmd::Reschedule { number, context, delay_secs } => {
                            queue.retain(|e| {
                                e.number != number || !e.context.eq_ignore_ascii_case(&context)
                            });
                            let due = Instant::now() + Duration::from_secs(delay_secs);
                            let at = queue
                                .iter()
                                .position(|e| e.due > due)
                                .unwrap_or(queue.len());
                            queue.insert(at, QueueEntry { number, context, due });
                        },
                        PrecacheCmd::Entries(reply) => {
                            let now = Instant::now();
                            let _ = reply.send(
                                queue
                                    .iter()
                                    .map(|e| PrecacheEntry {
                                        number: e.number.clone(),
                                        context: e.context.clone(),
                                        due_in: e.due.saturating_duration_since(now),
                                    })
                                    .collect(),
                            );
                        },
                    }
                },
                _ = tokio::time::sleep_until(sleep_until.into()), if next_due.is_some() => {
                    let entry = queue.remove(0);
                    debug!(number = %entry.number, context = %entry.context,
                           "running scheduled precache");
                    let engine = engine.clone();
                    let requeue = tx.clone();
                    tokio::spawn(async move {
                        let reply = engine
                            .precache_internal(
                                entry.context.clone(),
                                entry.number.clone(),
                                default_ttl,
                                Vec::new(),
                            )
                            .await;
                        if let Ok(reply) = reply
                            && reply.found_answers > 0
                            && reply.expiration > 0
                        {
                            let _ = requeue
                                .send(PrecacheCmd::Reschedule {
                                    number: entry.number,
                                    context: entry.context,
                                    delay_secs: reply.expiration as u64,
                                })
                                .await;
                        }
                    });
                },
            }
        }
    });
    (handle, task)
}
