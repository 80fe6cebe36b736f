// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The protocol engine: one network-loop task owning the UDP socket, the
//! timer wheel and all transaction state, plus the handle user code talks
//! to over a message channel.

/// The network loop.
mod event_loop;
/// Timer wheel.
pub mod sched;
/// Transactions and their retransmission state.
pub mod transaction;
/// Server-side evaluation tasks.
pub mod workers;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use transaction::TransactionSummary;

use crate::{
    cache::DEFAULT_CACHE_TIME,
    cfg::config::Config,
    dialplan::Dialplan,
    models::{Cause, Command, Eid, Tech},
    peer::PeerSummary,
    precache::{PrecacheEntry, PrecacheHandle, spawn_precache_runner},
    request::{
        EntityInfo, HintMeta, JobSpec, LookupJob, LookupMode, LookupReply, LookupResult,
        RequestError, RequestSummary, sort_results,
    },
    store::Store,
};

/// Introspection snapshot of one mapping.
#[derive(Debug, Clone)]
pub struct MappingSummary {
    pub dcontext: String,
    pub lcontext: String,
    pub weight: u16,
    pub tech: Tech,
    pub dest: String,
    pub options: String,
}

/// A worker's finished contribution, converted to wire elements by the
/// loop.
#[derive(Debug, Default)]
pub struct ResponseBody {
    pub answers: Vec<LookupResult>,
    pub hmd: Option<HintMeta>,
    pub expiration: Option<u16>,
    pub entity: Option<EntityInfo>,
    pub cause: Option<(Cause, String)>,
}

/// Messages into the network loop.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    Submit(LookupJob),
    SendPrecache {
        request: u64,
        trans: u16,
        generation: u64,
        answers: Vec<LookupResult>,
        hmd: HintMeta,
        expiration: u32,
    },
    WorkerDone {
        trans: u16,
        generation: u64,
        cmd: Command,
        body: ResponseBody,
    },
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Transactions(oneshot::Sender<Vec<TransactionSummary>>),
    Requests(oneshot::Sender<Vec<RequestSummary>>),
    Mappings(oneshot::Sender<Vec<MappingSummary>>),
    FlushCache(oneshot::Sender<()>),
    FlushStats(oneshot::Sender<()>),
}

/// Cloneable handle into the network loop, shared by the public API, the
/// worker tasks and the precache runner.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
}

impl EngineHandle {
    /// Submits a request and waits for its completion.
    pub(crate) async fn submit(&self, spec: JobSpec) -> Result<LookupReply, RequestError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Submit(LookupJob { spec, done }))
            .await
            .map_err(|_| RequestError::EngineDown)?;
        rx.await.map_err(|_| RequestError::EngineDown)?
    }

    /// Runs a full precache push for a number in a context.
    pub(crate) async fn precache_internal(
        &self,
        dcontext: String,
        number: String,
        ttl: u16,
        avoid: Vec<Eid>,
    ) -> Result<LookupReply, RequestError> {
        self.submit(JobSpec {
            number,
            dcontext,
            mode: LookupMode::Precache,
            query_eid: None,
            ttl,
            cbypass: false,
            avoid_direct: vec![false; avoid.len()],
            avoid,
            skip: None,
            block_empty: false,
            push_routes: false,
            hmd: HintMeta::default(),
            expiration: DEFAULT_CACHE_TIME,
        })
        .await
    }

    pub(crate) async fn worker_done(
        &self,
        trans: u16,
        generation: u64,
        cmd: Command,
        body: ResponseBody,
    ) {
        let _ = self
            .tx
            .send(EngineMsg::WorkerDone {
                trans,
                generation,
                cmd,
                body,
            })
            .await;
    }

    pub(crate) async fn send_precache(
        &self,
        request: u64,
        trans: u16,
        generation: u64,
        answers: Vec<LookupResult>,
        hmd: HintMeta,
        expiration: u32,
    ) {
        let _ = self
            .tx
            .send(EngineMsg::SendPrecache {
                request,
                trans,
                generation,
                answers,
                hmd,
                expiration,
            })
            .await;
    }

    async fn snapshot<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineMsg,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .ok()
            .context("engine is down")?;
        rx.await.context("engine is down")
    }
}

/// Per-call options for [`Engine::lookup_with`].
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    pub number: String,
    pub context: Option<String>,
    pub cbypass: bool,
    /// Hop budget override; the configured TTL applies when absent.
    pub ttl: Option<u16>,
    /// Entities to avoid, root last.
    pub avoid: Vec<Eid>,
}

/// A running DUNDi engine.
pub struct Engine {
    handle: EngineHandle,
    precache: PrecacheHandle,
    local_eid: Eid,
    local_addr: std::net::SocketAddr,
    default_ttl: u16,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Binds the UDP socket and starts the network loop and the precache
    /// runner.
    pub async fn spawn(
        config: Config,
        dialplan: Arc<dyn Dialplan>,
        store: Store,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((config.general.bindaddr, config.general.port))
            .await
            .with_context(|| {
                format!(
                    "unable to bind to {}:{}",
                    config.general.bindaddr, config.general.port
                )
            })?;
        let bound = socket.local_addr()?;
        let tos = config.general.tos.bits();
        if tos != 0 {
            debug!(tos, "type-of-service marking configured");
        }
        let local_eid = match config.general.entityid {
            Some(eid) => eid,
            None => {
                let eid = Eid::generate();
                info!(%eid, "no entityid configured, generated one");
                eid
            },
        };
        let default_ttl = config.general.ttl;

        let (tx, rx) = mpsc::channel(1024);
        let handle = EngineHandle { tx };
        let cancel = CancellationToken::new();

        let (precache, precache_task) =
            spawn_precache_runner(handle.clone(), default_ttl, cancel.clone());

        let core = event_loop::Core::new(
            socket,
            rx,
            handle.clone(),
            cancel.clone(),
            &config,
            local_eid,
            dialplan.clone(),
            store,
        );
        let loop_task = tokio::spawn(core.run());

        info!(eid = %local_eid, addr = %bound, "engine ready and listening");

        // Outbound precache peers get the whole local dialplan queued.
        if config.any_precache_outbound() {
            for (dcontext, maps) in &config.mappings {
                for map in maps {
                    for exten in dialplan.extensions(&map.lcontext) {
                        precache.reschedule(exten, dcontext.clone(), 0).await;
                    }
                }
            }
        }

        Ok(Engine {
            handle,
            precache,
            local_eid,
            local_addr: bound,
            default_ttl,
            cancel,
            tasks: vec![loop_task, precache_task],
        })
    }

    pub fn local_eid(&self) -> Eid {
        self.local_eid
    }

    /// The address the engine's socket is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Resolves a number within a context (`e164` when unspecified),
    /// blocking until every consulted peer answered or the TTL budget
    /// elapsed. Results come back sorted by ascending weight.
    pub async fn lookup(
        &self,
        number: &str,
        context: Option<&str>,
        cbypass: bool,
    ) -> Result<Vec<LookupResult>> {
        let reply = self
            .lookup_with(LookupOptions {
                number: number.to_string(),
                context: context.map(str::to_string),
                cbypass,
                ttl: None,
                avoid: Vec::new(),
            })
            .await?;
        Ok(reply.results)
    }

    /// Lookup with explicit options, returning the full reply including
    /// hint metadata.
    pub async fn lookup_with(&self, opts: LookupOptions) -> Result<LookupReply> {
        let avoid_direct = vec![false; opts.avoid.len()];
        let reply = self
            .handle
            .submit(JobSpec {
                number: opts.number,
                dcontext: opts.context.unwrap_or_else(|| "e164".to_string()),
                mode: LookupMode::Lookup,
                query_eid: None,
                ttl: opts.ttl.unwrap_or(self.default_ttl),
                cbypass: opts.cbypass,
                avoid: opts.avoid,
                avoid_direct,
                skip: None,
                block_empty: false,
                push_routes: false,
                hmd: HintMeta::assume_dont_ask(),
                expiration: DEFAULT_CACHE_TIME,
            })
            .await;
        match reply {
            Ok(mut reply) => {
                sort_results(&mut reply.results);
                Ok(reply)
            },
            Err(e) => bail!(e),
        }
    }

    /// Retrieves contact information for a specific entity.
    pub async fn query_eid(
        &self,
        eid: Eid,
        context: Option<&str>,
    ) -> Result<Option<EntityInfo>> {
        let reply = self
            .handle
            .submit(JobSpec {
                number: String::new(),
                dcontext: context.unwrap_or("e164").to_string(),
                mode: LookupMode::EidQuery,
                query_eid: Some(eid),
                ttl: self.default_ttl,
                cbypass: false,
                avoid: Vec::new(),
                avoid_direct: Vec::new(),
                skip: None,
                block_empty: false,
                push_routes: false,
                hmd: HintMeta::default(),
                expiration: DEFAULT_CACHE_TIME,
            })
            .await;
        match reply {
            Ok(reply) => Ok(reply.entity),
            Err(e) => bail!(e),
        }
    }

    /// Queues a proactive precache push; the runner performs it as soon as
    /// it is due and keeps re-timing it from the answers' expiration.
    pub async fn precache(&self, context: &str, number: &str) -> Result<()> {
        self.precache
            .reschedule(number.to_string(), context.to_string(), 0)
            .await;
        Ok(())
    }

    pub async fn peer_summaries(&self) -> Result<Vec<PeerSummary>> {
        self.handle.snapshot(EngineMsg::Peers).await
    }

    pub async fn transaction_summaries(&self) -> Result<Vec<TransactionSummary>> {
        self.handle.snapshot(EngineMsg::Transactions).await
    }

    pub async fn request_summaries(&self) -> Result<Vec<RequestSummary>> {
        self.handle.snapshot(EngineMsg::Requests).await
    }

    pub async fn mapping_summaries(&self) -> Result<Vec<MappingSummary>> {
        self.handle.snapshot(EngineMsg::Mappings).await
    }

    pub async fn precache_entries(&self) -> Result<Vec<PrecacheEntry>> {
        Ok(self.precache.entries().await)
    }

    /// Drops every cached answer and hint.
    pub async fn flush_cache(&self) -> Result<()> {
        self.handle.snapshot(EngineMsg::FlushCache).await
    }

    /// Clears peer timing histories and averages.
    pub async fn flush_stats(&self) -> Result<()> {
        self.handle.snapshot(EngineMsg::FlushStats).await
    }

    /// Stops the network loop and the precache runner.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
