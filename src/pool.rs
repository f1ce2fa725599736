//! A backend pool: a group of backends sharing one routing policy.
//!
//! The pool task is the only owner of its `Vec<BackendSlot>`, its router
//! state, and its in-flight request arena. It receives parsed client
//! commands over a channel from the frontend listeners that share it, and
//! `BackendEvent`s from the backend tasks it spawns; everything else is
//! plain sequential logic — no locks, no shared mutable state with any
//! other pool or task.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::arena::{Arena, Handle};
use crate::backend::{self, BackendCmd, BackendEvent, BackendSpec, BackendState, RequestTag};
use crate::config::PoolConfig;
use crate::resp::{self, KeyPos, Redirect};
use crate::router::{ClusterSlotMap, Distribution, KetamaRing};
use crate::stats::{SharedStats, Stats};

/// A client-originated command awaiting dispatch to a backend.
pub struct DispatchRequest {
    pub frame: Vec<u8>,
    pub key: KeyPos,
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// What a pending arena slot is waiting on, so a reply can be told apart
/// from a client request that might still need a `-MOVED`/`-ASK` retry.
enum PendingKind {
    /// A real client request; `frame` is kept so it can be resent once to
    /// a redirect target.
    Client { frame: Vec<u8>, redirected: bool },
    /// Proxy-internal requests (`CLUSTER SLOTS`, `ASKING`, health probes)
    /// whose reply has no client waiting on it.
    Other,
}

struct PendingEntry {
    reply: oneshot::Sender<Vec<u8>>,
    kind: PendingKind,
    /// The backend this entry's command was sent to, so [`Pool::complete`]
    /// can also drop the handle from `in_flight_by_backend` instead of
    /// leaking it there for the lifetime of the pool.
    backend: usize,
}

/// Cached, pool-side view of one backend; the authoritative connection
/// state lives in the backend's own task.
struct BackendSlot {
    address: String,
    weight: u32,
    state: BackendState,
    cmd_tx: Option<mpsc::Sender<BackendCmd>>,
    next_retry_at: Option<Instant>,
    consecutive_failure_count: u32,
}

enum LiveSet {
    Modulo { live: Vec<usize> },
    Ketama { ring: KetamaRing, addresses: Vec<String> },
    Cluster { slots: ClusterSlotMap },
}

pub struct Pool {
    name: String,
    backends: Vec<BackendSlot>,
    spec: Vec<BackendSpec>,
    hash_tag: Option<(u8, u8)>,
    timeout: Duration,
    retry_timeout: Duration,
    failure_limit: u32,
    auto_eject_hosts: bool,
    live: LiveSet,
    pending: Arena<PendingEntry>,
    in_flight_by_backend: HashMap<usize, Vec<Handle>>,
    next_cluster_slots_retry: Option<Instant>,
    stats: Arc<SharedStats>,
}

impl Pool {
    pub fn new(name: String, config: &PoolConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms as u64);
        let retry_timeout = Duration::from_millis(config.retry_timeout_ms as u64);
        let hash_tag = if config.hash_tag.is_empty() {
            None
        } else {
            resp::parse_hash_tag(&config.hash_tag)
        };

        let addresses: Vec<(String, u32)> = if config.is_cluster() {
            config
                .cluster_hosts
                .iter()
                .map(|h| (h.clone(), 1))
                .collect()
        } else {
            config
                .parsed_backends(&name)
                .expect("validated at config load")
                .into_iter()
                .map(|(host, port, weight)| (format!("{host}:{port}"), weight))
                .collect()
        };

        let spec: Vec<BackendSpec> = addresses
            .iter()
            .map(|(addr, weight)| BackendSpec {
                address: addr.clone(),
                weight: *weight,
                auth: config.auth.clone(),
                db: config.db,
                timeout,
            })
            .collect();

        let backends: Vec<BackendSlot> = addresses
            .iter()
            .map(|(addr, weight)| BackendSlot {
                address: addr.clone(),
                weight: *weight,
                state: BackendState::Disconnected,
                cmd_tx: None,
                next_retry_at: None,
                consecutive_failure_count: 0,
            })
            .collect();

        let live = match config.distribution {
            Distribution::Modulo => LiveSet::Modulo { live: Vec::new() },
            Distribution::Ketama => LiveSet::Ketama {
                ring: KetamaRing::new(),
                addresses: addresses.iter().map(|(a, _)| a.clone()).collect(),
            },
            Distribution::Cluster => LiveSet::Cluster {
                slots: ClusterSlotMap::new(),
            },
        };

        Self {
            name,
            backends,
            spec,
            hash_tag,
            timeout,
            retry_timeout,
            failure_limit: config.failure_limit,
            auto_eject_hosts: config.auto_eject_hosts,
            live,
            pending: Arena::new(),
            in_flight_by_backend: HashMap::new(),
            next_cluster_slots_retry: None,
            stats: Arc::new(SharedStats::default()),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.live, LiveSet::Cluster { .. })
    }

    /// Clones the pool's shared counters so the frontend listener and
    /// backend tasks it spawns can increment byte/connection counts from
    /// their own tasks without routing through the pool's channel.
    pub fn shared_stats(&self) -> Arc<SharedStats> {
        self.stats.clone()
    }

    /// Spawns every backend's task and starts connecting. Called once when
    /// the pool is brought up, either at startup or after `SWITCHCONFIG`.
    pub fn start(&mut self, event_tx: mpsc::Sender<BackendEvent>) {
        for (idx, spec) in self.spec.iter().enumerate() {
            let cmd_tx = backend::spawn(idx, spec.clone(), event_tx.clone(), self.stats.clone());
            self.backends[idx].cmd_tx = Some(cmd_tx);
            self.backends[idx].state = BackendState::Connecting;
        }
    }

    fn first_live_backend(&self) -> Option<usize> {
        self.backends
            .iter()
            .position(|b| b.state == BackendState::Ready)
    }

    /// Computes a route and dispatches to a backend, or synthesizes an
    /// error reply immediately.
    #[instrument(skip(self, req), fields(pool = %self.name))]
    pub async fn dispatch(&mut self, req: DispatchRequest) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let backend_index = match &req.key {
            KeyPos::Keyless => self.first_live_backend(),
            KeyPos::Key(key) => self.route(key),
        };

        let Some(idx) = backend_index else {
            req.reply.send(resp::proxy_error("Not connected")).ok();
            return;
        };

        if self.backends[idx].state != BackendState::Ready {
            req.reply.send(resp::proxy_error("Not connected")).ok();
            return;
        }

        let frame = req.frame;
        let handle = self.pending.insert(PendingEntry {
            reply: req.reply,
            kind: PendingKind::Client { frame: frame.clone(), redirected: false },
            backend: idx,
        });
        let cmd_tx = self.backends[idx].cmd_tx.clone().expect("ready backend has a sender");
        if cmd_tx
            .send(BackendCmd::Send {
                handle,
                frame,
                tag: RequestTag::Client,
            })
            .await
            .is_err()
        {
            if let Some(entry) = self.pending.remove(handle) {
                entry.reply.send(resp::proxy_error("Not connected")).ok();
            }
            return;
        }
        self.in_flight_by_backend.entry(idx).or_default().push(handle);
    }

    fn route(&self, key: &[u8]) -> Option<usize> {
        match &self.live {
            LiveSet::Modulo { live } => {
                if live.is_empty() {
                    return None;
                }
                let pick = crate::router::modulo_pick(key, live.len()).ok()?;
                Some(live[pick])
            }
            LiveSet::Ketama { ring, .. } => ring.pick(key).ok(),
            LiveSet::Cluster { slots } => slots.backend_for_key(key).ok(),
        }
    }

    /// Handles one event from a backend task: replies, timeouts, faults,
    /// state transitions, and the corresponding live-set recomputation.
    #[instrument(skip(self, event), fields(pool = %self.name))]
    pub fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Ready { backend } => self.on_backend_ready(backend),
            BackendEvent::Reply { backend, handle, tag, frame } => {
                self.on_reply(backend, handle, tag, frame)
            }
            BackendEvent::Timeout { handle, .. } => {
                self.complete(handle, resp::proxy_timeout());
            }
            BackendEvent::Fault { backend, error } => {
                warn!(pool = %self.name, backend, %error, "backend fault");
                self.on_backend_lost(backend);
            }
            BackendEvent::ProbeOk { backend, handle } => {
                self.pending.remove(handle);
                self.on_backend_ready(backend);
            }
            BackendEvent::ProbeFailed { backend, handle } => {
                self.pending.remove(handle);
                self.on_backend_lost(backend);
            }
            BackendEvent::Stopped { .. } => {}
        }
    }

    fn on_reply(&mut self, backend: usize, handle: Handle, tag: RequestTag, frame: Vec<u8>) {
        if matches!(tag, RequestTag::ClusterSlots) {
            self.pending.remove(handle);
            self.apply_cluster_slots_reply(&frame);
            return;
        }
        if matches!(tag, RequestTag::Asking) {
            // The ASKING ack carries no client-visible effect; the retried
            // command that follows it is what the client actually waits on.
            self.pending.remove(handle);
            return;
        }
        if tag == RequestTag::Client {
            self.stats.responses.fetch_add(1, Ordering::Relaxed);
        }
        self.backends[backend].consecutive_failure_count = 0;

        if tag == RequestTag::Client && self.is_cluster() {
            if let Some(redirect) = resp::parse_redirect(&frame) {
                if self.try_redirect(handle, frame.clone(), redirect) {
                    return;
                }
            }
        }
        self.complete(handle, frame);
    }

    /// Handles a `-MOVED`/`-ASK` reply to a cluster-routed client request:
    /// resends the original command once to the indicated backend.
    /// Returns `true` if the reply was consumed (either
    /// retried or forwarded as the final error) and the caller must not
    /// also call `complete`.
    fn try_redirect(&mut self, handle: Handle, error_frame: Vec<u8>, redirect: Redirect) -> bool {
        let Some(entry) = self.pending.remove(handle) else {
            return true;
        };
        let PendingEntry { reply, kind, .. } = entry;
        let PendingKind::Client { frame, redirected } = kind else {
            reply.send(error_frame).ok();
            return true;
        };
        if redirected {
            // Already retried once; only a single redirect hop is allowed.
            reply.send(error_frame).ok();
            return true;
        }

        let address = match &redirect {
            Redirect::Moved { address } | Redirect::Ask { address } => address.clone(),
        };
        let Some(target) = self.backends.iter().position(|b| b.address == address) else {
            reply.send(error_frame).ok();
            return true;
        };
        if self.backends[target].state != BackendState::Ready {
            reply.send(error_frame).ok();
            return true;
        }

        if matches!(redirect, Redirect::Moved { .. }) {
            self.refresh_cluster_slots(target);
        }

        let cmd_tx = self.backends[target]
            .cmd_tx
            .clone()
            .expect("ready backend has a sender");
        let new_handle = self.pending.insert(PendingEntry {
            reply,
            kind: PendingKind::Client { frame: frame.clone(), redirected: true },
            backend: target,
        });

        if matches!(redirect, Redirect::Ask { .. }) {
            let asking_handle = self.pending.insert(PendingEntry {
                reply: dummy_probe_reply(),
                kind: PendingKind::Other,
                backend: target,
            });
            let _ = cmd_tx.try_send(BackendCmd::Send {
                handle: asking_handle,
                frame: resp::array_of_bulk(&["ASKING".to_string()]),
                tag: RequestTag::Asking,
            });
        }

        let sent = cmd_tx.try_send(BackendCmd::Send {
            handle: new_handle,
            frame,
            tag: RequestTag::Client,
        });
        if sent.is_err() {
            if let Some(entry) = self.pending.remove(new_handle) {
                entry.reply.send(resp::proxy_error("Not connected")).ok();
            }
        } else {
            self.in_flight_by_backend.entry(target).or_default().push(new_handle);
        }
        true
    }

    /// Issues a `CLUSTER SLOTS` discovery/refresh request to `backend_idx`.
    /// Its reply never has a client waiting on it; [`Self::on_reply`] routes
    /// `RequestTag::ClusterSlots` replies to [`Self::apply_cluster_slots_reply`]
    /// instead of completing a pending client request.
    fn refresh_cluster_slots(&mut self, backend_idx: usize) {
        let Some(cmd_tx) = self.backends[backend_idx].cmd_tx.clone() else {
            return;
        };
        let handle = self.pending.insert(PendingEntry {
            reply: dummy_probe_reply(),
            kind: PendingKind::Other,
            backend: backend_idx,
        });
        let frame = resp::array_of_bulk(&["CLUSTER".to_string(), "SLOTS".to_string()]);
        let _ = cmd_tx.try_send(BackendCmd::Send {
            handle,
            frame,
            tag: RequestTag::ClusterSlots,
        });
    }

    /// Applies a `CLUSTER SLOTS` reply to the pool's slot map, matching
    /// each reported master address against this pool's known backends.
    /// Masters the pool doesn't already have a connection for are skipped:
    /// this proxy routes within its configured backend set and never
    /// dials addresses discovered only via cluster topology.
    fn apply_cluster_slots_reply(&mut self, frame: &[u8]) {
        let ranges = match resp::parse_cluster_slots(frame) {
            Ok(ranges) => ranges,
            Err(error) => {
                warn!(pool = %self.name, %error, "failed to parse CLUSTER SLOTS reply");
                return;
            }
        };
        let LiveSet::Cluster { slots } = &mut self.live else {
            return;
        };
        let mut next = ClusterSlotMap::new();
        for (start, end, host, port) in ranges {
            let address = format!("{host}:{port}");
            if let Some(idx) = self.backends.iter().position(|b| b.address == address) {
                next.assign_range(start, end, idx);
            }
        }
        let became_ready = !slots.is_ready() && next.is_ready();
        *slots = next;
        if became_ready {
            info!(pool = %self.name, "cluster slot map fully discovered");
        }
    }

    fn complete(&mut self, handle: Handle, frame: Vec<u8>) {
        if let Some(entry) = self.pending.remove(handle) {
            if let Some(in_flight) = self.in_flight_by_backend.get_mut(&entry.backend) {
                if let Some(pos) = in_flight.iter().position(|h| *h == handle) {
                    in_flight.swap_remove(pos);
                }
            }
            entry.reply.send(frame).ok();
        }
    }

    /// Backend entered `Ready`: recompute the live set in O(1)/O(W) without
    /// touching unrelated backends' routing.
    fn on_backend_ready(&mut self, idx: usize) {
        self.backends[idx].state = BackendState::Ready;
        self.backends[idx].consecutive_failure_count = 0;
        info!(pool = %self.name, backend = idx, address = %self.backends[idx].address, "backend ready");
        let mut needs_slot_discovery = false;
        match &mut self.live {
            LiveSet::Modulo { live } => {
                if !live.contains(&idx) {
                    live.push(idx);
                    live.sort_unstable();
                }
            }
            LiveSet::Ketama { ring, addresses } => {
                let weight = self.backends[idx].weight as usize;
                ring.insert_backend(idx, &addresses[idx], weight, addresses.as_slice());
            }
            LiveSet::Cluster { slots } => {
                needs_slot_discovery = !slots.is_ready();
            }
        }
        if needs_slot_discovery {
            self.refresh_cluster_slots(idx);
        }
    }

    /// Backend left `Ready` (fault or ejection): remove it from routing and
    /// fail every request still queued for it.
    fn on_backend_lost(&mut self, idx: usize) {
        let was_ready = self.backends[idx].state == BackendState::Ready;
        self.backends[idx].consecutive_failure_count += 1;
        let count = self.backends[idx].consecutive_failure_count;

        let eject = self.auto_eject_hosts
            && !self.is_cluster()
            && count >= self.failure_limit;
        self.backends[idx].state = if eject {
            BackendState::Ejected
        } else {
            BackendState::Failed
        };
        self.backends[idx].next_retry_at = Some(Instant::now() + self.retry_timeout);

        if was_ready {
            match &mut self.live {
                LiveSet::Modulo { live } => live.retain(|&i| i != idx),
                LiveSet::Ketama { ring, addresses } => {
                    ring.remove_backend(idx, &addresses[idx], self.backends[idx].weight as usize)
                }
                LiveSet::Cluster { .. } => {}
            }
        }

        if let Some(handles) = self.in_flight_by_backend.remove(&idx) {
            for handle in handles {
                self.complete(handle, resp::proxy_error("Not connected"));
            }
        }
    }

    /// Called on the reactor's ~1ms timer tick: reconnects `Failed`
    /// backends and advances `Ejected` ones to `Probing`.
    pub fn on_tick(&mut self, event_tx: &mpsc::Sender<BackendEvent>) {
        let now = Instant::now();
        for idx in 0..self.backends.len() {
            let slot = &self.backends[idx];
            let due = slot.next_retry_at.map(|at| now >= at).unwrap_or(false);
            if !due {
                continue;
            }
            match slot.state {
                BackendState::Failed => {
                    self.backends[idx].next_retry_at = None;
                    self.backends[idx].state = BackendState::Connecting;
                    let cmd_tx = backend::spawn(idx, self.spec[idx].clone(), event_tx.clone(), self.stats.clone());
                    self.backends[idx].cmd_tx = Some(cmd_tx);
                }
                BackendState::Ejected => {
                    self.backends[idx].next_retry_at = None;
                    self.backends[idx].state = BackendState::Probing;
                    let handle = self.pending.insert(PendingEntry {
                        reply: dummy_probe_reply(),
                        kind: PendingKind::Other,
                        backend: idx,
                    });
                    if let Some(cmd_tx) = &self.backends[idx].cmd_tx {
                        let _ = cmd_tx.try_send(BackendCmd::Probe { handle });
                    } else {
                        let cmd_tx = backend::spawn(idx, self.spec[idx].clone(), event_tx.clone(), self.stats.clone());
                        let _ = cmd_tx.try_send(BackendCmd::Probe { handle });
                        self.backends[idx].cmd_tx = Some(cmd_tx);
                    }
                }
                _ => {}
            }
        }

        if self.is_cluster() {
            let not_ready = matches!(&self.live, LiveSet::Cluster { slots } if !slots.is_ready());
            if not_ready {
                let due = self
                    .next_cluster_slots_retry
                    .map(|at| now >= at)
                    .unwrap_or(true);
                if due {
                    if let Some(idx) = self.first_live_backend() {
                        self.refresh_cluster_slots(idx);
                    }
                    self.next_cluster_slots_retry = Some(now + self.retry_timeout);
                }
            }
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Drives this pool's cooperative event loop: one `tokio::select!` over
    /// dispatch requests from the frontend, events from backend tasks, the
    /// ~1ms retry/probe timer, and admin control commands. Runs until the
    /// pool is shut down (config swap removed it, or the process exits).
    pub async fn run(
        mut self,
        mut dispatch_rx: mpsc::Receiver<DispatchRequest>,
        mut control_rx: mpsc::Receiver<PoolControl>,
    ) {
        let (event_tx, mut event_rx) = mpsc::channel(1024);
        self.start(event_tx.clone());
        let mut ticker = tokio::time::interval(Duration::from_millis(1));

        loop {
            tokio::select! {
                Some(req) = dispatch_rx.recv() => {
                    self.dispatch(req).await;
                }
                Some(event) = event_rx.recv() => {
                    self.handle_backend_event(event);
                }
                _ = ticker.tick() => {
                    self.on_tick(&event_tx);
                }
                Some(ctrl) = control_rx.recv() => {
                    match ctrl {
                        PoolControl::StatsSnapshot(reply) => {
                            reply.send(self.stats()).ok();
                        }
                        PoolControl::Shutdown => break,
                    }
                }
                else => break,
            }
        }
    }
}

/// Out-of-band commands the supervisor sends to a running pool task.
pub enum PoolControl {
    StatsSnapshot(oneshot::Sender<Stats>),
    Shutdown,
}

/// Probes don't have a client waiting on them; a throwaway oneshot lets the
/// probe travel through the same reply-arena plumbing as real requests.
fn dummy_probe_reply() -> oneshot::Sender<Vec<u8>> {
    let (tx, _rx) = oneshot::channel();
    tx
}
