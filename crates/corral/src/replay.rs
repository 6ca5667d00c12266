use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::message::ReplySender;
use crate::message_storage::MessageStorage;
use crate::metrics::ClusterMetrics;
use crate::reply::Reply;
use crate::snowflake::Snowflake;

/// Reply Replay Engine: streams persisted replies back to callers whose
/// direct delivery path failed (remote runner down, owner unknown, duplicate
/// submission of an in-flight request).
///
/// One entry per pending request id; concurrent callers for the same request
/// share the entry and each receives every reply. A single poller issues one
/// batched `replies_for` query per tick over all pending ids; each entry's
/// drain task then delivers at most one buffered reply per tick, keeping
/// per-request order and pacing regardless of how many replies a poll
/// returned at once.
pub struct ReplayEngine {
    storage: Arc<dyn MessageStorage>,
    poll_interval: Duration,
    metrics: Arc<ClusterMetrics>,
    entries: DashMap<Snowflake, Arc<ReplayEntry>>,
    poll_notify: Notify,
    cancel: CancellationToken,
    background_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct ReplayEntry {
    request_id: Snowflake,
    waiters: parking_lot::Mutex<Vec<ReplySender>>,
    buffered: parking_lot::Mutex<VecDeque<Reply>>,
    /// How many of storage's replies for this request are already buffered.
    /// `replies_for` returns the cumulative ordered list, so this cursor is
    /// what keeps re-polls from re-buffering old replies.
    fetched: AtomicUsize,
    /// Latch: one permit per poll tick, one buffered delivery per permit.
    signal: Notify,
}

impl ReplayEntry {
    fn new(request_id: Snowflake) -> Self {
        Self {
            request_id,
            waiters: parking_lot::Mutex::new(Vec::new()),
            buffered: parking_lot::Mutex::new(VecDeque::new()),
            fetched: AtomicUsize::new(0),
            signal: Notify::new(),
        }
    }

    /// Drop waiters whose callers went away. Returns whether any remain.
    fn prune_waiters(&self) -> bool {
        let mut waiters = self.waiters.lock();
        waiters.retain(|tx| !tx.is_closed());
        !waiters.is_empty()
    }
}

impl ReplayEngine {
    pub fn new(
        storage: Arc<dyn MessageStorage>,
        config: &ClusterConfig,
        metrics: Arc<ClusterMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            poll_interval: config.reply_poll_interval,
            metrics,
            entries: DashMap::new(),
            poll_notify: Notify::new(),
            cancel: CancellationToken::new(),
            background_tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the storage poll loop.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.poll_loop().await;
        });
        self.background_tasks.lock().await.push(handle);
    }

    /// Register a waiter for the replies of `request_id`. Joins the existing
    /// entry if the request is already being replayed, otherwise creates one
    /// and wakes the poller immediately.
    pub fn watch(self: &Arc<Self>, request_id: Snowflake, sender: ReplySender) {
        let entry = match self.entries.entry(request_id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = Arc::new(ReplayEntry::new(request_id));
                vacant.insert(Arc::clone(&entry));
                let this = Arc::clone(self);
                let drained = Arc::clone(&entry);
                tokio::spawn(async move {
                    this.drain_entry(drained).await;
                });
                entry
            }
        };
        entry.waiters.lock().push(sender);
        self.metrics.replay_pending.set(self.entries.len() as i64);
        tracing::debug!(request_id = request_id.0, "replaying request from storage");
        self.poll_notify.notify_one();
    }

    /// Number of requests currently being replayed.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Stop background loops. Entries are dropped; waiters observe closed
    /// channels.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.background_tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
        self.entries.clear();
        self.metrics.replay_pending.set(0);
    }

    fn remove_entry(&self, request_id: Snowflake) {
        self.entries.remove(&request_id);
        self.metrics.replay_pending.set(self.entries.len() as i64);
    }

    /// Per-entry delivery task: one buffered reply per latch permit, fanned
    /// out to every live waiter. Tears down on the terminal reply or when no
    /// waiters remain.
    async fn drain_entry(&self, entry: Arc<ReplayEntry>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = entry.signal.notified() => {}
            }

            let next = entry.buffered.lock().pop_front();
            match next {
                Some(reply) => {
                    let terminal = reply.is_final();
                    let waiters: Vec<ReplySender> = entry.waiters.lock().clone();
                    for tx in &waiters {
                        // A failed send means that caller cancelled; it is
                        // pruned below.
                        let _ = tx.send(reply.clone()).await;
                    }
                    let any_left = entry.prune_waiters();
                    if terminal || !any_left {
                        if terminal {
                            tracing::debug!(
                                request_id = entry.request_id.0,
                                "replay complete, terminal reply delivered"
                            );
                        }
                        self.remove_entry(entry.request_id);
                        break;
                    }
                }
                None => {
                    // Tick without new data: garbage-collect cancelled waiters.
                    if !entry.prune_waiters() {
                        self.remove_entry(entry.request_id);
                        break;
                    }
                }
            }
        }
    }

    /// One batched storage query per tick over every pending request, then
    /// one latch permit per entry.
    async fn poll_loop(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.poll_notify.notified() => {},
                _ = tokio::time::sleep(self.poll_interval) => {},
            }

            let pending: Vec<Snowflake> = self.entries.iter().map(|e| *e.key()).collect();
            if pending.is_empty() {
                continue;
            }

            let replies = match self.storage.replies_for(&pending).await {
                Ok(replies) => replies,
                Err(e) => {
                    // Treated as an empty result; the next tick retries.
                    tracing::warn!(error = %e, "reply poll failed");
                    Vec::new()
                }
            };

            let mut grouped: HashMap<Snowflake, Vec<Reply>> = HashMap::new();
            for reply in replies {
                grouped.entry(reply.request_id()).or_default().push(reply);
            }

            for item in self.entries.iter() {
                let entry = item.value();
                if let Some(all) = grouped.get(item.key()) {
                    let fetched = entry.fetched.load(Ordering::Acquire);
                    if all.len() > fetched {
                        let mut buffered = entry.buffered.lock();
                        for reply in &all[fetched..] {
                            buffered.push_back(reply.clone());
                        }
                        entry.fetched.store(all.len(), Ordering::Release);
                    }
                }
                entry.signal.notify_one();
            }
        }
    }
}
