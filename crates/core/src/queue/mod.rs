//! The request queue and its scheduler.
//!
//! Every waiting request is one entry in a single ordered list, tagged with its lane. A
//! scheduler task ticks on a short fixed interval; per tick it dispatches at most one
//! request per lane whose lockout (as reported by the key pool) is zero. Dispatch is a
//! message on the request's own oneshot channel, so the scheduler never runs request code.
//!
//! Lock order is queue state first, then key stores. `tick` releases the queue lock before
//! asking the pool for lockouts so the two are never held in the opposite order.

mod heartbeat;
mod identity;
mod lane;
mod wait_times;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::key_pool::KeyPool;

pub use heartbeat::{
    HeartbeatAction, HeartbeatMonitor, HeartbeatSettings, INIT_FRAME, StallReason,
    heartbeat_frame, heartbeat_size,
};
pub use identity::Identity;
pub use lane::Lane;
pub use wait_times::WaitStats;

use wait_times::WaitTimes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Oldest request in the lane first.
    #[default]
    Fair,
    /// Uniformly random among the lane's waiting requests.
    Random,
    /// No queue: dispatch immediately or reject.
    None,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub max_residency: Duration,
    pub tick: Duration,
    pub sweep_interval: Duration,
    /// Non-streaming requests are refused above this load.
    pub load_threshold: usize,
    pub wait_window: Duration,
    pub shared_allowance: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Fair,
            max_residency: Duration::from_secs(5 * 60),
            tick: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(20),
            load_threshold: 50,
            wait_window: Duration::from_secs(5 * 60),
            shared_allowance: 5,
        }
    }
}

/// Remaining prompts for a time-boxed user token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub identity: Identity,
    pub lane: Lane,
    pub model: String,
    pub streaming: bool,
    pub retry_count: u32,
    /// Carried over from the first attempt on retries.
    pub start_time: Option<Instant>,
    pub client_ip: String,
    pub budget: Option<PromptBudget>,
}

/// What the scheduler (or the sweeper) tells a waiting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Resume {
        retry_count: u32,
        start_time: Instant,
        queue_out_time: Instant,
    },
    Evicted {
        message: String,
    },
}

struct Entry {
    id: u64,
    identity: Identity,
    lane: Lane,
    model: String,
    retry_count: u32,
    start_time: Instant,
    tx: oneshot::Sender<Dispatch>,
}

/// A request taken off the queue, not yet resumed.
pub struct QueuedRequest {
    pub id: u64,
    pub identity: Identity,
    pub lane: Lane,
    pub model: String,
    pub retry_count: u32,
    pub start_time: Instant,
    pub queue_out_time: Instant,
    tx: oneshot::Sender<Dispatch>,
}

impl QueuedRequest {
    /// Hand the request back to its driver. Returns false when the client already left.
    pub fn resume(self) -> bool {
        self.tx
            .send(Dispatch::Resume {
                retry_count: self.retry_count,
                start_time: self.start_time,
                queue_out_time: self.queue_out_time,
            })
            .is_ok()
    }
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    next_id: u64,
    wait_times: WaitTimes,
    recent_clients: HashMap<String, Instant>,
}

struct Inner {
    settings: QueueSettings,
    pool: Arc<KeyPool>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new(pool: Arc<KeyPool>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                pool,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.inner.pool
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Admit a request. Admission failures are synchronous and nothing is queued.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<QueueTicket, QueueError> {
        let settings = &self.inner.settings;
        let now = Instant::now();
        let first_attempt = req.retry_count == 0;
        let mut state = self.lock();
        state.recent_clients.insert(req.client_ip.clone(), now);

        if let Some(budget) = req.budget
            && budget.used >= budget.limit
        {
            return Err(QueueError::PromptBudgetExhausted {
                limit: budget.limit,
            });
        }

        if first_attempt && !req.streaming {
            let load = load_of(&state, now, settings.wait_window);
            if load > settings.load_threshold {
                return Err(QueueError::StreamingRequired { load });
            }
        }

        if settings.mode == QueueMode::None {
            drop(state);
            return self.dispatch_unqueued(req, now);
        }

        // Shared-IP retries already held one of the identity's slots before they were dequeued.
        if first_attempt || !req.identity.is_shared() {
            let allowance = req.identity.allowance(settings.shared_allowance);
            let queued = state
                .entries
                .iter()
                .filter(|e| e.identity == req.identity)
                .count();
            if queued >= allowance {
                return Err(QueueError::IdentityBusy { queued, allowance });
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let start_time = req.start_time.unwrap_or(now);
        state.entries.push(Entry {
            id,
            identity: req.identity.clone(),
            lane: req.lane,
            model: req.model,
            retry_count: req.retry_count,
            start_time,
            tx,
        });
        debug!(
            identity = %req.identity,
            lane = %req.lane,
            retry_count = req.retry_count,
            queue_len = state.entries.len(),
            "request enqueued"
        );
        drop(state);

        Ok(QueueTicket {
            id,
            rx,
            queue: self.clone(),
            start_time,
            settled: false,
        })
    }

    fn dispatch_unqueued(&self, req: EnqueueRequest, now: Instant) -> Result<QueueTicket, QueueError> {
        let retry_in = self
            .inner
            .pool
            .lockout_period(req.lane.representative_model());
        if !retry_in.is_zero() {
            return Err(QueueError::LaneBusy { retry_in });
        }
        let (tx, rx) = oneshot::channel();
        let start_time = req.start_time.unwrap_or(now);
        let _ = tx.send(Dispatch::Resume {
            retry_count: req.retry_count,
            start_time,
            queue_out_time: now,
        });
        Ok(QueueTicket {
            id: u64::MAX,
            rx,
            queue: self.clone(),
            start_time,
            settled: true,
        })
    }

    /// Remove the next request of `lane` per the queue mode and stamp its queue-out time.
    pub fn dequeue(&self, lane: Lane) -> Option<QueuedRequest> {
        let mut state = self.lock();
        let candidates: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.lane == lane)
            .map(|(idx, _)| idx)
            .collect();
        let idx = match self.inner.settings.mode {
            QueueMode::Random if !candidates.is_empty() => {
                candidates[rand::rng().random_range(0..candidates.len())]
            }
            _ => candidates
                .into_iter()
                .min_by_key(|&idx| (state.entries[idx].start_time, state.entries[idx].id))?,
        };
        let entry = state.entries.remove(idx);
        Some(QueuedRequest {
            id: entry.id,
            identity: entry.identity,
            lane: entry.lane,
            model: entry.model,
            retry_count: entry.retry_count,
            start_time: entry.start_time,
            queue_out_time: Instant::now(),
            tx: entry.tx,
        })
    }

    /// One scheduler pass. Returns how many requests were handed to their drivers.
    pub fn tick(&self) -> usize {
        let lanes: BTreeSet<Lane> = self.lock().entries.iter().map(|e| e.lane).collect();
        let mut dispatched = 0;
        for lane in lanes {
            let lockout = self.inner.pool.lockout_period(lane.representative_model());
            if !lockout.is_zero() {
                continue;
            }
            let Some(req) = self.dequeue(lane) else {
                continue;
            };
            let (identity, retry_count) = (req.identity.clone(), req.retry_count);
            if req.resume() {
                debug!(%lane, %identity, retry_count, "dispatched request");
                dispatched += 1;
            } else {
                debug!(%lane, %identity, "dropped request whose client already left");
            }
        }
        dispatched
    }

    /// Evict requests older than the maximum residency and prune advisory bookkeeping.
    pub fn sweep(&self) -> usize {
        let settings = &self.inner.settings;
        let now = Instant::now();
        let mut state = self.lock();
        let (stale, fresh): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut state.entries)
            .into_iter()
            .partition(|e| now.saturating_duration_since(e.start_time) >= settings.max_residency);
        state.entries = fresh;
        let remaining = state.entries.len();
        state.wait_times.prune(now, settings.wait_window);
        state
            .recent_clients
            .retain(|_, seen| now.saturating_duration_since(*seen) <= settings.wait_window);
        drop(state);

        let minutes = settings.max_residency.as_secs().div_ceil(60);
        for entry in &stale {
            warn!(
                identity = %entry.identity,
                lane = %entry.lane,
                retry_count = entry.retry_count,
                "request evicted from queue"
            );
        }
        let evicted = stale.len();
        for entry in stale {
            let _ = entry.tx.send(Dispatch::Evicted {
                message: eviction_message(minutes, remaining),
            });
        }
        evicted
    }

    pub fn spawn_scheduler(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.inner.settings.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(mode = ?queue.inner.settings.mode, "queue scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.tick();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.inner.settings.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = queue.sweep();
                        if evicted > 0 {
                            info!(evicted, "queue sweep evicted stale requests");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn remove(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        state.entries.len() != before
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().entries.iter().any(|e| e.id == id)
    }

    pub fn queue_length(&self, lane: Option<Lane>) -> usize {
        let state = self.lock();
        match lane {
            Some(lane) => state.entries.iter().filter(|e| e.lane == lane).count(),
            None => state.entries.len(),
        }
    }

    /// max(distinct clients seen recently, queue length).
    pub fn load(&self) -> usize {
        let state = self.lock();
        load_of(&state, Instant::now(), self.inner.settings.wait_window)
    }

    pub fn record_wait(&self, lane: Lane, start: Instant, end: Instant) {
        self.lock().wait_times.record(lane, start, end);
    }

    pub fn wait_stats(&self, lane: Lane) -> WaitStats {
        self.lock()
            .wait_times
            .stats(lane, Instant::now(), self.inner.settings.wait_window)
    }

    pub fn estimated_wait(&self, lane: Lane) -> Duration {
        Duration::from_millis(self.wait_stats(lane).avg_ms.unwrap_or(0))
    }
}

fn load_of(state: &QueueState, now: Instant, window: Duration) -> usize {
    let clients = state
        .recent_clients
        .values()
        .filter(|seen| now.saturating_duration_since(**seen) <= window)
        .count();
    clients.max(state.entries.len())
}

fn eviction_message(minutes: u64, queue_len: usize) -> String {
    format!(
        "Your request has been terminated by the proxy because it has been in the queue for more than {minutes} minutes. The queue is currently {queue_len} requests long."
    )
}

/// A caller's place in the queue. Dropping it before dispatch removes the entry, which is
/// how client disconnects and stalled heartbeats abort a waiting request.
pub struct QueueTicket {
    id: u64,
    rx: oneshot::Receiver<Dispatch>,
    queue: RequestQueue,
    start_time: Instant,
    settled: bool,
}

impl QueueTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Wait for the scheduler. Cancel-safe: it can sit in a `select!` next to heartbeats.
    pub async fn wait(&mut self) -> Dispatch {
        let dispatch = match (&mut self.rx).await {
            Ok(dispatch) => dispatch,
            Err(_) => Dispatch::Evicted {
                message: "The request queue shut down before this request was served.".into(),
            },
        };
        self.settled = true;
        dispatch
    }

    /// Leave the queue explicitly. Returns whether the entry was still queued.
    pub fn abort(mut self) -> bool {
        self.settled = true;
        self.queue.remove(self.id)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.settled && self.queue.remove(self.id) {
            debug!(id = self.id, "queued request aborted");
        }
    }
}
