//! Output stream hub: per-task fan-out of log lines.
//!
//! Each task has at most one stream, created lazily by the first producer
//! or subscriber. A stream keeps a bounded history for late joiners and a
//! bounded channel per subscriber. Publishing never waits: a subscriber
//! whose channel is full misses the line and is told how many lines it
//! missed before the next one it does receive. End-of-stream is the
//! subscriber's channel closing.
//!
//! Every subscriber channel carries [`FINAL_SLOTS`] slots beyond its
//! configured buffer that live lines never use, so the pending gap marker
//! and the terminal line always fit when the stream ends.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TaskId;
use crate::config::CoordinatorConfig;
use crate::protocol::OutputLine;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub subscriber_buffer: usize,
    pub history: usize,
    pub retention: Duration,
}

impl From<&CoordinatorConfig> for HubConfig {
    fn from(c: &CoordinatorConfig) -> Self {
        Self {
            subscriber_buffer: c.subscriber_buffer,
            history: c.stream_history,
            retention: c.stream_retention,
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Line(OutputLine),
    /// Lines dropped because this subscriber's buffer was full.
    Gap { missed: u64 },
}

impl StreamEvent {
    /// Wire form for end users: lines as-is, gaps as `{"type":"gap","missed":N}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Line(line) => serde_json::to_value(line).unwrap_or(serde_json::Value::Null),
            Self::Gap { missed } => serde_json::json!({ "type": "gap", "missed": missed }),
        }
    }
}

/// A live subscription. `history` holds the lines buffered before it was
/// taken; `events` yields everything after, and ends when the stream ends.
pub struct Subscription {
    pub history: Vec<OutputLine>,
    pub events: mpsc::Receiver<StreamEvent>,
    /// Whether this was the first live subscriber of the stream.
    pub first: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub task_id: TaskId,
    pub subscribers: usize,
    pub buffered: usize,
    pub published: u64,
    pub dropped: u64,
    pub closed: bool,
}

/// Channel slots held back for the closing gap marker and terminal line.
const FINAL_SLOTS: usize = 2;

struct Subscriber {
    tx: mpsc::Sender<StreamEvent>,
    missed: u64,
}

impl Subscriber {
    /// Room for a live event without touching the reserved slots.
    fn has_room(&self) -> bool {
        self.tx.capacity() > FINAL_SLOTS
    }

    /// Deliver a line, flushing a pending gap marker first. Returns `false`
    /// once the receiver is gone.
    fn deliver(&mut self, line: &OutputLine) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        if self.missed > 0 {
            if !self.has_room() {
                self.missed += 1;
                return true;
            }
            if self.tx.try_send(StreamEvent::Gap { missed: self.missed }).is_err() {
                return false;
            }
            self.missed = 0;
        }
        if !self.has_room() {
            self.missed += 1;
            return true;
        }
        self.tx.try_send(StreamEvent::Line(line.clone())).is_ok()
    }

    /// Flush the gap marker and send `last` into the reserved slots, then
    /// drop the sender so the receiver sees end-of-stream after draining.
    fn close(self, last: Option<&OutputLine>) {
        if self.missed > 0 {
            let _ = self.tx.try_send(StreamEvent::Gap { missed: self.missed });
        }
        if let Some(line) = last {
            let _ = self.tx.try_send(StreamEvent::Line(line.clone()));
        }
    }
}

#[derive(Default)]
struct StreamState {
    history: VecDeque<OutputLine>,
    subscribers: HashMap<String, Subscriber>,
    published: u64,
    dropped: u64,
    terminal_at: Option<Instant>,
    last_activity: Option<Instant>,
}

struct OutputStream {
    state: Mutex<StreamState>,
}

pub struct OutputHub {
    streams: RwLock<HashMap<TaskId, Arc<OutputStream>>>,
    config: HubConfig,
}

impl OutputHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn stream(&self, task_id: TaskId) -> Arc<OutputStream> {
        if let Some(stream) = self.streams.read().get(&task_id) {
            return Arc::clone(stream);
        }
        let mut streams = self.streams.write();
        Arc::clone(streams.entry(task_id).or_insert_with(|| {
            Arc::new(OutputStream {
                state: Mutex::new(StreamState {
                    last_activity: Some(Instant::now()),
                    ..StreamState::default()
                }),
            })
        }))
    }

    /// Make sure a stream exists for a task about to produce output.
    pub fn open(&self, task_id: TaskId) {
        let stream = self.stream(task_id);
        let mut state = stream.state.lock();
        // A re-run after a requeue starts a fresh life for the stream.
        state.terminal_at = None;
    }

    /// Fan a line out to every subscriber without waiting on any of them.
    pub fn publish(&self, task_id: TaskId, line: OutputLine) {
        let stream = self.stream(task_id);
        let mut state = stream.state.lock();
        self.push_history(&mut state, &line);

        let mut dropped = 0u64;
        state.subscribers.retain(|client_id, sub| {
            let before = sub.missed;
            let alive = sub.deliver(&line);
            if sub.missed > before {
                dropped += 1;
                if before == 0 {
                    warn!(task_id, client_id = %client_id, "subscriber lagging, dropping lines");
                }
            }
            alive
        });
        state.dropped += dropped;
    }

    fn push_history(&self, state: &mut StreamState, line: &OutputLine) {
        if state.history.len() >= self.config.history {
            state.history.pop_front();
        }
        state.history.push_back(line.clone());
        state.published += 1;
        state.last_activity = Some(Instant::now());
    }

    /// Subscribe `client_id`, replacing an earlier subscription under the
    /// same id. Subscribing to a finished stream yields its history and an
    /// already-ended channel.
    pub fn subscribe(&self, task_id: TaskId, client_id: &str) -> Subscription {
        let stream = self.stream(task_id);
        let mut state = stream.state.lock();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1) + FINAL_SLOTS);
        let history: Vec<OutputLine> = state.history.iter().cloned().collect();
        state.last_activity = Some(Instant::now());

        if state.terminal_at.is_some() {
            return Subscription {
                history,
                events: rx,
                first: false,
            };
        }

        let first = state.subscribers.is_empty();
        state
            .subscribers
            .insert(client_id.to_string(), Subscriber { tx, missed: 0 });
        debug!(task_id, client_id, "subscriber attached");
        Subscription {
            history,
            events: rx,
            first,
        }
    }

    /// Remove a subscriber. Idempotent; returns the number of subscribers
    /// left, or `None` if this client was not subscribed.
    pub fn unsubscribe(&self, task_id: TaskId, client_id: &str) -> Option<usize> {
        let stream = self.streams.read().get(&task_id).cloned()?;
        let mut state = stream.state.lock();
        state.subscribers.remove(client_id)?;
        state.last_activity = Some(Instant::now());
        Some(state.subscribers.len())
    }

    /// Publish the final line and end every subscription. The stream stays
    /// readable until the janitor evicts it.
    pub fn finish(&self, task_id: TaskId, last: OutputLine) {
        let stream = self.stream(task_id);
        let mut state = stream.state.lock();
        self.push_history(&mut state, &last);
        for (_, sub) in state.subscribers.drain() {
            sub.close(Some(&last));
        }
        state.terminal_at = Some(Instant::now());
    }

    /// End live subscriptions without finishing the stream, for a task whose
    /// agent went away. Returns how many subscribers were ended.
    pub fn end_subscribers(&self, task_id: TaskId) -> usize {
        let Some(stream) = self.streams.read().get(&task_id).cloned() else {
            return 0;
        };
        let mut state = stream.state.lock();
        let n = state.subscribers.len();
        for (_, sub) in state.subscribers.drain() {
            sub.close(None);
        }
        n
    }

    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.streams
            .read()
            .get(&task_id)
            .map(|s| s.state.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Buffered lines joined by newlines.
    pub fn buffered_text(&self, task_id: TaskId) -> Option<String> {
        let stream = self.streams.read().get(&task_id).cloned()?;
        let state = stream.state.lock();
        let lines: Vec<&str> = state.history.iter().map(|l| l.line.as_str()).collect();
        Some(lines.join("\n"))
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        let streams: Vec<(TaskId, Arc<OutputStream>)> = self
            .streams
            .read()
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        let mut stats: Vec<StreamStats> = streams
            .into_iter()
            .map(|(task_id, stream)| {
                let state = stream.state.lock();
                StreamStats {
                    task_id,
                    subscribers: state.subscribers.len(),
                    buffered: state.history.len(),
                    published: state.published,
                    dropped: state.dropped,
                    closed: state.terminal_at.is_some(),
                }
            })
            .collect();
        stats.sort_by_key(|s| s.task_id);
        stats
    }

    /// Evict streams that finished more than the retention period ago, and
    /// unfinished streams that have had no subscribers and no activity for
    /// that long unless `is_live` still claims them.
    pub fn evict_expired(&self, now: Instant, is_live: impl Fn(TaskId) -> bool) -> Vec<TaskId> {
        let retention = self.config.retention;
        let mut streams = self.streams.write();
        let expired: Vec<TaskId> = streams
            .iter()
            .filter(|(task_id, stream)| {
                let state = stream.state.lock();
                match state.terminal_at {
                    Some(at) => now.saturating_duration_since(at) > retention,
                    None => {
                        state.subscribers.is_empty()
                            && state
                                .last_activity
                                .is_some_and(|t| now.saturating_duration_since(t) > retention)
                            && !is_live(**task_id)
                    }
                }
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(stream) = streams.remove(id) {
                stream.state.lock().subscribers.clear();
            }
        }
        expired
    }

    pub async fn run_janitor<F>(self: Arc<Self>, interval: Duration, is_live: F, cancel: CancellationToken)
    where
        F: Fn(TaskId) -> bool + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.evict_expired(Instant::now(), &is_live);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "evicted expired output streams");
                    }
                }
            }
        }
    }
}
