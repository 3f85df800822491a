use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use conductor_core::SessionKey;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

/// Per-channel rule applied when an inbound message arrives for a session
/// whose agent run is already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Cancel the in-progress run and start a new one with the fresh text.
    Interrupt,
    /// Push into the active run's bounded interrupt inbox; falls back to
    /// `Followup` if that inbox is full. Never starts a new run.
    Steer,
    /// Like `Steer`, but also appends to the followup queue so the message
    /// is not lost if the steer is dropped mid-run.
    SteerBacklog,
    /// Append to the followup queue; on drain, all queued messages are
    /// concatenated into one synthetic message and run as a single turn.
    Collect,
    /// Append to the followup queue; on drain, the single queued message
    /// runs as a new independent agent run.
    Followup,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Followup
    }
}

impl std::str::FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interrupt" => Ok(BusyPolicy::Interrupt),
            "steer" => Ok(BusyPolicy::Steer),
            "steerbacklog" | "steer_backlog" => Ok(BusyPolicy::SteerBacklog),
            "collect" => Ok(BusyPolicy::Collect),
            "followup" => Ok(BusyPolicy::Followup),
            other => Err(format!("unknown busy policy: {other}")),
        }
    }
}

const MAX_FOLLOWUP_QUEUE: usize = 20;
const MAX_INTERRUPT_INBOX: usize = 10;
const DEBOUNCE_MS: u64 = 400;

/// Outcome of applying a busy policy to an inbound message for a busy session.
#[derive(Debug)]
pub enum BusyOutcome {
    /// The caller should cancel the active run and start a new one.
    Interrupted,
    /// Delivered into the interrupt inbox of the active run.
    Steered,
    /// Interrupt inbox was full; fell back to the followup queue.
    SteerFallback,
    /// Queued; will be drained once the active run finishes.
    Queued,
}

struct SessionQueueState {
    processing: bool,
    interrupt_tx: Option<mpsc::Sender<String>>,
    followup: VecDeque<String>,
    processing_since: Option<Instant>,
    debounce_buffer: Vec<String>,
}

impl SessionQueueState {
    fn new() -> Self {
        Self {
            processing: false,
            interrupt_tx: None,
            followup: VecDeque::new(),
            processing_since: None,
            debounce_buffer: Vec::new(),
        }
    }
}

/// Tracks, per session, whether an agent run is in flight and the queue of
/// messages waiting behind it: debounce, busy-policy routing, bounded
/// backpressure, and a watchdog that recovers sessions whose `processing`
/// flag got stuck.
pub struct MessageQueue {
    sessions: DashMap<SessionKey, Mutex<SessionQueueState>>,
    run_timeout: Duration,
}

impl MessageQueue {
    pub fn new(run_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            run_timeout,
        }
    }

    /// Atomically flips `processing` from false to true. Returns `true` if
    /// this caller won the race and owns the run.
    pub fn try_set_processing(&self, key: &SessionKey) -> bool {
        let entry = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(SessionQueueState::new()));
        let mut state = entry.lock().unwrap();
        if state.processing {
            return false;
        }
        state.processing = true;
        state.processing_since = Some(Instant::now());
        true
    }

    /// Registers the interrupt inbox for a run that just started, and
    /// returns the receiver end for the agent loop to drain from.
    pub fn register_run(&self, key: &SessionKey) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(MAX_INTERRUPT_INBOX);
        let entry = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(SessionQueueState::new()));
        entry.lock().unwrap().interrupt_tx = Some(tx);
        rx
    }

    /// Clears `processing` and the interrupt inbox when a run ends (any path).
    /// Returns the followup queue contents so the caller can decide whether
    /// to spawn a drain run.
    pub fn finish_run(&self, key: &SessionKey) -> Vec<String> {
        let Some(entry) = self.sessions.get(key) else {
            return Vec::new();
        };
        let mut state = entry.lock().unwrap();
        state.processing = false;
        state.processing_since = None;
        state.interrupt_tx = None;
        state.followup.drain(..).collect()
    }

    /// Apply the busy policy for an inbound message that arrived while the
    /// session's run is in progress.
    pub fn apply_busy_policy(
        &self,
        key: &SessionKey,
        policy: BusyPolicy,
        text: String,
    ) -> BusyOutcome {
        let entry = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(SessionQueueState::new()));
        let mut state = entry.lock().unwrap();

        match policy {
            BusyPolicy::Interrupt => BusyOutcome::Interrupted,
            BusyPolicy::Steer => match &state.interrupt_tx {
                Some(tx) if tx.try_send(text.clone()).is_ok() => BusyOutcome::Steered,
                _ => {
                    push_followup(&mut state.followup, text);
                    BusyOutcome::SteerFallback
                }
            },
            BusyPolicy::SteerBacklog => {
                let steered = matches!(&state.interrupt_tx, Some(tx) if tx.try_send(text.clone()).is_ok());
                push_followup(&mut state.followup, text);
                if steered {
                    BusyOutcome::Steered
                } else {
                    BusyOutcome::SteerFallback
                }
            }
            BusyPolicy::Collect | BusyPolicy::Followup => {
                push_followup(&mut state.followup, text);
                BusyOutcome::Queued
            }
        }
    }

    /// Drops all queued followups without processing them (the `interrupt`
    /// busy mode discards the backlog). Returns how many were dropped.
    pub fn discard_followups(&self, key: &SessionKey) -> usize {
        let Some(entry) = self.sessions.get(key) else {
            return 0;
        };
        let mut state = entry.lock().unwrap();
        let dropped = state.followup.len();
        state.followup.clear();
        dropped
    }

    /// Buffers a message for a session that is currently idle, returning the
    /// combined text once the debounce window elapses with no further
    /// arrivals, or `None` while still waiting. Callers own the timer; this
    /// only manages the buffer contents.
    pub fn debounce_push(&self, key: &SessionKey, text: String) {
        let entry = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(SessionQueueState::new()));
        entry.lock().unwrap().debounce_buffer.push(text);
    }

    /// Drains and concatenates the debounce buffer (literal concatenation
    /// with newline separators, no deduplication).
    pub fn debounce_drain(&self, key: &SessionKey) -> Option<String> {
        let entry = self.sessions.get(key)?;
        let mut state = entry.lock().unwrap();
        if state.debounce_buffer.is_empty() {
            return None;
        }
        Some(state.debounce_buffer.drain(..).collect::<Vec<_>>().join("\n"))
    }

    pub fn debounce_window() -> Duration {
        Duration::from_millis(DEBOUNCE_MS)
    }

    /// Periodic sweep: any session whose `processing` flag has been set for
    /// longer than `run_timeout + 5 min` is forcibly cleared. Returns the
    /// keys that were recovered so the caller can also cancel their
    /// tracked cancellation tokens and signal tool abort.
    pub fn watchdog_sweep(&self) -> Vec<SessionKey> {
        let grace = self.run_timeout + Duration::from_secs(5 * 60);
        let mut recovered = Vec::new();
        for entry in self.sessions.iter() {
            let mut state = entry.value().lock().unwrap();
            if let Some(since) = state.processing_since {
                if since.elapsed() > grace {
                    warn!(key = %entry.key(), "watchdog recovering stuck session");
                    state.processing = false;
                    state.processing_since = None;
                    state.interrupt_tx = None;
                    recovered.push(entry.key().clone());
                }
            }
        }
        recovered
    }

    /// Spawns a background task that runs `watchdog_sweep` on an interval.
    /// The caller is responsible for handling the returned keys (e.g. via a
    /// channel) if recovery needs to trigger further cleanup elsewhere.
    pub fn spawn_watchdog(self: std::sync::Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tick.tick().await;
                let recovered = self.watchdog_sweep();
                if !recovered.is_empty() {
                    info!(count = recovered.len(), "watchdog swept stuck sessions");
                }
            }
        })
    }
}

fn push_followup(queue: &mut VecDeque<String>, text: String) {
    if queue.len() >= MAX_FOLLOWUP_QUEUE {
        queue.pop_front();
        warn!("followup queue full, dropped oldest message");
    }
    queue.push_back(text);
}
