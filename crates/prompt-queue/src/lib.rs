//! Per-session prompt queue.
//!
//! HTTP handlers submit into this queue before entering the auth manager.
//! Each session key gets one dedicated worker task, so submissions within a
//! session run strictly in order while sessions proceed in parallel. Every
//! status transition is journaled (in-memory ring + fsynced JSONL) and
//! replayed on restart.

mod journal;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use common::queuehealth;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};
use uuid::Uuid;

use journal::DiskStore;

pub const DEFAULT_SESSION_KEY: &str = "default";
pub const DEFAULT_SESSION_QUEUE_SIZE: usize = 256;
pub const DEFAULT_MAX_EVENTS: usize = 4096;
pub const DEFAULT_MAX_SUBMISSIONS: usize = 20_000;
const DEFAULT_LIST_LIMIT: usize = 200;
const DEFAULT_EVENTS_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One queued prompt execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub session_key: String,
    pub handler: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One ledger entry; `seq` is strictly increasing within a manager lifetime
/// (and across restarts via replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub submission_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub submitted_total: u64,
    pub started_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub overloaded_total: u64,
    pub current_queued: usize,
    pub queue_depth_by_session: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub submission_id: String,
    pub session_key: String,
    pub handler: String,
    pub model: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub session_key: String,
    pub status: Option<SubmissionStatus>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Journal directory; `None` disables durability.
    pub store_dir: Option<PathBuf>,
    pub session_queue_size: usize,
    pub max_events: usize,
    pub max_submissions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: Some(default_store_dir()),
            session_queue_size: DEFAULT_SESSION_QUEUE_SIZE,
            max_events: DEFAULT_MAX_EVENTS,
            max_submissions: DEFAULT_MAX_SUBMISSIONS,
        }
    }
}

/// Default journal location: `~/.cli-proxy-api/.runtime-cache/prompt-queue`,
/// falling back to the system temp dir.
pub fn default_store_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home)
                .join(".cli-proxy-api")
                .join(".runtime-cache")
                .join("prompt-queue");
        }
    }
    std::env::temp_dir().join("cliproxy-prompt-queue")
}

type RunFn = Box<dyn FnOnce(String) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Job {
    submission_id: String,
    session_key: String,
    run: RunFn,
    ack: oneshot::Sender<anyhow::Result<()>>,
}

struct State {
    workers: HashMap<String, mpsc::Sender<Job>>,
    events: VecDeque<Event>,
    submissions: HashMap<String, Submission>,
    submission_order: Vec<String>,
    next_seq: u64,
    submitted_total: u64,
    started_total: u64,
    succeeded_total: u64,
    failed_total: u64,
    overloaded_total: u64,
}

/// Per-session FIFO queue manager.
pub struct Manager {
    state: Mutex<State>,
    store: Option<DiskStore>,
    session_queue_size: usize,
    max_events: usize,
    max_submissions: usize,
    /// Handle back to the owning Arc so worker tasks can be spawned from
    /// `&self` methods.
    weak_self: Weak<Manager>,
}

impl Manager {
    pub fn new(cfg: Config) -> Arc<Self> {
        let session_queue_size = if cfg.session_queue_size == 0 {
            DEFAULT_SESSION_QUEUE_SIZE
        } else {
            cfg.session_queue_size
        };
        let max_events = if cfg.max_events == 0 {
            DEFAULT_MAX_EVENTS
        } else {
            cfg.max_events
        };
        let max_submissions = if cfg.max_submissions == 0 {
            DEFAULT_MAX_SUBMISSIONS
        } else {
            cfg.max_submissions
        };

        let store = cfg.store_dir.and_then(|dir| match DiskStore::new(&dir) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "prompt queue journal disabled");
                None
            }
        });

        let manager = Arc::new_cyclic(|weak| Self {
            state: Mutex::new(State {
                workers: HashMap::new(),
                events: VecDeque::with_capacity(max_events.min(1024)),
                submissions: HashMap::new(),
                submission_order: Vec::new(),
                next_seq: 0,
                submitted_total: 0,
                started_total: 0,
                succeeded_total: 0,
                failed_total: 0,
                overloaded_total: 0,
            }),
            store,
            session_queue_size,
            max_events,
            max_submissions,
            weak_self: weak.clone(),
        });
        manager.restore_from_disk();
        manager
    }

    /// Enqueue onto the session's FIFO and block until the run callback has
    /// finished. Returns the submission id together with the callback's
    /// outcome.
    pub async fn submit_and_wait<F, Fut>(
        &self,
        req: SubmitRequest,
        run: F,
    ) -> (String, anyhow::Result<()>)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let session_key = normalized_session_key(&req.session_key);
        let mut submission_id = req.submission_id.trim().to_string();
        if submission_id.is_empty() {
            submission_id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();

        let sender = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.submissions.contains_key(&submission_id) {
                submission_id = Uuid::new_v4().to_string();
            }
            let submission = Submission {
                id: submission_id.clone(),
                session_key: session_key.clone(),
                handler: req.handler.trim().to_string(),
                model: req.model.trim().to_string(),
                request_id: req.request_id.trim().to_string(),
                status: SubmissionStatus::Queued,
                error: String::new(),
                enqueued_at: now,
                started_at: None,
                finished_at: None,
            };
            self.journal_submission(&submission);
            state
                .submission_order
                .push(submission_id.clone());
            state
                .submissions
                .insert(submission_id.clone(), submission.clone());
            state.submitted_total += 1;
            self.evict_submissions_locked(&mut state);
            self.append_event_locked(
                &mut state,
                "submission_queued",
                &submission_id,
                &session_key,
                Some(
                    [
                        ("handler".to_string(), Value::String(submission.handler)),
                        ("model".to_string(), Value::String(submission.model)),
                    ]
                    .into_iter()
                    .collect(),
                ),
            );

            let sender = self.ensure_worker_locked(&mut state, &session_key);
            if sender.capacity() == 0 {
                state.overloaded_total += 1;
                queuehealth::inc("prompt_queue_session_channel_full");
                let depth = self.session_queue_size;
                self.append_event_locked(
                    &mut state,
                    "queue_overloaded",
                    &submission_id,
                    &session_key,
                    Some(
                        [
                            ("queue_depth".to_string(), Value::from(depth)),
                            ("queue_cap".to_string(), Value::from(self.session_queue_size)),
                        ]
                        .into_iter()
                        .collect(),
                    ),
                );
            }
            sender
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let job = Job {
            submission_id: submission_id.clone(),
            session_key,
            run: Box::new(move |id| run(id).boxed()),
            ack: ack_tx,
        };
        if sender.send(job).await.is_err() {
            return (
                submission_id,
                Err(anyhow::anyhow!("prompt queue worker is gone")),
            );
        }
        let result = ack_rx
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("prompt queue worker dropped the job")));
        (submission_id, result)
    }

    /// Newest-first listing with optional session/status filters.
    pub fn list_submissions(&self, opts: ListOptions) -> Vec<Submission> {
        let state = self.state.lock().expect("queue lock poisoned");
        let session_key = opts.session_key.trim();

        let mut out: Vec<Submission> = state
            .submission_order
            .iter()
            .rev()
            .filter_map(|id| state.submissions.get(id))
            .filter(|sub| session_key.is_empty() || sub.session_key == session_key)
            .filter(|sub| opts.status.map(|s| sub.status == s).unwrap_or(true))
            .cloned()
            .collect();

        let offset = opts.offset.min(out.len());
        let limit = if opts.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            opts.limit
        };
        out.drain(..offset);
        out.truncate(limit);
        out
    }

    /// Events with `seq > since_seq`, optionally filtered by session key.
    pub fn events_since(&self, session_key: &str, since_seq: u64, limit: usize) -> Vec<Event> {
        let state = self.state.lock().expect("queue lock poisoned");
        let session_key = session_key.trim();
        let limit = if limit == 0 { DEFAULT_EVENTS_LIMIT } else { limit };
        state
            .events
            .iter()
            .filter(|ev| ev.seq > since_seq)
            .filter(|ev| session_key.is_empty() || ev.session_key == session_key)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().expect("queue lock poisoned");
        let mut snap = MetricsSnapshot {
            submitted_total: state.submitted_total,
            started_total: state.started_total,
            succeeded_total: state.succeeded_total,
            failed_total: state.failed_total,
            overloaded_total: state.overloaded_total,
            ..MetricsSnapshot::default()
        };
        for (key, sender) in &state.workers {
            let depth = sender.max_capacity() - sender.capacity();
            snap.queue_depth_by_session.insert(key.clone(), depth);
            snap.current_queued += depth;
        }
        snap
    }

    fn restore_from_disk(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let submissions = store.read_submissions().unwrap_or_else(|e| {
            warn!(error = %e, "failed to replay submission journal");
            Vec::new()
        });
        let events = store.read_events().unwrap_or_else(|e| {
            warn!(error = %e, "failed to replay event journal");
            Vec::new()
        });

        let mut state = self.state.lock().expect("queue lock poisoned");
        for submission in submissions {
            if !state.submissions.contains_key(&submission.id) {
                state.submission_order.push(submission.id.clone());
            }
            state
                .submissions
                .insert(submission.id.clone(), submission);
        }
        let enqueued_at: HashMap<String, DateTime<Utc>> = state
            .submissions
            .iter()
            .map(|(id, sub)| (id.clone(), sub.enqueued_at))
            .collect();
        state.submission_order.sort_by(|a, b| {
            enqueued_at
                .get(a)
                .cmp(&enqueued_at.get(b))
                .then_with(|| a.cmp(b))
        });

        for event in events {
            state.next_seq = state.next_seq.max(event.seq);
            state.events.push_back(event);
        }
        while state.events.len() > self.max_events {
            state.events.pop_front();
        }
        self.evict_submissions_locked(&mut state);
    }

    fn ensure_worker_locked(&self, state: &mut State, session_key: &str) -> mpsc::Sender<Job> {
        if let Some(sender) = state.workers.get(session_key) {
            return sender.clone();
        }
        let (tx, mut rx) = mpsc::channel::<Job>(self.session_queue_size);
        state.workers.insert(session_key.to_string(), tx.clone());
        let Some(manager) = self.weak_self.upgrade() else {
            return tx;
        };
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                manager.mark_running(&job.submission_id, &job.session_key);
                let run = job.run;
                let id = job.submission_id.clone();
                // Run in a child task so a panic is contained and reported
                // as a failure instead of killing the session worker.
                let outcome = match tokio::spawn((run)(id)).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        error!(submission_id = %job.submission_id, error = %join_err, "prompt queue run panicked");
                        Err(anyhow::anyhow!("prompt queue worker panic: {join_err}"))
                    }
                };
                manager.mark_finished(
                    &job.submission_id,
                    &job.session_key,
                    outcome.as_ref().err().map(|e| e.to_string()),
                );
                let _ = job.ack.send(outcome);
            }
        });
        tx
    }

    fn mark_running(&self, submission_id: &str, session_key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let Some(submission) = state.submissions.get_mut(submission_id) else {
            return;
        };
        submission.status = SubmissionStatus::Running;
        submission.started_at = Some(Utc::now());
        let snapshot = submission.clone();
        state.started_total += 1;
        self.journal_submission(&snapshot);
        self.append_event_locked(&mut state, "submission_started", submission_id, session_key, None);
    }

    fn mark_finished(&self, submission_id: &str, session_key: &str, error: Option<String>) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let Some(submission) = state.submissions.get_mut(submission_id) else {
            return;
        };
        submission.finished_at = Some(Utc::now());
        let event_type = match &error {
            Some(message) => {
                submission.status = SubmissionStatus::Failed;
                submission.error = message.clone();
                "submission_failed"
            }
            None => {
                submission.status = SubmissionStatus::Succeeded;
                submission.error.clear();
                "submission_succeeded"
            }
        };
        let snapshot = submission.clone();
        match &error {
            Some(_) => state.failed_total += 1,
            None => state.succeeded_total += 1,
        }
        self.journal_submission(&snapshot);
        let payload = error.map(|message| {
            [("error".to_string(), Value::String(message))]
                .into_iter()
                .collect()
        });
        self.append_event_locked(&mut state, event_type, submission_id, session_key, payload);
    }

    fn append_event_locked(
        &self,
        state: &mut State,
        event_type: &str,
        submission_id: &str,
        session_key: &str,
        payload: Option<Map<String, Value>>,
    ) {
        state.next_seq += 1;
        let event = Event {
            seq: state.next_seq,
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            submission_id: submission_id.to_string(),
            session_key: session_key.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.append_event(&event) {
                warn!(error = %e, "failed to journal queue event");
            }
        }
        state.events.push_back(event);
        while state.events.len() > self.max_events {
            state.events.pop_front();
        }
    }

    fn journal_submission(&self, submission: &Submission) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_submission(submission) {
                warn!(error = %e, "failed to journal submission");
            }
        }
    }

    /// Drop oldest submissions past the cap. The journal retains them until
    /// compacted externally.
    fn evict_submissions_locked(&self, state: &mut State) {
        let over = state.submission_order.len().saturating_sub(self.max_submissions);
        if over == 0 {
            return;
        }
        for id in state.submission_order.drain(..over).collect::<Vec<_>>() {
            state.submissions.remove(&id);
        }
    }
}

fn normalized_session_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_SESSION_KEY.to_string()
    } else {
        trimmed.to_string()
    }
}
