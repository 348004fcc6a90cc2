//! Append-only JSONL journals.
//!
//! Two files inside the store directory: `submissions.jsonl` (last record
//! per submission id wins on replay) and `events.jsonl`. Every append is
//! fsynced so a crash never loses an acknowledged transition.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Event, Submission};

#[derive(Serialize, Deserialize)]
struct SubmissionRecord {
    submission: Submission,
}

#[derive(Serialize, Deserialize)]
struct EventRecord {
    event: Event,
}

pub(crate) struct DiskStore {
    submissions_path: PathBuf,
    events_path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskStore {
    pub(crate) fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            submissions_path: dir.join("submissions.jsonl"),
            events_path: dir.join("events.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn append_submission(&self, submission: &Submission) -> std::io::Result<()> {
        self.append_line(
            &self.submissions_path,
            &SubmissionRecord {
                submission: submission.clone(),
            },
        )
    }

    pub(crate) fn append_event(&self, event: &Event) -> std::io::Result<()> {
        self.append_line(
            &self.events_path,
            &EventRecord {
                event: event.clone(),
            },
        )
    }

    fn append_line<T: Serialize>(&self, path: &Path, record: &T) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().expect("journal lock poisoned");
        let mut line = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::other(format!("serializing journal record: {e}")))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(&line)?;
        file.sync_all()
    }

    /// Replay the submission journal: last record per id wins, ordered by
    /// first appearance. Corrupt lines are skipped.
    pub(crate) fn read_submissions(&self) -> std::io::Result<Vec<Submission>> {
        let lines = read_lines(&self.submissions_path)?;
        let mut order: Vec<String> = Vec::new();
        let mut state: std::collections::HashMap<String, Submission> =
            std::collections::HashMap::new();
        for line in lines {
            let Ok(record) = serde_json::from_str::<SubmissionRecord>(&line) else {
                continue;
            };
            let submission = record.submission;
            if submission.id.trim().is_empty() {
                continue;
            }
            if !state.contains_key(&submission.id) {
                order.push(submission.id.clone());
            }
            state.insert(submission.id.clone(), submission);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| state.remove(&id))
            .collect())
    }

    /// Replay the event journal. Events without a positive seq are skipped.
    pub(crate) fn read_events(&self) -> std::io::Result<Vec<Event>> {
        let lines = read_lines(&self.events_path)?;
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            let Ok(record) = serde_json::from_str::<EventRecord>(&line) else {
                continue;
            };
            if record.event.seq == 0 {
                continue;
            }
            out.push(record.event);
        }
        Ok(out)
    }
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
