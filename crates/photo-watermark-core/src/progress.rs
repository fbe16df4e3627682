//! Export job state: one writer, many readers
//!
//! All mutable fields live in a single [`JobState`] behind a mutex and change
//! only through [`JobState::apply`]. Every accepted event publishes a fresh
//! immutable [`JobSnapshot`] that pollers load without taking the lock. The
//! same `Arc` goes to broadcast subscribers, and the results list is shared
//! between snapshots until another file finishes.

use crate::models::{progress_fraction, ExportFileResult, JobId, JobSnapshot, JobStatus};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

pub const MSG_ALL_SUCCEEDED: &str = "All files exported successfully";
pub const MSG_CANCELLED: &str = "Export job cancelled";

/// Events that drive a job through its lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Worker picked the job up
    Start,
    /// Worker began processing a file
    BeginFile(String),
    /// Worker finished a file, successfully or not
    FileFinished(ExportFileResult),
    /// Worker exhausted the file list
    Finish,
    /// Caller asked to cancel
    CancelRequested,
    /// Worker noticed the cancellation between files
    CancellationObserved,
    /// Worker died without finishing
    Fail(String),
}

/// Mutable job fields. Owned by the job's worker.
#[derive(Debug, Clone)]
pub struct JobState {
    pub status: JobStatus,
    pub message: Option<String>,
    pub current_file: Option<String>,
    pub output_directory: PathBuf,
    pub total_files: usize,
    pub processed_files: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Arc<[ExportFileResult]>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    fn new(total_files: usize, output_directory: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Queued,
            message: None,
            current_file: None,
            output_directory,
            total_files,
            processed_files: 0,
            success_count: 0,
            failure_count: 0,
            results: Vec::new().into(),
            updated_at: now,
        }
    }

    /// The single transition function. Returns `false` when the event is not
    /// valid in the current state, leaving the state unchanged.
    ///
    /// Terminal statuses never change. A cancelled job still accepts the
    /// result of the file that was in flight, and the worker's refined
    /// cancellation message.
    pub fn apply(&mut self, event: JobEvent) -> bool {
        use JobStatus::*;

        match (self.status, event) {
            (Queued, JobEvent::Start) => {
                self.status = Running;
            }
            (Running, JobEvent::BeginFile(name)) => {
                self.current_file = Some(name);
            }
            (Running | Cancelled, JobEvent::FileFinished(result)) => {
                if self.processed_files >= self.total_files {
                    return false;
                }
                if result.success {
                    self.success_count += 1;
                } else {
                    self.failure_count += 1;
                }
                let mut results = Vec::with_capacity(self.results.len() + 1);
                results.extend_from_slice(&self.results);
                results.push(result);
                self.results = results.into();
                self.processed_files += 1;
            }
            (Running, JobEvent::Finish) => {
                self.status = Completed;
                self.current_file = None;
                self.message = Some(if self.failure_count > 0 {
                    format!("Completed with {} failed file(s)", self.failure_count)
                } else {
                    MSG_ALL_SUCCEEDED.to_string()
                });
            }
            (Queued | Running, JobEvent::CancelRequested) => {
                self.status = Cancelled;
                self.message = Some(MSG_CANCELLED.to_string());
            }
            (Cancelled, JobEvent::CancellationObserved) => {
                self.current_file = None;
                self.message = Some(format!(
                    "Export cancelled after processing {} / {}",
                    self.processed_files, self.total_files
                ));
            }
            (Queued | Running, JobEvent::Fail(message)) => {
                self.status = Failed;
                self.current_file = None;
                self.message = Some(message);
            }
            _ => return false,
        }
        true
    }
}

/// One submitted batch and its observable progress
pub struct ExportJob {
    id: JobId,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    snapshot: ArcSwap<JobSnapshot>,
    updates: Option<broadcast::Sender<Arc<JobSnapshot>>>,
}

impl std::fmt::Debug for ExportJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportJob")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl ExportJob {
    pub fn new(
        id: JobId,
        total_files: usize,
        output_directory: PathBuf,
        updates: Option<broadcast::Sender<Arc<JobSnapshot>>>,
    ) -> Self {
        let created_at = Utc::now();
        let state = JobState::new(total_files, output_directory, created_at);
        let snapshot = build_snapshot(id, created_at, &state);
        Self {
            id,
            created_at,
            state: Mutex::new(state),
            snapshot: ArcSwap::from_pointee(snapshot),
            updates,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<JobSnapshot> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> JobStatus {
        self.snapshot.load().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == JobStatus::Cancelled
    }

    /// Apply an event and publish the resulting snapshot. Returns whether the
    /// event was accepted.
    pub fn apply(&self, event: JobEvent) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.apply(event) {
            return false;
        }
        state.updated_at = Utc::now().max(state.updated_at);

        let snapshot = Arc::new(build_snapshot(self.id, self.created_at, &state));
        self.snapshot.store(Arc::clone(&snapshot));
        drop(state);

        if let Some(updates) = &self.updates {
            // No subscribers is fine.
            let _ = updates.send(snapshot);
        }
        true
    }
}

fn build_snapshot(id: JobId, created_at: DateTime<Utc>, state: &JobState) -> JobSnapshot {
    JobSnapshot {
        id,
        status: state.status,
        message: state.message.clone(),
        current_file: state.current_file.clone(),
        output_directory: state.output_directory.clone(),
        total_files: state.total_files,
        processed_files: state.processed_files,
        success_count: state.success_count,
        failure_count: state.failure_count,
        progress: progress_fraction(state.processed_files, state.total_files),
        created_at,
        updated_at: state.updated_at,
        results: Arc::clone(&state.results),
    }
}
