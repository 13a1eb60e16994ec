//! Per-job status cache
//!
//! - At most one scheduler query per job is in flight; concurrent callers
//!   wait for it and share its result.
//! - A snapshot younger than the minimum interval is served from the cache.
//! - Done snapshots are final. Only the most recent finished jobs are
//!   kept; older ones are evicted and looked up again if asked for.
//! - Snapshots of one job never move backwards through the lifecycle.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::Result;
use crate::status::{JobFailure, JobStatus};

#[derive(Default)]
struct Slot {
    last: Option<(JobStatus, Instant)>,
}

/// Finished jobs whose final snapshot is kept
pub const DEFAULT_FINISHED_RETAINED: usize = 1024;

pub struct StatusCache {
    min_interval: Duration,
    retained: usize,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
    finished: Mutex<VecDeque<String>>,
}

impl StatusCache {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_retention(min_interval, DEFAULT_FINISHED_RETAINED)
    }

    pub fn with_retention(min_interval: Duration, retained: usize) -> Self {
        Self {
            min_interval,
            retained,
            slots: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<Slot>>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, job_id: &str) -> Arc<tokio::sync::Mutex<Slot>> {
        self.slots().entry(job_id.to_string()).or_default().clone()
    }

    /// Note a job that just finished, evicting the oldest finished ones
    fn retire(&self, job_id: &str) {
        let evicted: Vec<String> = {
            let mut finished = match self.finished.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            finished.push_back(job_id.to_string());
            let excess = finished.len().saturating_sub(self.retained);
            finished.drain(..excess).collect()
        };
        if !evicted.is_empty() {
            trace!(count = evicted.len(), "evicting finished jobs from status cache");
            let mut slots = self.slots();
            for id in &evicted {
                slots.remove(id);
            }
        }
    }

    /// Return a cached snapshot or run `poll` to get a fresh one
    pub async fn get_or_poll<F, Fut>(&self, job_id: &str, poll: F) -> Result<JobStatus>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobStatus>>,
    {
        let slot = self.slot(job_id);
        let mut guard = slot.lock().await;

        if let Some((status, at)) = &guard.last {
            if status.is_done() || at.elapsed() < self.min_interval {
                trace!(job_id, "serving cached status");
                return Ok(status.clone());
            }
        }

        let fresh = match poll().await {
            Ok(fresh) => fresh,
            Err(e) => {
                if guard.last.is_none() {
                    drop(guard);
                    self.forget(job_id);
                }
                return Err(e);
            }
        };
        let previous = guard.last.as_ref().map(|(status, _)| status);
        let merged = merge(previous, fresh);

        // A failed poll must not stop the next caller from trying again
        if !merged.is_unreachable() {
            guard.last = Some((merged.clone(), Instant::now()));
            if merged.is_done() {
                self.retire(job_id);
            }
        }

        Ok(merged)
    }

    /// Store a snapshot produced outside a poll (e.g. after cancelling)
    pub async fn record(&self, status: JobStatus) -> JobStatus {
        let slot = self.slot(status.job_id());
        let mut guard = slot.lock().await;
        let previous = guard.last.as_ref().map(|(status, _)| status);
        let was_done = previous.map_or(false, JobStatus::is_done);
        let merged = merge(previous, status);
        guard.last = Some((merged.clone(), Instant::now()));
        if merged.is_done() && !was_done {
            self.retire(merged.job_id());
        }
        merged
    }

    /// Last known snapshot, without polling
    pub async fn peek(&self, job_id: &str) -> Option<JobStatus> {
        let slot = self.slots().get(job_id).cloned()?;
        let guard = slot.lock().await;
        guard.last.as_ref().map(|(status, _)| status.clone())
    }

    pub fn forget(&self, job_id: &str) {
        self.slots().remove(job_id);
    }

    /// Number of jobs with a slot
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Combine a fresh snapshot with the previous one without going backwards
fn merge(previous: Option<&JobStatus>, fresh: JobStatus) -> JobStatus {
    let Some(previous) = previous else {
        return fresh;
    };

    if previous.is_done() {
        return previous.clone();
    }

    if fresh.is_unreachable() {
        // Keep the last known position, carry the poll failure
        let failure = fresh
            .failure()
            .cloned()
            .unwrap_or_else(|| JobFailure::Unreachable {
                adaptor: String::new(),
                job_id: fresh.job_id().to_string(),
                message: "unknown".to_string(),
            });
        return previous.carrying(failure);
    }

    if fresh.phase() < previous.phase() {
        trace!(
            job_id = fresh.job_id(),
            previous = previous.state(),
            fresh = fresh.state(),
            "ignoring status regression"
        );
        return previous.clone();
    }

    fresh
}
