use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::error::{Result, SimError};
use crate::scheduler::job::{Job, JobId, JobPriority};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: JobPriority,
    seq: Reverse<u64>,
    job_id: JobId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered holding area for pending jobs.
///
/// Holds job identifiers only; the job table owns the jobs. Entries come out
/// highest priority first and, within a priority, oldest first.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    members: HashSet<JobId>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            members: HashSet::new(),
            max_jobs,
        }
    }

    /// Add a job. Returns false if the job is already queued.
    pub fn enqueue(&mut self, job: &Job) -> bool {
        if !self.members.insert(job.id.clone()) {
            return false;
        }
        self.heap.push(QueueEntry {
            priority: job.priority,
            seq: Reverse(job.seq),
            job_id: job.id.clone(),
        });
        true
    }

    /// Remove and return the highest-priority, oldest job.
    pub fn dequeue(&mut self) -> Result<JobId> {
        let entry = self.heap.pop().ok_or(SimError::EmptyQueue)?;
        self.members.remove(&entry.job_id);
        Ok(entry.job_id)
    }

    pub fn peek(&self) -> Option<&JobId> {
        self.heap.peek().map(|e| &e.job_id)
    }

    /// Queued job ids in dispatch order.
    pub fn ids_in_order(&self) -> Vec<JobId> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.job_id.clone()).collect()
    }

    /// Returns the current number of queued jobs
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.max_jobs
    }
}
