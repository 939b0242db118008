//! The pending FIFO, the running slot and the job registry.
//!
//! Everything here is plain bookkeeping without I/O; the scheduler wraps it in a
//! mutex and does the persisting and notifying around it.

use boardci_core::{Job, JobIdentity, JobStatus};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Running {
    job: Job,
    cancel: CancellationToken,
}

/// Effects of a submission the caller has to account for.
#[derive(Debug, Default)]
pub struct Submitted {
    /// Queued jobs that were dropped in favour of the new one.
    pub superseded: Vec<Job>,
    /// The running job was told to stop in favour of the new one.
    pub stopped: Option<JobIdentity>,
}

/// Effects of a cancellation. A job can be running and queued again under the
/// same identity, so both can happen at once.
#[derive(Debug, Default)]
pub struct Cancelled {
    /// Queued entries that were removed.
    pub dequeued: Vec<Job>,
    /// The running job was told to stop.
    pub signalled: bool,
}

impl Cancelled {
    /// Neither queued nor running.
    pub fn is_inactive(&self) -> bool {
        self.dequeued.is_empty() && !self.signalled
    }
}

/// What is running and what is waiting.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running: Option<Job>,
    pub pending: Vec<Job>,
}

#[derive(Default)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    running: Option<Running>,
    /// Latest known status per identity.
    registry: HashMap<JobIdentity, JobStatus>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop or stop older automatic jobs for the same change, then queue `job`.
    pub fn submit(&mut self, mut job: Job) -> Submitted {
        let mut submitted = Submitted::default();

        let (superseded, kept): (Vec<Job>, Vec<Job>) = self
            .pending
            .drain(..)
            .partition(|queued| queued.is_superseded_by(&job));
        self.pending = kept.into();
        for mut old in superseded {
            info!(job = %old.identity, by = %job.identity, "Superseded while queued");
            old.status = JobStatus::Cancelled;
            self.registry.insert(old.identity.clone(), JobStatus::Cancelled);
            submitted.superseded.push(old);
        }

        if let Some(running) = &self.running {
            if running.job.is_superseded_by(&job) && !running.cancel.is_cancelled() {
                info!(job = %running.job.identity, by = %job.identity, "Stopping superseded job");
                running.cancel.cancel();
                submitted.stopped = Some(running.job.identity.clone());
            }
        }

        job.status = JobStatus::Pending;
        self.registry.insert(job.identity.clone(), JobStatus::Pending);
        self.pending.push_back(job);
        submitted
    }

    /// Remove every queued entry for `identity` and signal it if it is running.
    pub fn cancel(&mut self, identity: &JobIdentity) -> Cancelled {
        let (removed, kept): (Vec<Job>, Vec<Job>) = self
            .pending
            .drain(..)
            .partition(|queued| &queued.identity == identity);
        self.pending = kept.into();

        let mut cancelled = Cancelled {
            dequeued: removed
                .into_iter()
                .map(|mut job| {
                    job.status = JobStatus::Cancelled;
                    job
                })
                .collect(),
            signalled: false,
        };

        if let Some(running) = &self.running {
            if &running.job.identity == identity {
                running.cancel.cancel();
                cancelled.signalled = true;
            }
        }

        // The runner reports the final status of a signalled job itself.
        let status = if cancelled.signalled {
            JobStatus::Running
        } else {
            JobStatus::Cancelled
        };
        self.registry.insert(identity.clone(), status);
        cancelled
    }

    /// Move the head of the queue into the running slot. Returns nothing while a
    /// job is running.
    pub fn start_next(&mut self) -> Option<(Job, CancellationToken)> {
        if self.running.is_some() {
            return None;
        }
        let mut job = self.pending.pop_front()?;
        job.status = JobStatus::Running;
        self.registry.insert(job.identity.clone(), JobStatus::Running);

        let cancel = CancellationToken::new();
        self.running = Some(Running {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        Some((job, cancel))
    }

    /// Free the running slot.
    pub fn finish(&mut self, identity: &JobIdentity, status: JobStatus) {
        if self
            .running
            .as_ref()
            .is_some_and(|r| &r.job.identity == identity)
        {
            self.running = None;
        }
        // A resubmission of the same identity may already be waiting; keep its
        // status visible.
        if !self.pending.iter().any(|job| &job.identity == identity) {
            self.registry.insert(identity.clone(), status);
        }
    }

    pub fn status(&self, identity: &JobIdentity) -> Option<JobStatus> {
        self.registry.get(identity).copied()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.pending.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running: self.running.as_ref().map(|r| r.job.clone()),
            pending: self.pending.iter().cloned().collect(),
        }
    }

    /// Jobs that still count as live: queued ones plus a running job that has
    /// not been told to stop.
    pub fn live_jobs(&self) -> impl Iterator<Item = &Job> {
        self.running
            .iter()
            .filter(|r| !r.cancel.is_cancelled())
            .map(|r| &r.job)
            .chain(self.pending.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::descriptor;
    use proptest::prelude::*;

    fn job(unique_id: u64, change: u64, sha: &str) -> Job {
        Job::new(descriptor(unique_id, change, sha), false)
    }

    fn user_job(unique_id: u64, change: u64, sha: &str) -> Job {
        Job::new(descriptor(unique_id, change, sha), true)
    }

    /// At most one identity per change is live unless a user restart is involved.
    fn supersession_violation(queue: &JobQueue) -> Option<String> {
        let live: Vec<&Job> = queue.live_jobs().collect();
        for a in &live {
            for b in &live {
                if a.identity.shares_key(&b.identity)
                    && a.identity != b.identity
                    && !a.user_initiated
                    && !b.user_initiated
                {
                    return Some(format!("{} and {} are both live", a.identity, b.identity));
                }
            }
        }
        None
    }

    #[test]
    fn test_newer_commit_supersedes_queued_job() {
        let mut queue = JobQueue::new();
        queue.submit(job(1, 42, "aaa"));
        let submitted = queue.submit(job(2, 42, "bbb"));

        assert_eq!(submitted.superseded.len(), 1);
        assert_eq!(submitted.superseded[0].identity.unique_id, 1);
        assert_eq!(
            queue.status(&descriptor(1, 42, "aaa").identity()),
            Some(JobStatus::Cancelled)
        );

        let (next, _) = queue.start_next().unwrap();
        assert_eq!(next.identity.commit_ref, "bbb");
        assert!(queue.start_next().is_none());
    }

    #[test]
    fn test_running_job_is_signalled() {
        let mut queue = JobQueue::new();
        queue.submit(job(1, 42, "aaa"));
        let (_, cancel) = queue.start_next().unwrap();

        let submitted = queue.submit(job(1, 42, "bbb"));
        assert!(cancel.is_cancelled());
        assert_eq!(submitted.stopped.unwrap().commit_ref, "aaa");
    }

    #[test]
    fn test_user_initiated_jobs_are_not_superseded() {
        let mut queue = JobQueue::new();
        queue.submit(user_job(1, 42, "aaa"));
        let submitted = queue.submit(job(2, 42, "bbb"));
        assert!(submitted.superseded.is_empty());
        assert_eq!(queue.snapshot().pending.len(), 2);

        let (_, cancel) = queue.start_next().unwrap();
        queue.submit(job(3, 42, "ccc"));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_identical_identity_is_queued_twice() {
        let mut queue = JobQueue::new();
        let first = job(1, 42, "aaa");
        let second = job(1, 42, "aaa");
        let (first_run, second_run) = (first.run_id, second.run_id);

        queue.submit(first);
        let submitted = queue.submit(second);
        assert!(submitted.superseded.is_empty());

        let (a, _) = queue.start_next().unwrap();
        assert_eq!(a.run_id, first_run);
        queue.finish(&a.identity, JobStatus::Success);
        assert_eq!(queue.status(&a.identity), Some(JobStatus::Pending));

        let (b, _) = queue.start_next().unwrap();
        assert_eq!(b.run_id, second_run);
    }

    #[test]
    fn test_other_changes_are_untouched() {
        let mut queue = JobQueue::new();
        queue.submit(job(1, 42, "aaa"));
        let submitted = queue.submit(job(3, 43, "ccc"));
        assert!(submitted.superseded.is_empty());
        assert_eq!(queue.snapshot().pending.len(), 2);
    }

    #[test]
    fn test_cancel_paths() {
        let mut queue = JobQueue::new();
        queue.submit(job(1, 42, "aaa"));
        queue.submit(job(2, 43, "bbb"));

        let running = queue.start_next().unwrap();
        let cancelled = queue.cancel(&running.0.identity);
        assert!(cancelled.signalled);
        assert!(cancelled.dequeued.is_empty());
        assert!(running.1.is_cancelled());

        let queued = descriptor(2, 43, "bbb").identity();
        let cancelled = queue.cancel(&queued);
        assert!(!cancelled.signalled);
        assert_eq!(cancelled.dequeued.len(), 1);
        assert_eq!(cancelled.dequeued[0].status, JobStatus::Cancelled);

        assert!(queue.cancel(&queued).is_inactive());
        assert_eq!(queue.status(&queued), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_cancel_reaches_running_job_with_queued_duplicate() {
        let mut queue = JobQueue::new();
        queue.submit(job(1, 42, "aaa"));
        let (running, token) = queue.start_next().unwrap();
        queue.submit(job(1, 42, "aaa"));

        let cancelled = queue.cancel(&running.identity);
        assert_eq!(cancelled.dequeued.len(), 1);
        assert!(cancelled.signalled);
        assert!(token.is_cancelled());
        assert!(queue.snapshot().pending.is_empty());
        assert_eq!(queue.status(&running.identity), Some(JobStatus::Running));

        queue.finish(&running.identity, JobStatus::Cancelled);
        assert_eq!(queue.status(&running.identity), Some(JobStatus::Cancelled));
        assert!(queue.is_idle());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Finish,
        Start,
        Cancel(u64),
        Restart(u64),
        Push(u64, &'static str),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            1 => Just(Op::Finish),
            1 => Just(Op::Start),
            1 => (0..3u64).prop_map(Op::Cancel),
            1 => (0..3u64).prop_map(Op::Restart),
            4 => (0..3u64, prop::sample::select(vec!["aaa", "bbb", "ccc"]))
                .prop_map(|(change, sha)| Op::Push(change, sha)),
        ]
    }

    proptest! {
        #[test]
        fn supersession_invariant_holds(ops in prop::collection::vec(arb_op(), 1..200)) {
            let mut queue = JobQueue::new();
            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Finish => {
                        if let Some(running) = queue.snapshot().running {
                            queue.finish(&running.identity, JobStatus::Success);
                        }
                    }
                    Op::Start => {
                        queue.start_next();
                    }
                    Op::Cancel(change) => {
                        queue.cancel(&descriptor(change, change, "aaa").identity());
                    }
                    Op::Restart(change) => {
                        queue.submit(user_job(step as u64, change, &format!("u{}", step)));
                    }
                    Op::Push(change, sha) => {
                        queue.submit(job(change, change, sha));
                    }
                }
                let violation = supersession_violation(&queue);
                prop_assert!(violation.is_none(), "{:?}", violation);
            }
        }
    }
}
