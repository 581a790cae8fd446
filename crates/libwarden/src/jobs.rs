//! Deferred work items.
//!
//! A job sits in the queue until the pid it waits for is reaped (or, for
//! unbound jobs with `waitfor == -1`, until the next loop tick) and its
//! `not_before` deadline has passed. Running a job may yield a new child
//! pid; a job's successor is then re-keyed to that pid and pushed to the
//! *front* of the queue, so it preempts any other entry that might also be
//! waiting on the same child. Successor chains are trees by construction
//! (`Box` ownership), so no cycles can form.

use std::collections::VecDeque;
use std::time::Instant;

use crate::request::{Request, Waiter};

#[derive(Debug)]
pub enum JobPayload {
    /// Execute a (possibly synthesized) request; yields a spawned pid.
    Run(Request),
    /// Send `OK <code>` for the exit of the awaited child.
    Reply(Waiter),
}

#[derive(Debug)]
pub struct Job {
    pub payload: JobPayload,
    /// Pid whose exit releases this job; −1 runs on every tick.
    pub waitfor: i32,
    /// Deadline before which the job is skipped; `None` means immediately.
    pub not_before: Option<Instant>,
    pub successor: Option<Box<Job>>,
}

impl Job {
    /// An unbound, immediately runnable job.
    pub fn run(request: Request) -> Self {
        Self {
            payload: JobPayload::Run(request),
            waitfor: -1,
            not_before: None,
            successor: None,
        }
    }

    /// A reply job released by the exit of `waitfor`.
    pub fn waiter(waiter: Waiter, waitfor: i32) -> Self {
        Self {
            payload: JobPayload::Reply(waiter),
            waitfor,
            not_before: None,
            successor: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend(&mut self, job: Job) {
        self.jobs.push_front(job);
    }

    pub fn append(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Extract every job bound to `pid` whose deadline has passed.
    ///
    /// The scan runs from the tail toward the head so the extracted jobs
    /// come back in their original queue order. Jobs whose delay has not
    /// elapsed stay in place.
    pub fn take_ready(&mut self, pid: i32, now: Instant) -> Vec<Job> {
        let mut taken: VecDeque<Job> = VecDeque::new();
        let mut idx = self.jobs.len();
        while idx > 0 {
            idx -= 1;
            let job = &self.jobs[idx];
            if job.waitfor == pid && job.not_before.is_none_or(|t| t <= now) {
                let job = self.jobs.remove(idx).unwrap();
                taken.push_front(job);
            }
        }
        taken.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActionKind;
    use crate::request::RequestFlags;
    use std::time::Duration;

    fn job_for(tag: &str, waitfor: i32, not_before: Option<Instant>) -> Job {
        Job {
            payload: JobPayload::Run(Request::internal(
                tag.to_owned(),
                ActionKind::Start,
                RequestFlags::default(),
            )),
            waitfor,
            not_before,
            successor: None,
        }
    }

    fn tag(job: &Job) -> String {
        match &job.payload {
            JobPayload::Run(req) => req.program.clone(),
            JobPayload::Reply(_) => "waiter".to_owned(),
        }
    }

    #[test]
    fn extraction_preserves_queue_order() {
        let mut queue = JobQueue::new();
        queue.append(job_for("first", 7, None));
        queue.append(job_for("other", 8, None));
        queue.append(job_for("second", 7, None));
        let taken = queue.take_ready(7, Instant::now());
        let tags: Vec<String> = taken.iter().map(tag).collect();
        assert_eq!(tags, ["first", "second"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unelapsed_deadlines_are_skipped() {
        let now = Instant::now();
        let mut queue = JobQueue::new();
        queue.append(job_for("later", 7, Some(now + Duration::from_secs(5))));
        queue.append(job_for("due", 7, Some(now)));
        let taken = queue.take_ready(7, now);
        assert_eq!(taken.len(), 1);
        assert_eq!(tag(&taken[0]), "due");
        // The skipped job stays queued and becomes ready once time passes.
        let taken = queue.take_ready(7, now + Duration::from_secs(6));
        assert_eq!(taken.len(), 1);
        assert_eq!(tag(&taken[0]), "later");
        assert!(queue.is_empty());
    }

    #[test]
    fn unbound_jobs_only_match_the_tick_pid() {
        let mut queue = JobQueue::new();
        queue.append(job_for("unbound", -1, None));
        assert!(queue.take_ready(7, Instant::now()).is_empty());
        assert_eq!(queue.take_ready(-1, Instant::now()).len(), 1);
    }

    #[test]
    fn prepended_jobs_run_before_earlier_waiters() {
        let mut queue = JobQueue::new();
        queue.append(job_for("old-waiter", 7, None));
        queue.prepend(job_for("successor", 7, None));
        let taken = queue.take_ready(7, Instant::now());
        let tags: Vec<String> = taken.iter().map(tag).collect();
        assert_eq!(tags, ["successor", "old-waiter"]);
    }
}
