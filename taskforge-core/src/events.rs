//! The central FIFO event queue (C5). Events are the only way the event
//! loop thread learns that a job body has finished, a job has been decided
//! skippable, or a failure needs to cascade.

use crate::status::Diagnostic;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub enum Event {
    /// `job_id` has every upstream terminal and `should_run = Yes`; submit
    /// it to the execution backend.
    JobReady(String),
    /// The execution backend returned successfully with this output map and
    /// whatever stdout/stderr it captured (empty unless `always_capture_output`
    /// is set and the job ran in an isolated child).
    JobSuccess(String, crate::fingerprint::FingerprintMap, crate::execution::CapturedOutput),
    /// `job_id` was decided `should_run = No`; its historical output carries
    /// forward unchanged.
    JobSkipped(String),
    /// The execution backend reported a failure for `job_id`.
    JobFailed(String, Diagnostic),
    /// `job_id`'s upstream already failed; this is bookkeeping only, the
    /// terminal state was set when the cascade was raised.
    JobUpstreamFailed(String),
}

impl Event {
    pub fn job_id(&self) -> &str {
        match self {
            Event::JobReady(id)
            | Event::JobSuccess(id, _, _)
            | Event::JobSkipped(id)
            | Event::JobFailed(id, _)
            | Event::JobUpstreamFailed(id) => id,
        }
    }
}

/// Plain FIFO. Single-consumer, single-producer-at-a-time: the loop thread
/// drains it between worker-completion waits.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
