//! Priority wait queues for requests that could not be admitted yet.

mod entry;
mod outcomes;
mod wait_queue;

pub use entry::{OutcomeStatus, Priority, QueueEntry, QueueOutcome, QueueStatus};
pub use outcomes::{OutcomeLog, DEFAULT_OUTCOME_CAPACITY, DEFAULT_OUTCOME_TTL};
pub use wait_queue::{PriorityWaitQueue, WaitQueues};
