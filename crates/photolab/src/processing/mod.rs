//! Background processing with a durable job queue and progress tracking

mod job_queue;
mod sink;
mod worker;

pub use job_queue::{JobQueue, QueueStats};
pub use sink::ResultSink;
pub use worker::{spawn_workers, BatchWorker};
