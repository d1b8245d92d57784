//! photolab: Background removal service with a durable batch job queue
//!
//! Single images are processed synchronously; batches are prepared, queued in
//! SQLite and processed by workers that may run in the API process or in
//! separate worker processes. Clients poll the job status API for `k/n`
//! progress and the final result list.

pub mod config;
pub mod error;
pub mod imaging;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::PhotolabConfig;
pub use error::{Error, Result};
pub use types::{ItemResult, Job, JobState, JobStatusView, Mode, Progress, ResultReference};
