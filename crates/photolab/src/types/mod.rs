//! Core types for the photolab service

pub mod job;

pub use job::{
    ClaimedJob, ItemResult, ItemStatus, Job, JobItem, JobState, JobStatusView, Mode, Progress,
    ResultReference,
};
