//! Storage module for persistent data storage
//!
//! Provides the SQLite-based job store shared by API and worker processes.

mod database;

pub use database::{JobDatabase, PurgedJobs};
