//! Provider abstractions for background removal and result storage
//!
//! Removal backends and object stores sit behind traits so the worker and the
//! synchronous route never depend on a concrete service.

pub mod local;
pub mod object_store;
pub mod removal;
pub mod replicate;

pub use local::LocalRuntimeProvider;
pub use object_store::{LocalObjectStore, ObjectStore};
pub use removal::{ProviderSet, RemovalProvider};
pub use replicate::ReplicateProvider;
