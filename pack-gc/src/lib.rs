//! Out-of-process mark-and-copy garbage collection for a pack store.
//!
//! [`worker::GcWorker`] runs the Mark, Sort & coalesce, and Copy phases
//! against a read-only view of the store, rooted at a single commit offset
//! the writer supplies. [`orchestrator::GcOrchestrator`] drives the worker
//! as a background task, waits for its result descriptor, and performs the
//! final Report phase: reconciling the suffix's chunk bookkeeping and
//! atomically swapping the new prefix and mapping into the File Manager.

pub mod error;
pub mod orchestrator;
pub mod worker;

pub use error::{Error, Result};
pub use orchestrator::GcOrchestrator;
pub use worker::{GcStats, GcWorker, ObjectGraph};
