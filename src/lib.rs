//! door43-preview: warms Door43 preview caches and exports preview pages to PDF, one book at a time.

pub mod batch;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod door43;
pub mod engine;
pub mod interrupt;
pub mod model;
pub mod poller;
pub mod processor;
pub mod rename;

// Re-exports for CLI and consumers.
pub use batch::{run_batch, AbortCause, BatchError};
pub use catalog::{BookCode, BookSelection, SelectionError};
pub use door43::{ApiClient, CatalogError, PreviewTarget};
pub use engine::{Backend, Engine, EngineError, EngineLauncher, LaunchError, PageSize};
pub use model::{BatchSummary, FailureReason, ProcessingResult, Unit, UnitStatus};
pub use poller::{poll_until_ready, PollPolicy, Readiness, ReadinessProbe};
pub use processor::{process, Mode, RunConfig, TimeoutPolicy};
