//! File-based job leasing and the array-task driver for cGP replicates.

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod fsutil;
pub mod lock;

pub use config::{BatchConfig, JobConfig};
pub use coordinator::{Grant, GrantKind, JobCoordinator, LeaseStatus};
pub use driver::{results_path, run_array, run_batch, BatchSummary, Replicate, StudyReplicate};
pub use error::{JobError, Result};
pub use lock::FileLock;
