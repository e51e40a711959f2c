//! Step scheduling core of the build farm queue runner.
//!
//! Decides the order runnable build steps are dispatched in, and how much
//! run time and how many cores each attempt of a step is granted.
//!
//! - [`step_info`]: priority snapshots and the dispatch order over them
//! - [`runnable`]: the sorted set of runnable steps
//! - [`ladder`]: the rung ladder that grows a step's grant across retries
//! - [`shares`]: jobset fairness accounting
//! - [`runner`]: [`StepScheduler`], the locked facade the dispatch loop uses

pub mod error;
pub mod ladder;
pub mod metrics;
pub mod runnable;
pub mod runner;
pub mod shares;
pub mod step_info;
pub mod types;

pub use error::SchedulerError;
pub use ladder::{ResourceGrant, Rung};
pub use metrics::SchedulerMetrics;
pub use runnable::RunnableSet;
pub use runner::StepScheduler;
pub use shares::ShareTracker;
pub use step_info::{compare_priority, StepInfo, NO_JOBSET_SHARE};
pub use types::{AttemptOutcome, AttemptReport, Dispatch, StepStatus, Verdict};
