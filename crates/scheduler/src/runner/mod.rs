//! Step scheduler runner -- the shared runnable set and per-step retry state.
//!
//! Split into focused submodules:
//! - `core`: StepScheduler struct, constructor, locking and accessor methods
//! - `queueing`: making steps runnable, re-keying, and popping for dispatch
//! - `completion`: resource grants, attempt outcomes, rung escalation, eviction

mod core;
mod completion;
mod queueing;
#[cfg(test)]
mod tests;

pub use self::core::StepScheduler;
