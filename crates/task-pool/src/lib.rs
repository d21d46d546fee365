//! A threaded task runner for the decode pipeline.
//!
//! The pool executes a DAG of parallelisable work. Tasks either stand alone
//! or belong to a [`TaskGroup`], whose typed dependency edges carry a shared
//! value ([`TaskValue`]) from producer to consumers. A task with unmet input
//! dependencies waits on its lowest unmet one and is re-examined whenever
//! that dependency is met.
//!
//! With `thread_count == 0` the pool spawns no threads and runs ready tasks
//! deterministically on the caller during `add`/`dependency_met`/wait calls.
//!
//! Currently a simple FIFO of ready task parts consumed by workers under one
//! coarse mutex; the structure leaves room for work stealing later.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

mod group;
mod pool;

#[cfg(test)]
mod tests;

pub use self::group::{TaskDependency, TaskGroup, TaskParams};
pub use self::pool::{TaskHandle, TaskPart, TaskPool};

use std::any::Any;
use std::sync::Arc;

/// Shared, type-erased value carried by a dependency edge or returned by a
/// task.
pub type TaskValue = Arc<dyn Any + Send + Sync>;

/// Maximum number of dependencies within a task group.
pub const MAX_DEPENDENCIES: u32 = 16384;
