//! flowcast - a task orchestration kernel for weather pipelines
//!
//! A library for running small static flows of tasks with:
//! - Memoized task results keyed by a hash of their inputs, with a TTL
//! - Bounded retry with constant or exponential backoff
//! - Conditional steps, partial failure and cancellation
//! - Durable artifacts and run history

pub mod artifacts;
pub mod atomic;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod forecast;
pub mod notifications;
pub mod pipelines;
pub mod storage;

pub use config::Config;
pub use error::{ArtifactError, CacheError, FinalFailure, FlowError, TaskFailure};
pub use execution::{Flow, FlowRun, RetryPolicy, RunContext, RunStatus, Step, Task, TaskCache};
