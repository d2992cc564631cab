//! Execution kernel for flowcast
//!
//! Provides:
//! - Task result caching with TTL and single-flight
//! - Retry with constant or exponential backoff
//! - Flows with conditional steps, failure propagation and cancellation

pub mod cache;
pub mod clock;
pub mod context;
pub mod flow;
pub mod retry;
pub mod task;

pub use cache::{CacheEntry, CacheKey, CacheStats, CacheStore, MemoryCache, TaskCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RunContext;
pub use flow::{
    FailureMode, Flow, FlowArgs, FlowBuilder, FlowRun, Input, RunStatus, Step, StepOutcome, StepRecord,
};
pub use retry::{
    execute_with_retry, AttemptObserver, AttemptOutcome, DelayStrategy, NoopObserver, RecordingObserver,
    RetryPolicy, TracingObserver,
};
pub use task::{input, output, Task, TaskOutput, TaskResult};
