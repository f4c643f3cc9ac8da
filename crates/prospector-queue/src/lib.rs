//! # Prospector Queue
//!
//! Bounded-concurrency async task runner. Every enqueued task gets its own
//! ephemeral token scoped to exactly the capability it will invoke; the
//! token is revoked on completion or failure regardless of outcome.
//!
//! ## Architecture
//! ```text
//! enqueue(execution, step, capability, input)
//!   → mint scoped token → task Pending → wake dispatcher
//!
//! Dispatcher (condition-based wakeup, idle-timeout fallback)
//!   → promote eligible Pending tasks while running < max_concurrency
//!   → per task: validate token → invoke capability
//!       success  → Completed, broadcast event, revoke token
//!       failure  → attempts left? Pending + exponential backoff
//!                  exhausted?     Failed, broadcast event, revoke token
//! ```

pub mod queue;

pub use queue::{QueueStats, QueuedTask, TaskEvent, TaskQueue, TaskStatus};
