//! # Prospector Scheduler
//!
//! Recurring triggers for the discovery pipeline.
//!
//! ## Architecture
//! ```text
//! "every Monday at 9am"
//!   → parse: CanonicalTrigger { day_of_week, time_of_day }
//!   → cron "0 9 * * 1"
//!   → Schedule (stored, per tenant, enabled flag)
//!
//! Heartbeat (tokio interval, default 60s)
//!   → tick: scan enabled schedules, fire due ones sequentially
//!     InProcess → DiscoveryPipeline run
//!     Worker    → spawned child process, tracked in WorkerTable
//!   → last_result recorded, next_run recomputed from completion
//! ```

pub mod cron;
pub mod engine;
pub mod parse;
pub mod schedule;
pub mod store;
pub mod worker;

pub use cron::next_run_from_cron;
pub use engine::{REGION_DISCOVERY, ScheduleEngine};
pub use parse::{CanonicalTrigger, Interval, parse_trigger};
pub use schedule::{RunOutcome, Schedule, ScheduleKind, Trigger};
pub use store::{JsonScheduleStore, MemoryScheduleStore, ScheduleStore};
pub use worker::WorkerTable;
