//! # Prospector Workflow
//!
//! Declarative step/template execution over the capability boundary.
//!
//! ## Architecture
//! ```text
//! WorkflowTemplate (ordered steps, typed bindings, strategies)
//!   → compile: bindings validated at load time
//!   → WorkflowExecutor.execute(template, params, tenant)
//!     → per step: skip check → cache check → dispatch
//!       Sync:     direct capability call with inline retry
//!       Queue:    fan-out through the bounded task queue → fan-in wait
//!       Parallel: direct concurrent calls, per-step cap
//!     → output stored under the step's variable name
//!
//! DiscoveryPipeline (concrete template, end to end)
//!   resolve sub-targets → enqueue per-target tasks → fan-in
//!   → aggregate/dedupe → summarize → suggest next actions
//! ```

pub mod bindings;
pub mod context;
pub mod discovery;
pub mod execution;
pub mod executor;
pub mod template;

pub use bindings::{BindingPath, BindingRoot, CompiledValue, ExecutionScope};
pub use context::PipelineContext;
pub use discovery::{
    BusinessRecord, DiscoveryPipeline, DiscoveryReport, DiscoveryRequest, DiscoverySummary,
    NextAction, SubTargetOutcome, aggregate_records, suggest_next_actions, summarize,
};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use executor::{FanInResult, TaskTerminal, WorkflowExecutor, wait_for_tasks};
pub use template::{
    CompiledStep, CompiledTemplate, ParameterSpec, RetryPolicy, StepCache, StepStrategy,
    WorkflowStep, WorkflowTemplate,
};
