//! gantry - Event-sourced CI pipeline orchestration engine
//!
//! A Rust engine that parses declarative pipeline definitions into a DAG of
//! jobs and drives them to completion with bounded parallelism.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All run state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Failed runs can be resumed, re-executing only the jobs that did not
//!   succeed
//!
//! Execution follows the dependency graph: the scheduler dispatches jobs
//! whose `needs` are satisfied and whose gate condition holds, up to a
//! configurable concurrency limit. Jobs exchange data only through the
//! write-once artifact store and the typed output registry.
//!
//! # Modules
//!
//! - `core`: Orchestration logic (Scheduler, JobGraph, EventStore, stores)
//! - `domain`: Data structures (Event, Run, JobResult, Artifact)
//! - `runners`: Step execution substrates (shell)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! gantry run ci.yaml --event push --branch main
//!
//! # Check run status
//! gantry status <run-id>
//!
//! # Resume a failed run
//! gantry resume <run-id> ci.yaml
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod runners;

// Re-export main types at crate root for convenience
pub use crate::core::{JobExecutor, JobGraph, Pipeline, Scheduler};
pub use domain::{Event, EventType, JobResult, JobStatus, Run, RunState, TriggerContext};
pub use runners::{Runner, ShellRunner};
