// src/dag/mod.rs

//! The runnable dependency graph and everything that walks it.
//!
//! - [`graph`] builds the DAG from expanded runnables, rejects cycles and
//!   computes the stable topological order plus transitive closures.
//! - [`select`] filters the DAG down to the set of runnables a CLI
//!   invocation actually asks for.
//! - [`scheduler`] executes a selection in parallel, consulting the cache
//!   for every ready runnable.

pub mod graph;
pub mod scheduler;
pub mod select;

pub use graph::{DagGraph, EdgeInfo};
pub use scheduler::{RunReport, RunStatus, Scheduler, SchedulerOptions};
pub use select::{select, selection_from_primaries, CacheStatus, SelectOptions, Selection};
