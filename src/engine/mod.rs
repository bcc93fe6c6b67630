//! Execution engine: the trade executor seam and the run orchestrator.

pub mod executor;
pub mod orchestrator;
