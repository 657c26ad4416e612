//! Fused MLA prolog: classifies an invocation, plans how its matmuls and elementwise stages
//! split over the matrix and vector engines, and runs the plan on a thread per engine.
//!
//! ```text
//! PrologProblem -> Planner -> PrologPlan -> Executor -> caches and outputs written
//! ```

extern crate alloc;

#[macro_use]
extern crate derive_new;

/// Problem description, classification and dispatch selector.
pub mod components;
/// Engine programs and the stages they run.
pub mod pipeline;
/// Partitions, per-wave constants and the workspace layout.
pub mod tiling;
