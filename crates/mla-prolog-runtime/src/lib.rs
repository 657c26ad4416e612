#![warn(missing_docs)]

//! Execution substrate of the MLA prolog: the fixed engine topology, cross-engine flags with a
//! watchdog, a typed scratch arena and the thread-per-engine pool running fixed programs.

extern crate alloc;

#[macro_use]
extern crate derive_new;

/// Global configuration and logging.
pub mod config;
/// Dispatch counters.
pub mod counters;
/// Engine abstraction and instruction streams.
pub mod engine;
/// Typed scratch arena.
pub mod memory;
/// Thread-per-engine pool.
pub mod pool;
/// Cross-engine flags.
pub mod sync;
/// Engine counts and on-chip buffer sizes.
pub mod topology;

pub use counters::{DispatchCounters, DispatchSnapshot};
pub use engine::{ComputeEngine, EngineId, EngineKind, EngineState, Instruction, Program, Wave};
pub use sync::{Flag, FlagBoard, FlagKey, FlagScope, SyncError};
pub use topology::{BufferHierarchy, Topology, TopologyError};
