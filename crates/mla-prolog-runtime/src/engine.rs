use alloc::vec::Vec;
use core::fmt::{Debug, Display};

use crate::sync::{Flag, FlagScope, SyncError};

/// The two engine classes of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    /// Runs tiled matrix multiplications.
    Matrix,
    /// Runs elementwise and reduction stages.
    Vector,
}

/// Logical address of one engine.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId {
    /// Engine class.
    pub kind: EngineKind,
    /// Index within its class.
    pub index: u32,
}

impl EngineId {
    /// Matrix engine `index`.
    pub fn matrix(index: u32) -> Self {
        Self::new(EngineKind::Matrix, index)
    }

    /// Vector engine `index`.
    pub fn vector(index: u32) -> Self {
        Self::new(EngineKind::Vector, index)
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            EngineKind::Matrix => write!(f, "matrix#{}", self.index),
            EngineKind::Vector => write!(f, "vector#{}", self.index),
        }
    }
}

/// Per-wave engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Filling the stage-in buffer.
    Loading,
    /// Computing out of on-chip buffers.
    Computing,
    /// Writing results back to global memory.
    Draining,
    /// Blocked on a cross-engine flag.
    WaitingOnFlag,
}

/// Records the state transitions of one engine.
#[derive(Debug, Default)]
pub struct StateTracker {
    state: EngineState,
    transitions: u64,
}

impl StateTracker {
    /// Moves to `next`, logging the transition.
    pub fn enter(&mut self, engine: EngineId, next: EngineState) {
        if self.state != next {
            log::trace!("{engine}: {:?} -> {next:?}", self.state);
            self.state = next;
            self.transitions += 1;
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Number of state changes so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

/// A token slice processed end-to-end before the next one starts on the same engines.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Wave {
    /// Wave number, shared by every engine that takes part in the same slice.
    pub index: u32,
    /// First token of the slice.
    pub token_start: u32,
    /// Number of tokens in the slice.
    pub token_count: u32,
}

impl Wave {
    /// One past the last token of the slice.
    pub fn token_end(&self) -> u32 {
        self.token_start + self.token_count
    }
}

/// A compute unit that runs stages of a fixed pipeline.
pub trait ComputeEngine: Send {
    /// Stage identifiers this engine can run.
    type Stage: Copy + Debug + Send + Sync;
    /// Error reported when a stage fails.
    type Error: From<SyncError> + Send;

    /// Address of this engine.
    fn id(&self) -> EngineId;

    /// Runs one stage over the given wave.
    fn execute(&mut self, stage: Self::Stage, wave: &Wave) -> Result<(), Self::Error>;

    /// State machine of the engine, driven by both the engine and the pool.
    fn tracker(&mut self) -> &mut StateTracker;
}

/// One step of an engine's instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<S, F> {
    /// Run a compute stage.
    Compute(S),
    /// Signal that this engine finished producing `flag` for the wave.
    Raise {
        /// Flag raised.
        flag: F,
        /// Which consumers see it.
        scope: FlagScope,
    },
    /// Block until every producer raised `flag` for the wave.
    Wait {
        /// Flag waited on.
        flag: F,
        /// Which producers are expected.
        scope: FlagScope,
    },
}

/// Instructions of one wave.
#[derive(new, Debug, Clone)]
pub struct WaveProgram<S, F> {
    /// The token slice.
    pub wave: Wave,
    /// Instructions in program order.
    pub instructions: Vec<Instruction<S, F>>,
}

/// Full instruction stream of one engine, fixed before any engine starts.
#[derive(new, Debug, Clone)]
pub struct Program<S, F: Flag> {
    /// Engine the program is for.
    pub engine: EngineId,
    /// Waves in execution order.
    pub waves: Vec<WaveProgram<S, F>>,
}

impl<S: Copy, F: Flag> Program<S, F> {
    /// Every `(flag, wave, scope)` raised by this program.
    pub fn raises(&self) -> impl Iterator<Item = (F, u32, FlagScope)> + '_ {
        self.waves.iter().flat_map(|block| {
            block.instructions.iter().filter_map(move |ins| match ins {
                Instruction::Raise { flag, scope } => Some((*flag, block.wave.index, *scope)),
                _ => None,
            })
        })
    }

    /// Every `(flag, wave, scope)` waited on by this program.
    pub fn waits(&self) -> impl Iterator<Item = (F, u32, FlagScope)> + '_ {
        self.waves.iter().flat_map(|block| {
            block.instructions.iter().filter_map(move |ins| match ins {
                Instruction::Wait { flag, scope } => Some((*flag, block.wave.index, *scope)),
                _ => None,
            })
        })
    }

    /// Number of compute stages in the program.
    pub fn compute_len(&self) -> usize {
        self.waves
            .iter()
            .map(|block| {
                block
                    .instructions
                    .iter()
                    .filter(|ins| matches!(ins, Instruction::Compute(_)))
                    .count()
            })
            .sum()
    }
}
