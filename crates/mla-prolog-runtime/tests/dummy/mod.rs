use std::sync::Arc;

use mla_prolog_runtime::engine::{StateTracker, WaveProgram};
use mla_prolog_runtime::memory::{Arena, ArenaError, RegionSpec};
use mla_prolog_runtime::pool::PoolError;
use mla_prolog_runtime::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DummyFlag {
    Produced,
    Consumed,
}

impl Flag for DummyFlag {
    fn name(&self) -> &'static str {
        match self {
            DummyFlag::Produced => "Produced",
            DummyFlag::Consumed => "Consumed",
        }
    }

    fn producer(&self) -> EngineKind {
        match self {
            DummyFlag::Produced => EngineKind::Matrix,
            DummyFlag::Consumed => EngineKind::Vector,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DummyStage {
    Produce,
    Consume,
    Explode,
}

#[derive(Debug)]
pub enum DummyError {
    Sync(SyncError),
    Pool(PoolError),
    Arena(ArenaError),
}

impl From<SyncError> for DummyError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<PoolError> for DummyError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<ArenaError> for DummyError {
    fn from(value: ArenaError) -> Self {
        Self::Arena(value)
    }
}

/// Matrix engines write `wave + 1` into their slot, vector engines read their pair's slot.
pub struct DummyEngine {
    pub id: EngineId,
    pub arena: Arc<Arena>,
    pub seen: Vec<u32>,
    tracker: StateTracker,
}

impl DummyEngine {
    pub fn new(id: EngineId, arena: Arc<Arena>) -> Self {
        Self {
            id,
            arena,
            seen: Vec::new(),
            tracker: StateTracker::default(),
        }
    }
}

impl ComputeEngine for DummyEngine {
    type Stage = DummyStage;
    type Error = DummyError;

    fn id(&self) -> EngineId {
        self.id
    }

    fn execute(&mut self, stage: DummyStage, wave: &Wave) -> Result<(), DummyError> {
        let region = self.arena.region(0)?;
        match stage {
            DummyStage::Produce => {
                self.tracker.enter(self.id, EngineState::Draining);
                let view = self.arena.view::<u32>(region, self.id.index as usize, 1)?;
                self.arena.store(&view, &[wave.index + 1])?;
            }
            DummyStage::Consume => {
                self.tracker.enter(self.id, EngineState::Loading);
                let pair = Topology::paired_matrix(self.id.index) as usize;
                let view = self.arena.view::<u32>(region, pair, 1)?;
                self.seen.extend(self.arena.to_vec(&view)?);
            }
            DummyStage::Explode => panic!("stage exploded"),
        }
        Ok(())
    }

    fn tracker(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }
}

pub fn arena(matrix_engines: u32) -> Arc<Arena> {
    Arc::new(Arena::new([RegionSpec::new(
        "slots",
        0,
        matrix_engines as u64 * 4,
    )]))
}

pub fn matrix_program(index: u32, waves: u32) -> Program<DummyStage, DummyFlag> {
    let scope = FlagScope::Pair(index);
    let waves = (0..waves)
        .map(|wave| {
            WaveProgram::new(
                Wave::new(wave, wave, 1),
                vec![
                    Instruction::Compute(DummyStage::Produce),
                    Instruction::Raise {
                        flag: DummyFlag::Produced,
                        scope,
                    },
                    Instruction::Wait {
                        flag: DummyFlag::Consumed,
                        scope,
                    },
                ],
            )
        })
        .collect();

    Program::new(EngineId::matrix(index), waves)
}

pub fn vector_program(index: u32, waves: u32) -> Program<DummyStage, DummyFlag> {
    let scope = FlagScope::Pair(Topology::paired_matrix(index));
    let waves = (0..waves)
        .map(|wave| {
            WaveProgram::new(
                Wave::new(wave, wave, 1),
                vec![
                    Instruction::Wait {
                        flag: DummyFlag::Produced,
                        scope,
                    },
                    Instruction::Compute(DummyStage::Consume),
                    Instruction::Raise {
                        flag: DummyFlag::Consumed,
                        scope,
                    },
                ],
            )
        })
        .collect();

    Program::new(EngineId::vector(index), waves)
}
