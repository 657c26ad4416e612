use alloc::vec::Vec;
use core::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use crate::engine::{ComputeEngine, EngineId, EngineState, Instruction, Program};
use crate::sync::{Flag, FlagBoard, FlagKey, SyncError};

/// Failures of the pool itself rather than of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// An engine thread panicked.
    EnginePanicked(EngineId),
    /// A program was handed to an engine with another id.
    ProgramMismatch {
        /// Engine running the program.
        engine: EngineId,
        /// Engine the program was built for.
        program: EngineId,
    },
}

impl Display for PoolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PoolError::EnginePanicked(engine) => write!(f, "{engine} panicked"),
            PoolError::ProgramMismatch { engine, program } => {
                write!(f, "{engine} was given the program of {program}")
            }
        }
    }
}

/// An engine together with its instruction stream.
pub struct EngineSlot<E: ComputeEngine, F: Flag> {
    engine: E,
    program: Program<E::Stage, F>,
}

impl<E: ComputeEngine, F: Flag> EngineSlot<E, F> {
    /// Pairs an engine with its program.
    pub fn new(engine: E, program: Program<E::Stage, F>) -> Self {
        Self { engine, program }
    }
}

/// Runs every engine on its own thread until all programs complete or one fails.
///
/// Threads are created once per run, one per engine, and joined before returning. The first
/// failing engine aborts the board, which wakes every waiter; its error is the one returned.
/// Engines come back in their input order so the caller can read their final state.
pub fn run_engines<E, F>(
    slots: Vec<EngineSlot<E, F>>,
    board: &FlagBoard<F>,
) -> Result<Vec<E>, E::Error>
where
    E: ComputeEngine,
    E::Error: From<PoolError>,
    F: Flag,
{
    let outcomes: Vec<(EngineId, Result<E, (bool, E::Error)>)> = thread::scope(|scope| {
        let handles: Vec<_> = slots
            .into_iter()
            .map(|slot| {
                let id = slot.engine.id();
                let handle = scope.spawn(move || work(slot, board));
                (id, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(id, handle)| {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(_) => Err((board.abort(id), PoolError::EnginePanicked(id).into())),
                };
                (id, outcome)
            })
            .collect()
    });

    let mut engines = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    let mut any_error = None;

    for (id, outcome) in outcomes {
        match outcome {
            Ok(engine) => engines.push(engine),
            Err((true, err)) => {
                log::debug!("{id} failed first");
                first_error.get_or_insert(err);
            }
            Err((false, err)) => {
                any_error.get_or_insert(err);
            }
        }
    }

    match first_error.or(any_error) {
        Some(err) => Err(err),
        None => Ok(engines),
    }
}

fn work<E, F>(mut slot: EngineSlot<E, F>, board: &FlagBoard<F>) -> Result<E, (bool, E::Error)>
where
    E: ComputeEngine,
    E::Error: From<PoolError>,
    F: Flag,
{
    let id = slot.engine.id();
    log::trace!("Engine {id} started");

    let result = catch_unwind(AssertUnwindSafe(|| {
        run_program(&mut slot.engine, &slot.program, board)
    }));

    let result = match result {
        Ok(result) => result,
        Err(_) => Err(PoolError::EnginePanicked(id).into()),
    };

    log::trace!(
        "Engine {id} stopped after {} transitions",
        slot.engine.tracker().transitions()
    );

    match result {
        Ok(()) => Ok(slot.engine),
        Err(err) => Err((board.abort(id), err)),
    }
}

fn run_program<E, F>(
    engine: &mut E,
    program: &Program<E::Stage, F>,
    board: &FlagBoard<F>,
) -> Result<(), E::Error>
where
    E: ComputeEngine,
    E::Error: From<PoolError>,
    F: Flag,
{
    let id = engine.id();
    if program.engine != id {
        return Err(PoolError::ProgramMismatch {
            engine: id,
            program: program.engine,
        }
        .into());
    }

    for block in program.waves.iter() {
        for instruction in block.instructions.iter() {
            if board.is_aborted() {
                return Err(SyncError::Aborted { engine: id }.into());
            }

            match *instruction {
                Instruction::Compute(stage) => {
                    engine.execute(stage, &block.wave)?;
                }
                Instruction::Raise { flag, scope } => {
                    board.raise(FlagKey::new(flag, block.wave.index, scope), id)?;
                }
                Instruction::Wait { flag, scope } => {
                    engine.tracker().enter(id, EngineState::WaitingOnFlag);
                    board.wait(FlagKey::new(flag, block.wave.index, scope), id)?;
                }
            }
        }
        engine.tracker().enter(id, EngineState::Idle);
    }

    Ok(())
}
