use alloc::vec::Vec;
use core::fmt::{Debug, Display};
use core::hash::Hash;
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::engine::{EngineId, EngineKind};
use crate::topology::VECTOR_ENGINES_PER_MATRIX;

/// A named cross-engine synchronization point.
///
/// Implementors are plain enums: raise and wait sites name the variant, so a flag can't be
/// confused with another one that happens to share an integer id.
pub trait Flag: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Name used in logs and stall reports.
    fn name(&self) -> &'static str;
    /// Engine class that raises the flag.
    fn producer(&self) -> EngineKind;
}

/// Which engines take part in one flag exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagScope {
    /// Only the matrix engine with this index and its two vector engines.
    Pair(u32),
    /// Every engine of both classes.
    Global,
}

/// Identifies one raise/wait exchange.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagKey<F> {
    /// The flag.
    pub flag: F,
    /// Wave the exchange belongs to.
    pub wave: u32,
    /// Engines involved.
    pub scope: FlagScope,
}

impl<F: Flag> Display for FlagKey<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.scope {
            FlagScope::Pair(index) => {
                write!(f, "{}[wave {}, pair {index}]", self.flag.name(), self.wave)
            }
            FlagScope::Global => write!(f, "{}[wave {}, global]", self.flag.name(), self.wave),
        }
    }
}

/// Errors raised by the flag board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A flag wasn't complete before the watchdog fired.
    Stalled {
        /// Stalled flag.
        flag: &'static str,
        /// Wave of the stalled exchange.
        wave: u32,
        /// Scope of the stalled exchange.
        scope: FlagScope,
        /// Engine that gave up waiting.
        engine: EngineId,
        /// Raises seen before the timeout.
        raised: u32,
        /// Raises needed.
        expected: u32,
        /// Time spent waiting.
        waited: Duration,
    },
    /// A flag was raised more often than it has producers.
    OverRaised {
        /// Offending flag.
        flag: &'static str,
        /// Wave of the exchange.
        wave: u32,
        /// Engine that raised once too many.
        engine: EngineId,
    },
    /// The flag was raised by the wrong engine class.
    WrongProducer {
        /// Offending flag.
        flag: &'static str,
        /// Engine that raised it.
        engine: EngineId,
    },
    /// Another engine failed and the run is being torn down.
    Aborted {
        /// Engine that noticed the abort.
        engine: EngineId,
    },
    /// An engine panicked while holding the board lock.
    Poisoned,
}

impl Display for SyncError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyncError::Stalled {
                flag,
                wave,
                scope,
                engine,
                raised,
                expected,
                waited,
            } => write!(
                f,
                "{engine} stalled {waited:?} on flag {flag} (wave {wave}, {scope:?}): {raised}/{expected} raises"
            ),
            SyncError::OverRaised { flag, wave, engine } => {
                write!(f, "{engine} raised flag {flag} of wave {wave} after it was complete")
            }
            SyncError::WrongProducer { flag, engine } => {
                write!(f, "{engine} is not a producer of flag {flag}")
            }
            SyncError::Aborted { engine } => write!(f, "{engine} stopped because the run aborted"),
            SyncError::Poisoned => write!(f, "the flag board lock is poisoned"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FlagSlot {
    raised: u32,
    waits: u32,
}

#[derive(Debug)]
struct BoardState<F> {
    slots: HashMap<FlagKey<F>, FlagSlot>,
    aborted_by: Option<EngineId>,
}

/// Incomplete exchange found by [FlagBoard::audit].
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct FlagImbalance<F> {
    /// The exchange.
    pub key: FlagKey<F>,
    /// Raises seen.
    pub raised: u32,
    /// Raises needed.
    pub expected: u32,
}

/// Counting one-shot flags shared by every engine of one run.
///
/// An exchange is complete once every producer in its scope raised it. Waiting on a complete
/// exchange returns immediately, so each consumer waits exactly once and never consumes the
/// signal of another consumer.
#[derive(Debug)]
pub struct FlagBoard<F> {
    state: Mutex<BoardState<F>>,
    signal: Condvar,
    matrix_engines: u32,
    vector_engines: u32,
    timeout: Duration,
}

impl<F: Flag> FlagBoard<F> {
    /// Creates a board for `matrix_engines` matrix engines and `vector_engines` vector engines.
    pub fn new(matrix_engines: u32, vector_engines: u32, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BoardState {
                slots: HashMap::new(),
                aborted_by: None,
            }),
            signal: Condvar::new(),
            matrix_engines,
            vector_engines,
            timeout,
        }
    }

    /// Number of raises that complete an exchange.
    pub fn expected(&self, key: &FlagKey<F>) -> u32 {
        match (key.scope, key.flag.producer()) {
            (FlagScope::Pair(_), EngineKind::Matrix) => 1,
            (FlagScope::Pair(_), EngineKind::Vector) => VECTOR_ENGINES_PER_MATRIX,
            (FlagScope::Global, EngineKind::Matrix) => self.matrix_engines,
            (FlagScope::Global, EngineKind::Vector) => self.vector_engines,
        }
    }

    /// Records one raise of `key` by `engine`.
    pub fn raise(&self, key: FlagKey<F>, engine: EngineId) -> Result<(), SyncError> {
        if engine.kind != key.flag.producer() {
            return Err(SyncError::WrongProducer {
                flag: key.flag.name(),
                engine,
            });
        }

        let expected = self.expected(&key);
        let mut state = self.lock()?;
        if state.aborted_by.is_some() {
            return Err(SyncError::Aborted { engine });
        }

        let slot = state.slots.entry(key).or_default();
        if slot.raised >= expected {
            return Err(SyncError::OverRaised {
                flag: key.flag.name(),
                wave: key.wave,
                engine,
            });
        }
        slot.raised += 1;
        let complete = slot.raised == expected;
        drop(state);

        log::trace!("{engine} raised {key}");
        if complete {
            self.signal.notify_all();
        }

        Ok(())
    }

    /// Blocks until `key` is complete or the run stops.
    ///
    /// A stall aborts the whole board so every other waiter wakes up.
    pub fn wait(&self, key: FlagKey<F>, engine: EngineId) -> Result<(), SyncError> {
        let expected = self.expected(&key);
        let start = Instant::now();
        let mut state = self.lock()?;

        state.slots.entry(key).or_default().waits += 1;

        loop {
            if state.aborted_by.is_some() {
                return Err(SyncError::Aborted { engine });
            }

            let raised = state.slots.get(&key).map(|slot| slot.raised).unwrap_or(0);
            if raised >= expected {
                log::trace!("{engine} passed {key}");
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                state.aborted_by.get_or_insert(engine);
                drop(state);
                self.signal.notify_all();
                log::error!("{engine} stalled on {key}: {raised}/{expected} raises after {waited:?}");

                return Err(SyncError::Stalled {
                    flag: key.flag.name(),
                    wave: key.wave,
                    scope: key.scope,
                    engine,
                    raised,
                    expected,
                    waited,
                });
            }

            let (next, _) = self
                .signal
                .wait_timeout(state, self.timeout - waited)
                .map_err(|_| SyncError::Poisoned)?;
            state = next;
        }
    }

    /// Wakes every waiter with [SyncError::Aborted] on behalf of `engine`.
    ///
    /// Returns whether `engine` is the one that brought the run down, either through this call
    /// or through an earlier stall of its own.
    pub fn abort(&self, engine: EngineId) -> bool {
        let origin = match self.state.lock() {
            Ok(mut state) => *state.aborted_by.get_or_insert(engine),
            Err(poisoned) => *poisoned.into_inner().aborted_by.get_or_insert(engine),
        };
        self.signal.notify_all();
        origin == engine
    }

    /// Whether the run was aborted.
    pub fn is_aborted(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.aborted_by.is_some(),
            Err(_) => true,
        }
    }

    /// Exchanges that were touched but never completed.
    pub fn audit(&self) -> Result<Vec<FlagImbalance<F>>, SyncError> {
        let state = self.lock()?;
        let mut imbalances: Vec<_> = state
            .slots
            .iter()
            .filter_map(|(key, slot)| {
                let expected = self.expected(key);
                (slot.raised != expected).then(|| FlagImbalance::new(*key, slot.raised, expected))
            })
            .collect();
        imbalances.sort_by_key(|imbalance| (imbalance.key.wave, imbalance.key.flag.name()));

        Ok(imbalances)
    }

    /// Total number of raises and waits recorded.
    pub fn totals(&self) -> Result<(u64, u64), SyncError> {
        let state = self.lock()?;
        Ok(state.slots.values().fold((0, 0), |(raises, waits), slot| {
            (raises + slot.raised as u64, waits + slot.waits as u64)
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, BoardState<F>>, SyncError> {
        self.state.lock().map_err(|_| SyncError::Poisoned)
    }
}
