use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt::{Debug, Display};
use core::time::Duration;
use mla_prolog_runtime::{
    EngineId, SyncError, TopologyError, memory::ArenaError, pool::PoolError,
};

use crate::components::{ElemType, PrologDtypes};

/// Errors that can occur while classifying and planning a prolog invocation.
///
/// Any of them means the operator isn't applicable to the shape, dtype or layout combination;
/// no plan is produced and the pipeline must not run.
pub enum PrologSetupError {
    /// The platform reported an unusable engine topology.
    InvalidTopology(TopologyError),

    /// A shape dimension is degenerate in a way the empty modes don't cover.
    InvalidShape(InvalidConfigError),

    /// An input required by the quantization mode or the layout is absent.
    MissingInput(&'static str),

    /// The dtypes of the inputs match none of the supported combinations.
    UnsupportedDtypes(PrologDtypes),

    /// A matmul has no supported output type for its input type.
    UnsupportedMatmulOutput {
        /// The matmul.
        matmul: &'static str,
        /// Its input element type.
        input: ElemType,
    },

    /// The provided configuration is invalid.
    InvalidConfig(InvalidConfigError),
}

/// Error that arises from invalid configurations.
pub type InvalidConfigError = Box<dyn Display + Send + Sync>;

/// Lazily formatted [InvalidConfigError].
pub struct FormattedConfigError {
    func: Box<dyn Fn() -> String + Send + Sync>,
}

impl FormattedConfigError {
    #[allow(clippy::new_ret_no_self)]
    pub fn new<F: Fn() -> String + Send + Sync + 'static>(func: F) -> InvalidConfigError {
        Box::new(Self {
            func: Box::new(func),
        })
    }
}

impl Display for FormattedConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let string = (self.func)();
        write!(f, "{string}")
    }
}

impl From<TopologyError> for PrologSetupError {
    fn from(value: TopologyError) -> Self {
        Self::InvalidTopology(value)
    }
}

impl Display for PrologSetupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for PrologSetupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PrologSetupError::InvalidTopology(err) => {
                writeln!(f, "Unable to plan the prolog because {err}")
            }
            PrologSetupError::InvalidShape(err) => {
                writeln!(
                    f,
                    "Unable to plan the prolog because a shape is invalid: {}",
                    err
                )
            }
            PrologSetupError::MissingInput(name) => {
                writeln!(
                    f,
                    "Unable to plan the prolog because the required input {name} is missing"
                )
            }
            PrologSetupError::UnsupportedDtypes(dtypes) => {
                writeln!(
                    f,
                    "Unable to plan the prolog because the dtype combination is unsupported: {dtypes:?}"
                )
            }
            PrologSetupError::UnsupportedMatmulOutput { matmul, input } => {
                writeln!(
                    f,
                    "Unable to plan the prolog because {matmul} has no output type for {input} inputs"
                )
            }
            PrologSetupError::InvalidConfig(err) => {
                writeln!(
                    f,
                    "Unable to plan the prolog because the config is invalid: {}",
                    err
                )
            }
        }
    }
}

/// Errors reported by the pipeline executor.
///
/// Setup failures are detected before any engine thread starts. Everything else halts every
/// engine of the run.
pub enum ExecutionError {
    /// A flag wasn't complete before the watchdog fired.
    Stalled {
        /// Stalled flag.
        flag: &'static str,
        /// Wave of the stalled exchange.
        wave: u32,
        /// Engine that gave up waiting.
        engine: EngineId,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The run was torn down because another engine failed.
    Aborted {
        /// Engine that noticed the abort.
        engine: EngineId,
    },
    /// A flag was raised more often than it has producers.
    FlagOverRaised {
        /// Offending flag.
        flag: &'static str,
        /// Wave of the exchange.
        wave: u32,
        /// Engine that raised it once too many.
        engine: EngineId,
    },
    /// A flag was raised by an engine of the wrong class.
    WrongProducer {
        /// Offending flag.
        flag: &'static str,
        /// Engine that raised it.
        engine: EngineId,
    },
    /// Exchanges left incomplete at the end of a run.
    UnbalancedFlags(Vec<String>),
    /// The selector doesn't decode to the classification of the plan.
    SelectorMismatch {
        /// Selector handed to the executor.
        selector: u64,
        /// Selector implied by the plan.
        expected: u64,
    },
    /// The selector doesn't decode at all.
    InvalidSelector(u64),
    /// A buffer has the wrong element type or shape for the plan.
    BufferMismatch {
        /// Buffer name.
        buffer: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// A workspace access fell outside its region.
    ArenaOutOfBounds(ArenaError),
    /// A token's cache slot lies outside the cache.
    CacheSlotOutOfRange {
        /// Token index.
        token: u32,
        /// Resolved slot.
        slot: i64,
        /// Number of slots in the cache.
        capacity: usize,
    },
    /// An engine panicked, or a lock it held got poisoned.
    EnginePanicked(Option<EngineId>),
    /// An engine was handed an instruction stream it can't run.
    InvalidSchedule {
        /// The engine.
        engine: EngineId,
        /// What is wrong with the stream.
        reason: String,
    },
}

impl From<SyncError> for ExecutionError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Stalled {
                flag,
                wave,
                engine,
                waited,
                ..
            } => Self::Stalled {
                flag,
                wave,
                engine,
                waited,
            },
            SyncError::OverRaised { flag, wave, engine } => {
                Self::FlagOverRaised { flag, wave, engine }
            }
            SyncError::WrongProducer { flag, engine } => Self::WrongProducer { flag, engine },
            SyncError::Aborted { engine } => Self::Aborted { engine },
            SyncError::Poisoned => Self::EnginePanicked(None),
        }
    }
}

impl From<PoolError> for ExecutionError {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::EnginePanicked(engine) => Self::EnginePanicked(Some(engine)),
            PoolError::ProgramMismatch { engine, program } => Self::InvalidSchedule {
                engine,
                reason: alloc::format!("received the program of {program}"),
            },
        }
    }
}

impl From<ArenaError> for ExecutionError {
    fn from(value: ArenaError) -> Self {
        Self::ArenaOutOfBounds(value)
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for ExecutionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecutionError::Stalled {
                flag,
                wave,
                engine,
                waited,
            } => writeln!(
                f,
                "Prolog stalled: {engine} waited {waited:?} on flag {flag} of wave {wave}"
            ),
            ExecutionError::Aborted { engine } => {
                writeln!(f, "Prolog aborted: {engine} stopped after another engine failed")
            }
            ExecutionError::FlagOverRaised { flag, wave, engine } => writeln!(
                f,
                "Prolog schedule is broken: {engine} raised flag {flag} of wave {wave} once too many"
            ),
            ExecutionError::WrongProducer { flag, engine } => writeln!(
                f,
                "Prolog schedule is broken: {engine} raised flag {flag} it doesn't produce"
            ),
            ExecutionError::UnbalancedFlags(keys) => writeln!(
                f,
                "Prolog schedule is broken: {} exchanges never completed, first {:?}",
                keys.len(),
                keys.first()
            ),
            ExecutionError::SelectorMismatch { selector, expected } => writeln!(
                f,
                "Unable to run the prolog: selector {selector} doesn't match the plan's {expected}"
            ),
            ExecutionError::InvalidSelector(selector) => {
                writeln!(f, "Unable to run the prolog: selector {selector} doesn't decode")
            }
            ExecutionError::BufferMismatch { buffer, reason } => {
                writeln!(f, "Unable to run the prolog: buffer {buffer} {reason}")
            }
            ExecutionError::ArenaOutOfBounds(err) => {
                writeln!(f, "Prolog workspace access failed: {err}")
            }
            ExecutionError::CacheSlotOutOfRange {
                token,
                slot,
                capacity,
            } => writeln!(
                f,
                "Unable to run the prolog: token {token} maps to cache slot {slot} of {capacity}"
            ),
            ExecutionError::EnginePanicked(Some(engine)) => {
                writeln!(f, "Prolog aborted: {engine} panicked")
            }
            ExecutionError::EnginePanicked(None) => {
                writeln!(f, "Prolog aborted: a lock was poisoned by a panicking engine")
            }
            ExecutionError::InvalidSchedule { engine, reason } => {
                writeln!(f, "Prolog schedule is broken: {engine} {reason}")
            }
        }
    }
}
