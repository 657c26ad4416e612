use alloc::{format, string::ToString, sync::Arc, vec::Vec};
use mla_prolog_runtime::{
    ComputeEngine, DispatchCounters, DispatchSnapshot, EngineId, FlagBoard, Wave,
    config::{GlobalConfig, Logger, pipeline::PipelineConfig, pipeline::PipelineLogLevel},
    engine::StateTracker,
    memory::Arena,
    pool::{EngineSlot, run_engines},
    topology::VECTOR_ENGINES_PER_MATRIX,
};
use serde::{Deserialize, Serialize};

use crate::components::{
    Element, ExecutionError, QuantMode, SplitStrategy, Variant, VariantSelector,
};
use crate::pipeline::{
    CacheSlots, FullKvBf16, FullKvInt8, MatrixEngine, PagedCaches, PartialKvBf16, PartialKvInt8,
    PipelineFlag, PrologBuffers, PrologInputs, PrologOutputs, PrologSchedule, PrologStage,
    QuantScheme, StageContext, Unquantized, VectorEngine, io::buffer_mismatch,
};
use crate::tiling::PrologPlan;

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Selector the run was dispatched on.
    pub selector: u64,
    /// Matrix engines launched.
    pub block_dim: u32,
    /// Waves run by matrix engines, summed over engines.
    pub waves: u64,
    /// Work dispatched.
    pub dispatch: DispatchSnapshot,
    /// Flag raises over the run.
    pub flag_raises: u64,
    /// Flag waits over the run.
    pub flag_waits: u64,
}

/// One engine of either class.
pub enum PrologEngine<'a, P: QuantScheme> {
    Matrix(MatrixEngine<'a, P>),
    Vector(VectorEngine<'a, P>),
}

impl<P: QuantScheme> ComputeEngine for PrologEngine<'_, P> {
    type Stage = PrologStage;
    type Error = ExecutionError;

    fn id(&self) -> EngineId {
        match self {
            PrologEngine::Matrix(engine) => engine.id(),
            PrologEngine::Vector(engine) => engine.id(),
        }
    }

    fn execute(&mut self, stage: PrologStage, wave: &Wave) -> Result<(), ExecutionError> {
        match self {
            PrologEngine::Matrix(engine) => engine.execute(stage, wave),
            PrologEngine::Vector(engine) => engine.execute(stage, wave),
        }
    }

    fn tracker(&mut self) -> &mut StateTracker {
        match self {
            PrologEngine::Matrix(engine) => engine.tracker(),
            PrologEngine::Vector(engine) => engine.tracker(),
        }
    }
}

/// Runs planned invocations on a thread per engine.
pub struct Executor {
    config: PipelineConfig,
    logger: Logger,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Executor using the global configuration.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Executor using an explicit configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        Self {
            config: config.pipeline.clone(),
            logger: Logger::from_config(config),
        }
    }

    /// Runs `plan`, writing the caches and outputs in place.
    ///
    /// `outputs` must come from [PrologOutputs::allocate] for the same plan.
    pub fn run(
        &mut self,
        plan: &PrologPlan,
        inputs: &PrologInputs,
        caches: &PagedCaches,
        outputs: &PrologOutputs,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.check_selector(plan)?;

        if Variant::of(&plan.scenario) == Variant::EmptyQuery {
            self.log_basic(&format!("Selector {} has no token, nothing to run", plan.selector));
            return Ok(ExecutionReport {
                selector: plan.selector.value(),
                block_dim: plan.block_dim(),
                waves: 0,
                dispatch: DispatchSnapshot::default(),
                flag_raises: 0,
                flag_waits: 0,
            });
        }

        let result = match plan.scenario.quant {
            QuantMode::NoQuant => self.launch::<Unquantized>(plan, inputs, caches, outputs),
            QuantMode::PartialQuantKvNoQuant => {
                self.launch::<PartialKvBf16>(plan, inputs, caches, outputs)
            }
            QuantMode::PartialQuantKvQuant => {
                self.launch::<PartialKvInt8>(plan, inputs, caches, outputs)
            }
            QuantMode::FullQuantKvNoQuant => self.launch::<FullKvBf16>(plan, inputs, caches, outputs),
            QuantMode::FullQuantKvQuant => self.launch::<FullKvInt8>(plan, inputs, caches, outputs),
        };

        match &result {
            Ok(report) => self.log_basic(&format!(
                "Selector {} ran {} waves on {} engine pairs: {:?}",
                report.selector, report.waves, report.block_dim, report.dispatch
            )),
            Err(err) => self.log_basic(&format!("Selector {} failed: {err}", plan.selector)),
        }

        result
    }

    fn check_selector(&mut self, plan: &PrologPlan) -> Result<(), ExecutionError> {
        let selector = plan.selector.value();
        let Some(variant) = plan.selector.decode() else {
            return Err(ExecutionError::InvalidSelector(selector));
        };

        if variant != Variant::of(&plan.scenario) {
            let expected = VariantSelector::encode(&plan.scenario).value();
            if self.config.strict_selector {
                return Err(ExecutionError::SelectorMismatch { selector, expected });
            }
            log::warn!("Selector {selector} doesn't match the plan's {expected}, running the plan");
        }

        Ok(())
    }

    fn launch<P: QuantScheme>(
        &mut self,
        plan: &PrologPlan,
        inputs: &PrologInputs,
        caches: &PagedCaches,
        outputs: &PrologOutputs,
    ) -> Result<ExecutionReport, ExecutionError> {
        let buffers = PrologBuffers::<P>::bind(plan, inputs)?;
        check_caches::<P>(plan, caches)?;
        check_outputs::<P>(plan, outputs)?;

        let slots = CacheSlots::resolve(plan, inputs)?;
        let arena = Arena::new(plan.layout.specs());
        let counters = DispatchCounters::default();
        let ctx = StageContext::new(plan, buffers, caches, outputs, slots, &arena, &counters);

        let schedule = PrologSchedule::build(plan);
        let block_dim = plan.block_dim();
        let waves = schedule.matrix_waves() as u64;
        let board = FlagBoard::<PipelineFlag>::new(
            block_dim,
            block_dim * VECTOR_ENGINES_PER_MATRIX,
            self.config.watchdog_timeout(),
        );

        if self.logger.log_level_pipeline() == PipelineLogLevel::Full {
            for program in schedule.matrix.iter().chain(schedule.vector.iter()) {
                self.logger.log_pipeline(&format!(
                    "{}: {} waves, {} stages, {} raises, {} waits",
                    program.engine,
                    program.waves.len(),
                    program.compute_len(),
                    program.raises().count(),
                    program.waits().count()
                ));
            }
        }

        let workspace_slot = |pair: u32| match plan.scenario.split {
            SplitStrategy::ByToken => pair,
            SplitStrategy::ByColumn => 0,
        };
        let mut engines = Vec::with_capacity(schedule.matrix.len() + schedule.vector.len());
        for program in schedule.matrix {
            let index = program.engine.index;
            let engine = MatrixEngine::new(index, workspace_slot(index), &ctx);
            engines.push(EngineSlot::new(PrologEngine::Matrix(engine), program));
        }
        for program in schedule.vector {
            let index = program.engine.index;
            let pair = index / VECTOR_ENGINES_PER_MATRIX;
            let engine = VectorEngine::new(index, workspace_slot(pair), &ctx);
            engines.push(EngineSlot::new(PrologEngine::Vector(engine), program));
        }

        run_engines(engines, &board)?;

        let unbalanced = board.audit()?;
        if !unbalanced.is_empty() {
            return Err(ExecutionError::UnbalancedFlags(
                unbalanced
                    .iter()
                    .map(|imbalance| {
                        format!(
                            "{} raised {} of {}",
                            imbalance.key, imbalance.raised, imbalance.expected
                        )
                    })
                    .collect(),
            ));
        }
        let (flag_raises, flag_waits) = board.totals()?;

        Ok(ExecutionReport {
            selector: plan.selector.value(),
            block_dim,
            waves,
            dispatch: counters.snapshot(),
            flag_raises,
            flag_waits,
        })
    }

    fn log_basic(&mut self, msg: &str) {
        if self.logger.log_level_pipeline() != PipelineLogLevel::Disabled {
            self.logger.log_pipeline(&msg.to_string());
        }
    }
}

fn check_caches<P: QuantScheme>(plan: &PrologPlan, caches: &PagedCaches) -> Result<(), ExecutionError> {
    let shape = &plan.shape;
    let slots = shape.cache_slots() as usize;

    for (name, cache, width) in [
        ("kv_cache", caches.kv_cache()?, shape.ckv as usize),
        ("kr_cache", caches.kr_cache()?, shape.rope as usize),
    ] {
        if cache.elem() != <P::Cache as Element>::ELEM {
            return Err(buffer_mismatch(
                name,
                format!("must be {}, got {}", <P::Cache as Element>::ELEM, cache.elem()),
            ));
        }
        if cache.len() != slots * width {
            return Err(buffer_mismatch(
                name,
                format!("has {} elements, expected {}", cache.len(), slots * width),
            ));
        }
    }

    Ok(())
}

fn check_outputs<P: QuantScheme>(
    plan: &PrologPlan,
    outputs: &PrologOutputs,
) -> Result<(), ExecutionError> {
    let shape = &plan.shape;
    let rows = shape.tokens() as usize * shape.heads as usize;
    let query = outputs.query()?;

    if query.elem() != <P::Query as Element>::ELEM || query.len() != rows * shape.ckv as usize {
        return Err(buffer_mismatch(
            "query",
            "doesn't match the plan, allocate it with PrologOutputs::allocate".into(),
        ));
    }
    if outputs.query_rope()?.len() != rows * shape.rope as usize {
        return Err(buffer_mismatch(
            "query_rope",
            "doesn't match the plan, allocate it with PrologOutputs::allocate".into(),
        ));
    }
    if outputs.query_norm().is_some() != plan.tiling.query_norm {
        return Err(buffer_mismatch(
            "query_norm",
            "doesn't match the plan, allocate it with PrologOutputs::allocate".into(),
        ));
    }

    Ok(())
}
