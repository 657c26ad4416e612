use alloc::{format, sync::Arc};
use mla_prolog_runtime::{
    BufferHierarchy, Topology,
    config::{GlobalConfig, Logger, planner::PlannerConfig, planner::PlannerLogLevel},
};
use serde::{Deserialize, Serialize};

use crate::components::{
    ElemType, EmptyMode, FormattedConfigError, MAX_STEP, PrologAttributes, PrologProblem,
    PrologSetupError, QuantMode, ScenarioClassification, ShapeDescriptor, SplitStrategy,
    VariantSelector, grouped,
};
use crate::tiling::{
    BaseTile, HeadPartition, MatmulPartition, TokenSplit, WorkspaceLayout, calc_single_core_n,
};

/// Head dim with the wide dequantization step.
pub const HIGH_THROUGHPUT_HEAD_DIM: u32 = 128;

/// Minimum matrix engine count for the fixed 64 column split of the key/value projection.
pub const CKV_KR_WIDE_MIN_ENGINES: u32 = 9;

/// Slice width of the fixed key/value projection split.
pub const CKV_KR_WIDE_SLICE: u32 = 64;

/// Partition sizes and constants shared by every engine of one invocation.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingPlan {
    /// Tokens per wave.
    pub step: u32,
    /// Matrix engines launched. Each brings two vector engines.
    pub block_dim: u32,
    /// Matrix engines the partitions were computed for.
    pub matrix_engines: u32,
    /// Vector engines the partitions were computed for.
    pub vector_engines: u32,
    /// Compressed query projection.
    pub mm_cq: MatmulPartition,
    /// Compressed key/value and rope projection, absent with empty caches.
    pub mm_ckv_kr: Option<MatmulPartition>,
    /// Query content and rope projection.
    pub mm_qc_qr: MatmulPartition,
    /// Per head key absorption.
    pub mm_qn: HeadPartition,
    /// Streaming tile of one head of the key absorption.
    pub mm_qn_base: BaseTile,
    /// Token ranges when splitting by token.
    pub token_split: Option<TokenSplit>,
    /// Heads dequantized per inner step.
    pub step_heads_dequant: u32,
    /// Vector engines a wave's elementwise work is spread over.
    pub vector_block_num: u32,
    /// `1 / Hcq`.
    pub reciprocal_cq: f32,
    /// `1 / Hckv`.
    pub reciprocal_ckv: f32,
    /// RMS norm epsilon of the compressed query.
    pub epsilon_cq: f32,
    /// RMS norm epsilon of the compressed key/value.
    pub epsilon_ckv: f32,
    /// Whether the normalized query is emitted.
    pub query_norm: bool,
    /// Scratch bytes the caller allocates.
    pub workspace_size: u64,
}

/// Everything the executor needs, produced once per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrologPlan {
    /// Logical sizes.
    pub shape: ShapeDescriptor,
    /// Scenario tags.
    pub scenario: ScenarioClassification,
    /// Partitions.
    pub tiling: TilingPlan,
    /// Workspace regions.
    pub layout: WorkspaceLayout,
    /// Dispatch key.
    pub selector: VariantSelector,
}

impl PrologPlan {
    /// Matrix engines to launch.
    pub fn block_dim(&self) -> u32 {
        self.tiling.block_dim
    }

    /// Scratch bytes the caller allocates.
    pub fn workspace_size(&self) -> u64 {
        self.tiling.workspace_size
    }
}

/// Computes partitions, workspace layout and selector for prolog invocations.
pub struct Planner {
    config: PlannerConfig,
    buffers: BufferHierarchy,
    logger: Logger,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner {
    /// Planner configured from the global configuration.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Planner with an explicit configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        Self {
            config: config.planner.clone(),
            buffers: BufferHierarchy::default(),
            logger: Logger::from_config(config),
        }
    }

    /// Validates, classifies and plans a problem.
    pub fn plan_problem(
        &mut self,
        problem: &PrologProblem,
        topology: Topology,
    ) -> Result<PrologPlan, PrologSetupError> {
        problem.validate()?;
        let scenario = ScenarioClassification::classify(problem, topology)?;

        self.plan(&problem.shape, &scenario, topology, &problem.attributes)
    }

    /// Plans an already classified invocation.
    pub fn plan(
        &mut self,
        shape: &ShapeDescriptor,
        scenario: &ScenarioClassification,
        topology: Topology,
        attributes: &PrologAttributes,
    ) -> Result<PrologPlan, PrologSetupError> {
        topology.validate()?;
        shape.validate()?;
        if shape.tokens() == 0 && scenario.empty != EmptyMode::EmptyQuery {
            return Err(PrologSetupError::InvalidShape(FormattedConfigError::new(|| {
                "no token to plan outside the empty query mode".into()
            })));
        }

        let selector = VariantSelector::encode(scenario);

        if scenario.empty == EmptyMode::EmptyQuery {
            let tiling = TilingPlan {
                block_dim: 1,
                workspace_size: self.config.libapi_workspace_bytes,
                ..Default::default()
            };
            self.log_basic(&format!(
                "Empty query, selector {selector}, workspace {}",
                tiling.workspace_size
            ));

            return Ok(PrologPlan {
                shape: *shape,
                scenario: *scenario,
                tiling,
                layout: WorkspaceLayout::default(),
                selector,
            });
        }

        let topology = scenario.effective_topology(topology);
        let mut tiling = self.tiling(shape, scenario, topology, attributes)?;

        let slots = match scenario.split {
            SplitStrategy::ByToken => tiling.block_dim,
            SplitStrategy::ByColumn => 1,
        };
        let layout = WorkspaceLayout::build(shape, scenario, tiling.step, slots);
        tiling.workspace_size = self.config.libapi_workspace_bytes
            + layout.total_bytes()
            + self.config.safety_pad_bytes;

        let plan = PrologPlan {
            shape: *shape,
            scenario: *scenario,
            tiling,
            layout,
            selector,
        };
        self.log_plan(&plan);

        Ok(plan)
    }

    fn tiling(
        &self,
        shape: &ShapeDescriptor,
        scenario: &ScenarioClassification,
        topology: Topology,
        attributes: &PrologAttributes,
    ) -> Result<TilingPlan, PrologSetupError> {
        let tokens = shape.tokens();
        let aic = topology.matrix_engines;
        let aiv = topology.vector_engines;
        let step = tokens.min(MAX_STEP);
        let by_token = scenario.split == SplitStrategy::ByToken;

        let (input_elem, weight_elem) = matmul_elems(scenario.quant);
        let acc_size = ElemType::I32.size();

        let tile = |single_n: u32, reduction: u32, elem: ElemType| {
            BaseTile::fit(
                &self.buffers,
                step,
                single_n,
                reduction,
                elem.size(),
                acc_size,
                elem.dma_align(),
            )
        };

        let cq = shape.cq;
        let mm_cq = match by_token {
            true => MatmulPartition::replicated(cq, aic, shape.embed, tile(cq, shape.embed, input_elem)),
            false => {
                let single_n = calc_single_core_n(cq, aic, input_elem.dma_align());
                MatmulPartition::columns_split(cq, single_n, shape.embed, tile(single_n, shape.embed, input_elem))
            }
        };

        let ckv_kr = shape.ckv_kr_width();
        let mm_ckv_kr = match scenario.empty {
            EmptyMode::EmptyCache => None,
            _ if by_token => Some(MatmulPartition::replicated(
                ckv_kr,
                aic,
                shape.embed,
                tile(ckv_kr, shape.embed, input_elem),
            )),
            _ if aic >= CKV_KR_WIDE_MIN_ENGINES
                && ckv_kr.div_ceil(CKV_KR_WIDE_SLICE) <= aic =>
            {
                Some(MatmulPartition::columns_split(
                    ckv_kr,
                    CKV_KR_WIDE_SLICE,
                    shape.embed,
                    tile(CKV_KR_WIDE_SLICE, shape.embed, input_elem),
                ))
            }
            _ => {
                let single_n = calc_single_core_n(ckv_kr, aic, input_elem.dma_align());
                Some(MatmulPartition::columns_split(
                    ckv_kr,
                    single_n,
                    shape.embed,
                    tile(single_n, shape.embed, input_elem),
                ))
            }
        };

        let qc_qr = shape.qc_qr_width();
        let mm_qc_qr = if by_token {
            MatmulPartition::replicated(qc_qr, aic, cq, tile(qc_qr, cq, weight_elem))
        } else {
            let single_n = if scenario.group_compute {
                calc_single_core_n(
                    shape.heads * shape.head_dim,
                    grouped::ENGINES_PER_GROUP,
                    shape.head_dim,
                )
            } else if scenario.dequant_opt {
                calc_single_core_n(qc_qr, aic, shape.head_width())
            } else {
                calc_single_core_n(qc_qr, aic, weight_elem.dma_align())
            };
            MatmulPartition::columns_split(qc_qr, single_n, cq, tile(single_n, cq, weight_elem))
        };

        let mm_qn = match by_token {
            true => HeadPartition::replicated(shape.heads, aic),
            false => HeadPartition::split(shape.heads, aic),
        };

        for (name, blocks) in [
            ("matmul_cq", mm_cq.blocks),
            ("matmul_ckv_kr", mm_ckv_kr.map(|mm| mm.blocks).unwrap_or(0)),
            ("matmul_qc_qr", mm_qc_qr.blocks),
            ("matmul_qn", mm_qn.blocks),
        ] {
            if blocks > aic {
                return Err(PrologSetupError::InvalidConfig(FormattedConfigError::new(
                    move || format!("{name} needs {blocks} matrix engines, only {aic} available"),
                )));
            }
        }

        let step_heads_dequant = match shape.head_dim == HIGH_THROUGHPUT_HEAD_DIM {
            true => shape.heads.min(64),
            false => shape.heads.min(16),
        };

        Ok(TilingPlan {
            step,
            block_dim: aic,
            matrix_engines: aic,
            vector_engines: aiv,
            mm_cq,
            mm_ckv_kr,
            mm_qc_qr,
            mm_qn,
            mm_qn_base: tile(shape.ckv, shape.head_dim, ElemType::BF16),
            token_split: by_token.then(|| TokenSplit::compute(tokens, aic)),
            step_heads_dequant,
            vector_block_num: step.min(aiv),
            reciprocal_cq: 1.0 / shape.cq as f32,
            reciprocal_ckv: 1.0 / shape.ckv as f32,
            epsilon_cq: attributes.epsilon_cq,
            epsilon_ckv: attributes.epsilon_ckv,
            query_norm: attributes.query_norm,
            workspace_size: 0,
        })
    }

    fn log_basic(&mut self, msg: &str) {
        if self.logger.log_level_planner() != PlannerLogLevel::Disabled {
            self.logger.log_planner(&msg);
        }
    }

    fn log_plan(&mut self, plan: &PrologPlan) {
        let level = self.logger.log_level_planner();
        if level == PlannerLogLevel::Disabled {
            return;
        }

        let tiling = &plan.tiling;
        self.logger.log_planner(&format!(
            "Prolog plan: selector {} block_dim {} step {} workspace {} scenario {:?}",
            plan.selector, tiling.block_dim, tiling.step, tiling.workspace_size, plan.scenario
        ));

        if level == PlannerLogLevel::Full {
            self.logger.log_planner(&format!(
                "Partitions: cq {:?} ckv_kr {:?} qc_qr {:?} qn {:?} split {:?}",
                tiling.mm_cq, tiling.mm_ckv_kr, tiling.mm_qc_qr, tiling.mm_qn, tiling.token_split
            ));
            for region in plan.layout.regions() {
                self.logger.log_planner(&format!(
                    "Region {} offset {} bytes {} ({} x {} x {})",
                    region.kind, region.offset, region.bytes, region.slots, region.rows, region.width
                ));
            }
        }
    }
}

/// Operand types of the down projections and of the query projection.
fn matmul_elems(quant: QuantMode) -> (ElemType, ElemType) {
    let int8 = |quantized: bool| match quantized {
        true => ElemType::I8,
        false => ElemType::BF16,
    };

    (
        int8(quant.input_quantized()),
        int8(quant.query_weight_quantized()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{InputPresence, PrologDtypes, TokenLayout};
    use mla_prolog_runtime::config::planner::{DEFAULT_LIBAPI_WORKSPACE_BYTES, DEFAULT_SAFETY_PAD_BYTES};

    fn planner() -> Planner {
        Planner::from_config(Arc::new(GlobalConfig::default()))
    }

    fn problem(tokens: u32, heads: u32, quant: QuantMode) -> PrologProblem {
        let shape = ShapeDescriptor::new(
            TokenLayout::Fused { tokens },
            7168,
            1536,
            512,
            64,
            heads,
            128,
            1,
            64,
            128,
        );
        let presence = InputPresence {
            dequant_scale_x: true,
            dequant_scale_w_dq: true,
            dequant_scale_w_uq_qr: true,
            dequant_scale_w_dkv_kr: true,
            quant_scale_ckv: true,
            quant_scale_ckr: true,
            smooth_scales_cq: false,
            actual_seq_len: true,
        };

        PrologProblem::new(
            shape,
            PrologDtypes::for_mode(quant),
            PrologAttributes::default(),
            presence,
        )
    }

    #[test_log::test]
    fn unquantized_prefill_splits_columns() {
        let plan = planner()
            .plan_problem(&problem(256, 32, QuantMode::NoQuant), Topology::paired(24))
            .unwrap();
        let tiling = &plan.tiling;

        assert_eq!(plan.scenario.split, SplitStrategy::ByColumn);
        assert_eq!(tiling.step, 128);
        assert_eq!(tiling.block_dim, 24);
        assert_eq!(tiling.mm_cq.single_n, 64);
        assert_eq!(tiling.mm_cq.blocks, 24);
        assert_eq!(tiling.mm_ckv_kr.map(|mm| (mm.single_n, mm.blocks)), Some((64, 9)));
        assert_eq!(tiling.mm_qc_qr.single_n, 256);
        assert_eq!(tiling.mm_qn.heads_per_engine, 2);
        assert_eq!(tiling.mm_qn.blocks, 16);
        assert_eq!(tiling.token_split, None);
        assert_eq!(tiling.vector_block_num, 48);
        assert_eq!(tiling.step_heads_dequant, 32);
        assert_eq!(
            tiling.workspace_size,
            DEFAULT_LIBAPI_WORKSPACE_BYTES
                + 128 * (1536 + 576 + 32 * 192) * 2
                + DEFAULT_SAFETY_PAD_BYTES
        );
    }

    #[test_log::test]
    fn single_token_partial_quant_uses_grouped_compute() {
        let plan = planner()
            .plan_problem(
                &problem(1, 32, QuantMode::PartialQuantKvNoQuant),
                Topology::paired(24),
            )
            .unwrap();
        let tiling = &plan.tiling;

        assert!(plan.scenario.group_compute);
        assert!(!plan.scenario.dequant_opt);
        assert_eq!(tiling.block_dim, 16);
        assert_eq!(tiling.vector_engines, 32);
        assert_eq!(tiling.step, 1);
        assert_eq!(tiling.mm_qc_qr.single_n, 512);
        assert_eq!(tiling.mm_qc_qr.blocks, 12);
        // The content part alone spans exactly one group.
        assert_eq!(32 * 128 / tiling.mm_qc_qr.single_n, grouped::ENGINES_PER_GROUP);
        assert_eq!(tiling.vector_block_num, 1);
        assert!(plan.layout.region(crate::tiling::RegionKind::DequantScaleStaging).is_some());
    }

    #[test_log::test]
    fn many_heads_align_query_slices_to_heads() {
        let plan = planner()
            .plan_problem(
                &problem(64, 32, QuantMode::FullQuantKvQuant),
                Topology::paired(24),
            )
            .unwrap();
        let mm = plan.tiling.mm_qc_qr;

        assert!(plan.scenario.dequant_opt);
        assert_eq!(mm.single_n % 192, 0);
        assert!(mm.blocks <= 24);
    }

    #[test_log::test]
    fn large_batches_split_by_token() {
        let plan = planner()
            .plan_problem(&problem(24 * 128 + 5, 16, QuantMode::NoQuant), Topology::paired(24))
            .unwrap();
        let tiling = &plan.tiling;

        assert_eq!(plan.scenario.split, SplitStrategy::ByToken);
        assert_eq!(tiling.token_split, Some(TokenSplit::new(129, 5)));
        assert!(tiling.mm_cq.replicated);
        assert!(tiling.mm_qc_qr.replicated);
        assert!(tiling.mm_qn.replicated);
        assert_eq!(tiling.mm_qc_qr.blocks, 24);
        assert!(plan.layout.regions().iter().all(|region| region.slots == 24));
    }

    #[test_log::test]
    fn empty_query_reserves_only_the_library_workspace() {
        let plan = planner()
            .plan_problem(&problem(0, 32, QuantMode::NoQuant), Topology::paired(24))
            .unwrap();

        assert_eq!(plan.scenario.empty, EmptyMode::EmptyQuery);
        assert_eq!(plan.block_dim(), 1);
        assert_eq!(plan.workspace_size(), DEFAULT_LIBAPI_WORKSPACE_BYTES);
        assert!(plan.layout.regions().is_empty());
        assert_eq!(plan.selector.value(), 10_000_000_000_200_000);
    }

    #[test_log::test]
    fn planning_is_idempotent() {
        let problem = problem(300, 32, QuantMode::PartialQuantKvQuant);
        let mut planner = planner();

        let first = planner.plan_problem(&problem, Topology::paired(20)).unwrap();
        let second = planner.plan_problem(&problem, Topology::paired(20)).unwrap();

        pretty_assertions::assert_eq!(first, second);
    }

    #[test_log::test]
    fn degenerate_shapes_are_rejected_without_panicking() {
        let valid = problem(64, 32, QuantMode::NoQuant);
        let scenario = ScenarioClassification::classify(&valid, Topology::paired(24)).unwrap();
        let attributes = PrologAttributes::default();

        let mut no_heads = valid.shape;
        no_heads.heads = 0;
        let mut no_cq = valid.shape;
        no_cq.cq = 0;
        let mut no_tokens = valid.shape;
        no_tokens.layout = TokenLayout::Fused { tokens: 0 };

        for shape in [no_heads, no_cq, no_tokens] {
            let result = planner().plan(&shape, &scenario, Topology::paired(24), &attributes);

            assert!(
                matches!(result, Err(PrologSetupError::InvalidShape(_))),
                "{shape:?}"
            );
        }
    }

    #[test_log::test]
    fn int8_key_absorption_weight_is_unsupported() {
        let mut problem = problem(4, 8, QuantMode::NoQuant);
        problem.dtypes.weight_uk = ElemType::I8;

        let result = planner().plan_problem(&problem, Topology::paired(4));

        assert!(matches!(
            result,
            Err(PrologSetupError::UnsupportedMatmulOutput {
                matmul: "matmul_qn",
                input: ElemType::I8
            })
        ));
    }

    #[test_log::test]
    fn grouped_slices_wider_than_the_platform_are_rejected() {
        let mut problem = problem(1, 8, QuantMode::PartialQuantKvNoQuant);
        problem.shape.head_dim = 16;

        let result = planner().plan_problem(&problem, Topology::paired(24));

        assert!(matches!(result, Err(PrologSetupError::InvalidConfig(_))));
    }
}
