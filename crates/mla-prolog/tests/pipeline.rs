mod common;

use std::sync::Arc;

use common::*;
use mla_prolog::components::{
    ElemType, EmptyMode, ExecutionError, QuantMode, SplitStrategy, TokenLayout, VariantSelector,
};
use mla_prolog::pipeline::{ExecutionReport, Executor, OutputTensors, PagedCaches, PrologOutputs, Tensor};
use mla_prolog::tiling::{Planner, PrologPlan};
use mla_prolog_runtime::{Topology, config::GlobalConfig};

const MODES: [QuantMode; 5] = [
    QuantMode::NoQuant,
    QuantMode::PartialQuantKvNoQuant,
    QuantMode::PartialQuantKvQuant,
    QuantMode::FullQuantKvNoQuant,
    QuantMode::FullQuantKvQuant,
];

fn config() -> Arc<GlobalConfig> {
    Arc::new(GlobalConfig::default())
}

fn plan(fixture: &Fixture, caches: &PagedCaches, topology: Topology) -> PrologPlan {
    let problem = fixture
        .inputs
        .problem(caches, fixture.attributes.clone())
        .unwrap();
    Planner::from_config(config())
        .plan_problem(&problem, topology)
        .unwrap()
}

fn run(
    fixture: &Fixture,
    topology: Topology,
) -> (PrologPlan, ExecutionReport, OutputTensors, PagedCaches) {
    let caches = fixture.caches();
    let plan = plan(fixture, &caches, topology);
    let outputs = PrologOutputs::allocate(&plan);

    let report = Executor::from_config(config())
        .run(&plan, &fixture.inputs, &caches, &outputs)
        .unwrap();

    (plan, report, outputs.into_tensors().unwrap(), caches)
}

fn reversed_slots(tokens: usize, dims: &Dims) -> Slots {
    let capacity = dims.blocks * dims.block_size;
    Slots::Direct((0..tokens).map(|t| (capacity - 1 - t) as i64).collect())
}

#[test_log::test]
fn unquantized_prefill_matches_reference() {
    let dims = Dims::default();
    let mut slots: Vec<i64> = (0..5).map(|t| 3 * t + 1).collect();
    slots[2] = -1;
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 5 },
        dims,
        "PA_BSND",
        Slots::Direct(slots),
        1,
    );

    let (plan, report, outputs, caches) = run(&fixture, Topology::paired(3));

    assert_eq!(plan.scenario.split, SplitStrategy::ByColumn);
    assert_eq!(report.block_dim, 3);
    assert_eq!(report.waves, 3);
    // Token 2 is skipped in both caches.
    assert_eq!(report.dispatch.cache_writes, 2 * 4);
    assert_matches_reference(&fixture, &outputs, caches);
}

#[test_log::test]
fn every_quant_mode_matches_reference_on_fractal_caches() {
    let dims = Dims::default();

    for (seed, mode) in MODES.into_iter().enumerate() {
        let fixture = Fixture::new(
            mode,
            TokenLayout::Fused { tokens: 3 },
            dims,
            "PA_NZ",
            reversed_slots(3, &dims),
            10 + seed as u64,
        );

        let (plan, _report, outputs, caches) = run(&fixture, Topology::paired(2));

        assert_eq!(plan.scenario.quant, mode);
        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn every_quant_mode_matches_reference_on_bsnd_caches() {
    let dims = Dims::default();

    for (seed, mode) in MODES.into_iter().enumerate() {
        let fixture = Fixture::new(
            mode,
            TokenLayout::Batched { batch: 2, seq: 2 },
            dims,
            "PA_BSND",
            reversed_slots(4, &dims),
            20 + seed as u64,
        );

        let (_plan, _report, outputs, caches) = run(&fixture, Topology::paired(4));

        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn block_table_resolves_batched_positions() {
    let dims = Dims {
        block_size: 4,
        ..Default::default()
    };
    let fixture = Fixture::new(
        QuantMode::PartialQuantKvQuant,
        TokenLayout::Batched { batch: 2, seq: 3 },
        dims,
        "PA_BLK_BSND",
        Slots::BlockTable {
            table: vec![3, 0, 1, -1],
            max_blocks: 2,
            actual_seq_len: None,
        },
        30,
    );

    assert_eq!(
        fixture.slots(),
        vec![Some(12), Some(13), Some(14), Some(4), Some(5), Some(6)]
    );
    let (_plan, report, outputs, caches) = run(&fixture, Topology::paired(2));

    assert_eq!(report.dispatch.cache_writes, 2 * 6);
    assert_matches_reference(&fixture, &outputs, caches);
}

#[test_log::test]
fn block_table_of_fused_tokens_follows_actual_lengths() {
    let dims = Dims {
        block_size: 2,
        ..Default::default()
    };
    let fixture = Fixture::new(
        QuantMode::FullQuantKvQuant,
        TokenLayout::Fused { tokens: 5 },
        dims,
        "PA_BLK_NZ",
        Slots::BlockTable {
            table: vec![1, -1, -1, 0, 3, -1],
            max_blocks: 3,
            actual_seq_len: Some(vec![2, 5]),
        },
        31,
    );

    assert_eq!(
        fixture.slots(),
        vec![Some(2), Some(3), Some(0), Some(1), Some(6)]
    );
    let (plan, _report, outputs, caches) = run(&fixture, Topology::paired(2));

    assert_eq!(
        plan.scenario.actual_len,
        mla_prolog::components::ActualSeqMode::EnQLen
    );
    assert_matches_reference(&fixture, &outputs, caches);
}

#[test_log::test]
fn many_heads_dequantize_by_head() {
    let dims = Dims {
        heads: 8,
        ..Default::default()
    };

    for mode in [QuantMode::PartialQuantKvNoQuant, QuantMode::FullQuantKvQuant] {
        let fixture = Fixture::new(
            mode,
            TokenLayout::Fused { tokens: 6 },
            dims,
            "PA_BSND",
            reversed_slots(6, &dims),
            40,
        );

        let (plan, _report, outputs, caches) = run(&fixture, Topology::paired(4));

        assert!(plan.scenario.dequant_opt);
        assert!(plan.scenario.stages_dequant_scales());
        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn single_token_decode_runs_grouped_compute() {
    let dims = Dims::default();

    for (seed, mode) in [QuantMode::PartialQuantKvNoQuant, QuantMode::PartialQuantKvQuant]
        .into_iter()
        .enumerate()
    {
        let fixture = Fixture::new(
            mode,
            TokenLayout::Fused { tokens: 1 },
            dims,
            "PA_BSND",
            reversed_slots(1, &dims),
            45 + seed as u64,
        );

        let (plan, report, outputs, caches) = run(&fixture, Topology::paired(24));

        assert!(plan.scenario.group_compute);
        assert!(!plan.scenario.dequant_opt);
        assert_eq!(plan.block_dim(), 16);
        assert_eq!(plan.tiling.vector_engines, 32);
        assert_eq!(report.block_dim, 16);
        assert_eq!(report.waves, 16);
        assert_eq!(report.dispatch.cache_writes, 2);
        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn split_by_token_runs_independent_pairs() {
    let dims = Dims {
        blocks: 20,
        ..Default::default()
    };

    for mode in [QuantMode::NoQuant, QuantMode::FullQuantKvQuant] {
        let fixture = Fixture::new(
            mode,
            TokenLayout::Fused { tokens: 263 },
            dims,
            "PA_BSND",
            reversed_slots(263, &dims),
            50,
        );

        let (plan, report, outputs, caches) = run(&fixture, Topology::paired(2));

        assert_eq!(plan.scenario.split, SplitStrategy::ByToken);
        assert_eq!(plan.tiling.block_dim, 2);
        // 132 + 131 tokens, two waves per pair.
        assert_eq!(report.waves, 4);
        assert_eq!(report.dispatch.cache_writes, 2 * 263);
        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn empty_cache_still_produces_queries() {
    let dims = Dims {
        blocks: 0,
        ..Default::default()
    };
    let fixture = Fixture::new(
        QuantMode::PartialQuantKvNoQuant,
        TokenLayout::Fused { tokens: 4 },
        dims,
        "PA_BSND",
        Slots::Direct(vec![0, 1, 2, 3]),
        60,
    );

    let (plan, report, outputs, caches) = run(&fixture, Topology::paired(2));

    assert_eq!(plan.scenario.empty, EmptyMode::EmptyCache);
    assert!(plan.tiling.mm_ckv_kr.is_none());
    assert_eq!(report.dispatch.cache_writes, 0);
    assert_matches_reference(&fixture, &outputs, caches);
}

#[test_log::test]
fn empty_query_runs_nothing() {
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 0 },
        Dims::default(),
        "PA_BSND",
        Slots::Direct(vec![]),
        70,
    );

    let (plan, report, outputs, _caches) = run(&fixture, Topology::paired(8));

    assert_eq!(plan.scenario.empty, EmptyMode::EmptyQuery);
    assert_eq!(report.block_dim, 1);
    assert_eq!(report.waves, 0);
    assert_eq!(report.flag_raises, 0);
    assert!(outputs.query.is_empty());
}

#[test_log::test]
fn normalized_query_is_returned_on_request() {
    let dims = Dims::default();

    for mode in [QuantMode::NoQuant, QuantMode::PartialQuantKvQuant] {
        let mut fixture = Fixture::new(
            mode,
            TokenLayout::Fused { tokens: 3 },
            dims,
            "PA_BSND",
            reversed_slots(3, &dims),
            80,
        );
        fixture.attributes.query_norm = true;

        let (_plan, _report, outputs, caches) = run(&fixture, Topology::paired(2));

        assert!(outputs.query_norm.is_some());
        assert_eq!(
            outputs.dequant_scale_q_norm.is_some(),
            mode.query_weight_quantized()
        );
        assert_matches_reference(&fixture, &outputs, caches);
    }
}

#[test_log::test]
fn report_counts_dispatches_and_flags() {
    let dims = Dims::default();
    let fixture = Fixture::new(
        QuantMode::FullQuantKvQuant,
        TokenLayout::Fused { tokens: 4 },
        dims,
        "PA_BSND",
        reversed_slots(4, &dims),
        90,
    );

    let (plan, report, _outputs, _caches) = run(&fixture, Topology::paired(2));

    assert_eq!(report.selector, plan.selector.value());
    assert_eq!(report.waves, 2);
    // Every vector engine runs the six stages of the wave.
    assert_eq!(report.dispatch.vector_stages, 4 * 6);
    // Head weights loaded once per head.
    assert_eq!(report.dispatch.weight_preloads, dims.heads as u64);
    // Two matrix engines raise four flags and wait on three, four vector engines the reverse.
    assert_eq!(report.flag_raises, 2 * 4 + 4 * 3);
    assert_eq!(report.flag_waits, 2 * 3 + 4 * 4);
    assert!(report.dispatch.matmuls > 0);
}

#[test_log::test]
fn mismatched_selector_is_rejected() {
    let dims = Dims::default();
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        reversed_slots(2, &dims),
        100,
    );
    let caches = fixture.caches();
    let mut plan = plan(&fixture, &caches, Topology::paired(2));
    let expected = plan.selector.value();
    let mut other = plan.scenario;
    other.quant = QuantMode::FullQuantKvQuant;
    plan.selector = VariantSelector::encode(&other);
    let outputs = PrologOutputs::allocate(&plan);

    let result = Executor::from_config(config()).run(&plan, &fixture.inputs, &caches, &outputs);

    match result {
        Err(ExecutionError::SelectorMismatch { selector, expected: planned }) => {
            assert_eq!(selector, plan.selector.value());
            assert_eq!(planned, expected);
        }
        other => panic!("expected a selector mismatch, got {other:?}"),
    }
}

#[test_log::test]
fn lenient_executor_runs_the_plan_despite_the_selector() {
    let dims = Dims::default();
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        reversed_slots(2, &dims),
        101,
    );
    let caches = fixture.caches();
    let mut plan = plan(&fixture, &caches, Topology::paired(2));
    let mut other = plan.scenario;
    other.cache = mla_prolog::components::CacheLayout::PaNz;
    plan.selector = VariantSelector::encode(&other);
    let outputs = PrologOutputs::allocate(&plan);

    let mut config = GlobalConfig::default();
    config.pipeline.strict_selector = false;
    Executor::from_config(Arc::new(config))
        .run(&plan, &fixture.inputs, &caches, &outputs)
        .unwrap();

    assert_matches_reference(&fixture, &outputs.into_tensors().unwrap(), caches);
}

#[test_log::test]
fn undecodable_selector_is_rejected() {
    let dims = Dims::default();
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        reversed_slots(2, &dims),
        102,
    );
    let caches = fixture.caches();
    let mut plan = plan(&fixture, &caches, Topology::paired(2));
    plan.selector = VariantSelector::from_raw(42);
    let outputs = PrologOutputs::allocate(&plan);

    let result = Executor::from_config(config()).run(&plan, &fixture.inputs, &caches, &outputs);

    assert!(matches!(result, Err(ExecutionError::InvalidSelector(42))));
}

#[test_log::test]
fn wrong_buffer_dtype_is_reported_before_launch() {
    let dims = Dims::default();
    let mut fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        reversed_slots(2, &dims),
        103,
    );
    let caches = fixture.caches();
    let plan = plan(&fixture, &caches, Topology::paired(2));
    fixture.inputs.rope_sin = Tensor::from_vec(vec![2, dims.rope], vec![0.0f32; 2 * dims.rope]);
    let outputs = PrologOutputs::allocate(&plan);

    let result = Executor::from_config(config()).run(&plan, &fixture.inputs, &caches, &outputs);

    assert!(matches!(
        result,
        Err(ExecutionError::BufferMismatch {
            buffer: "rope_sin",
            ..
        })
    ));
}

#[test_log::test]
fn cache_dtype_must_match_the_quant_mode() {
    let dims = Dims::default();
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        reversed_slots(2, &dims),
        104,
    );
    let plan = plan(&fixture, &fixture.caches(), Topology::paired(2));
    let caches = PagedCaches::new(
        Tensor::zeros(ElemType::I8, fixture.kv_cache.shape.clone()),
        fixture.kr_cache.clone(),
    );
    let outputs = PrologOutputs::allocate(&plan);

    let result = Executor::from_config(config()).run(&plan, &fixture.inputs, &caches, &outputs);

    assert!(matches!(
        result,
        Err(ExecutionError::BufferMismatch {
            buffer: "kv_cache",
            ..
        })
    ));
}

#[test_log::test]
fn slot_past_the_cache_is_rejected() {
    let dims = Dims::default();
    let capacity = (dims.blocks * dims.block_size) as i64;
    let fixture = Fixture::new(
        QuantMode::NoQuant,
        TokenLayout::Fused { tokens: 2 },
        dims,
        "PA_BSND",
        Slots::Direct(vec![0, capacity]),
        104,
    );
    let caches = fixture.caches();
    let plan = plan(&fixture, &caches, Topology::paired(2));
    let outputs = PrologOutputs::allocate(&plan);

    let result = Executor::from_config(config()).run(&plan, &fixture.inputs, &caches, &outputs);

    assert!(matches!(
        result,
        Err(ExecutionError::CacheSlotOutOfRange { token: 1, .. })
    ));
}
