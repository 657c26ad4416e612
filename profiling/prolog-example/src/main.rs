use std::time::Instant;

use half::bf16;
use mla_prolog::components::{ElemType, PrologAttributes, PrologSetupError};
use mla_prolog::pipeline::{Executor, PagedCaches, PrologInputs, PrologOutputs, Tensor};
use mla_prolog::tiling::Planner;
use mla_prolog_runtime::{Topology, config::GlobalConfig};

const EMBED: usize = 512;
const CQ: usize = 256;
const CKV: usize = 128;
const ROPE: usize = 64;
const HEADS: usize = 16;
const HEAD_DIM: usize = 32;
const BLOCKS: usize = 64;
const BLOCK_SIZE: usize = 16;

fn main() {
    let config = GlobalConfig::get();

    for (name, tokens, engines) in [("decode", 4, 8), ("prefill", 600, 4)] {
        if let Err(err) = run(name, tokens, engines, &config) {
            eprintln!("{name}: {err}");
        }
    }
}

fn run(
    name: &str,
    tokens: usize,
    engines: u32,
    config: &std::sync::Arc<GlobalConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let inputs = inputs(tokens);
    let caches = PagedCaches::new(cache(CKV), cache(ROPE));

    let problem = inputs
        .problem(&caches, PrologAttributes::default())
        .map_err(setup_error)?;
    let plan = Planner::from_config(config.clone())
        .plan_problem(&problem, Topology::paired(engines))
        .map_err(setup_error)?;
    let outputs = PrologOutputs::allocate(&plan);

    let start = Instant::now();
    let report = Executor::from_config(config.clone())
        .run(&plan, &inputs, &caches, &outputs)
        .map_err(|err| err.to_string())?;
    let elapsed = start.elapsed();

    println!("{name}: {tokens} tokens on {engines} engine pairs in {elapsed:?}");
    println!("{}", serde_json::to_string_pretty(&plan.tiling)?);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn setup_error(err: PrologSetupError) -> String {
    err.to_string()
}

/// Slowly varying values in `[-scale, scale]`.
fn wave(len: usize, seed: usize, scale: f32) -> Vec<bf16> {
    (0..len)
        .map(|i| bf16::from_f32(((i * 7 + seed * 13) % 97) as f32 / 48.5 * scale - scale))
        .collect()
}

fn inputs(tokens: usize) -> PrologInputs {
    let qc_qr = HEADS * (HEAD_DIM + ROPE);
    let ckv_kr = CKV + ROPE;
    let dense = |shape: Vec<usize>, seed: usize, scale: f32| {
        let len = shape.iter().product();
        Tensor::from_vec(shape, wave(len, seed, scale))
    };
    let slots: Vec<i64> = (0..tokens)
        .map(|token| (token % (BLOCKS * BLOCK_SIZE)) as i64)
        .collect();

    PrologInputs {
        token_x: dense(vec![tokens, EMBED], 1, 1.0),
        weight_dq: dense(vec![EMBED, CQ], 2, 0.05),
        weight_uq_qr: dense(vec![CQ, qc_qr], 3, 0.05),
        weight_uk: dense(vec![HEADS, HEAD_DIM, CKV], 4, 0.05),
        weight_dkv_kr: dense(vec![EMBED, ckv_kr], 5, 0.05),
        rmsnorm_gamma_cq: dense(vec![CQ], 6, 1.0),
        rmsnorm_gamma_ckv: dense(vec![CKV], 7, 1.0),
        rope_sin: dense(vec![tokens, ROPE], 8, 1.0),
        rope_cos: dense(vec![tokens, ROPE], 9, 1.0),
        cache_index: Tensor::from_vec(vec![tokens], slots),
        dequant_scale_x: None,
        dequant_scale_w_dq: None,
        dequant_scale_w_uq_qr: None,
        dequant_scale_w_dkv_kr: None,
        quant_scale_ckv: None,
        quant_scale_ckr: None,
        smooth_scales_cq: None,
        actual_seq_len: None,
    }
}

fn cache(width: usize) -> Tensor {
    Tensor::zeros(ElemType::BF16, vec![BLOCKS, BLOCK_SIZE, 1, width])
}
