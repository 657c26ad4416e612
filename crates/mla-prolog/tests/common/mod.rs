#![allow(dead_code)]

use half::bf16;
use mla_prolog::components::{
    CacheLayout, ElemType, Element, PrologAttributes, QuantMode, TokenLayout,
};
use mla_prolog::pipeline::{OutputTensors, PagedCaches, PrologInputs, Tensor, nz_offset};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Model dimensions shared by the scenario tests.
#[derive(Debug, Clone, Copy)]
pub struct Dims {
    pub embed: usize,
    pub cq: usize,
    pub ckv: usize,
    pub rope: usize,
    pub heads: usize,
    pub head_dim: usize,
    pub blocks: usize,
    pub block_size: usize,
}

impl Default for Dims {
    fn default() -> Self {
        Self {
            embed: 64,
            cq: 64,
            ckv: 64,
            rope: 32,
            heads: 4,
            head_dim: 16,
            blocks: 4,
            block_size: 16,
        }
    }
}

/// How tokens map to cache slots.
#[derive(Debug, Clone)]
pub enum Slots {
    /// One slot per token, `-1` skips the token.
    Direct(Vec<i64>),
    /// `[batch, max_blocks]` block table, with the cumulative request ends for fused tokens.
    BlockTable {
        table: Vec<i64>,
        max_blocks: usize,
        actual_seq_len: Option<Vec<i64>>,
    },
}

/// Everything one invocation needs.
pub struct Fixture {
    pub mode: QuantMode,
    pub layout: TokenLayout,
    pub dims: Dims,
    pub cache: CacheLayout,
    pub inputs: PrologInputs,
    pub kv_cache: Tensor,
    pub kr_cache: Tensor,
    pub attributes: PrologAttributes,
}

impl Fixture {
    pub fn new(
        mode: QuantMode,
        layout: TokenLayout,
        dims: Dims,
        cache_mode: &str,
        slots: Slots,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let tokens = match layout {
            TokenLayout::Fused { tokens } => tokens as usize,
            TokenLayout::Batched { batch, seq } => (batch * seq) as usize,
        };
        let token_shape = match layout {
            TokenLayout::Fused { .. } => vec![tokens, dims.embed],
            TokenLayout::Batched { batch, seq } => vec![batch as usize, seq as usize, dims.embed],
        };

        let input_quant = mode.input_quantized();
        let weight_quant = mode.query_weight_quantized();
        let kv_quant = mode.kv_quantized();
        let qc_qr = dims.heads * (dims.head_dim + dims.rope);
        let ckv_kr = dims.ckv + dims.rope;

        let activation = |rng: &mut StdRng, shape: Vec<usize>, quantized: bool, range: f32| {
            let len = shape.iter().product();
            match quantized {
                true => int8(rng, shape, len),
                false => bf16s(rng, shape, len, range),
            }
        };

        let cache_index = match &slots {
            Slots::Direct(slots) => Tensor::from_vec(vec![slots.len()], slots.clone()),
            Slots::BlockTable {
                table, max_blocks, ..
            } => Tensor::from_vec(vec![table.len() / max_blocks, *max_blocks], table.clone()),
        };
        let actual_seq_len = match &slots {
            Slots::BlockTable {
                actual_seq_len: Some(ends),
                ..
            } => Some(Tensor::from_vec(vec![ends.len()], ends.clone())),
            _ => None,
        };

        let inputs = PrologInputs {
            token_x: activation(&mut rng, token_shape, input_quant, 1.0),
            weight_dq: activation(&mut rng, vec![dims.embed, dims.cq], input_quant, 0.2),
            weight_uq_qr: activation(&mut rng, vec![dims.cq, qc_qr], weight_quant, 0.2),
            weight_uk: bf16s(
                &mut rng,
                vec![dims.heads, dims.head_dim, dims.ckv],
                dims.heads * dims.head_dim * dims.ckv,
                0.2,
            ),
            weight_dkv_kr: activation(&mut rng, vec![dims.embed, ckv_kr], input_quant, 0.2),
            rmsnorm_gamma_cq: bf16s(&mut rng, vec![dims.cq], dims.cq, 1.0),
            rmsnorm_gamma_ckv: bf16s(&mut rng, vec![dims.ckv], dims.ckv, 1.0),
            rope_sin: bf16s(&mut rng, vec![tokens, dims.rope], tokens * dims.rope, 1.0),
            rope_cos: bf16s(&mut rng, vec![tokens, dims.rope], tokens * dims.rope, 1.0),
            cache_index,
            dequant_scale_x: input_quant.then(|| scales(&mut rng, tokens, 0.01)),
            dequant_scale_w_dq: input_quant.then(|| scales(&mut rng, dims.cq, 0.01)),
            dequant_scale_w_uq_qr: weight_quant.then(|| scales(&mut rng, qc_qr, 0.002)),
            dequant_scale_w_dkv_kr: input_quant.then(|| scales(&mut rng, ckv_kr, 0.01)),
            quant_scale_ckv: kv_quant.then(|| scales(&mut rng, dims.ckv, 40.0)),
            quant_scale_ckr: kv_quant.then(|| scales(&mut rng, 1, 40.0)),
            smooth_scales_cq: weight_quant.then(|| scales(&mut rng, dims.cq, 1.0)),
            actual_seq_len,
        };

        let cache_elem = match kv_quant {
            true => ElemType::I8,
            false => ElemType::BF16,
        };
        let cache_shape = |width: usize| vec![dims.blocks, dims.block_size, 1, width];

        Self {
            mode,
            layout,
            dims,
            cache: CacheLayout::parse(cache_mode),
            inputs,
            kv_cache: Tensor::zeros(cache_elem, cache_shape(dims.ckv)),
            kr_cache: Tensor::zeros(cache_elem, cache_shape(dims.rope)),
            attributes: PrologAttributes {
                cache_mode: cache_mode.into(),
                ..Default::default()
            },
        }
    }

    pub fn tokens(&self) -> usize {
        match self.layout {
            TokenLayout::Fused { tokens } => tokens as usize,
            TokenLayout::Batched { batch, seq } => (batch * seq) as usize,
        }
    }

    pub fn caches(&self) -> PagedCaches {
        PagedCaches::new(self.kv_cache.clone(), self.kr_cache.clone())
    }

    /// Slot of every token, resolved the way the caller's cache layout defines it.
    pub fn slots(&self) -> Vec<Option<usize>> {
        let index = self.inputs.cache_index.as_slice::<i64>().unwrap();
        let block_size = self.dims.block_size;
        let resolve = |slot: i64| (slot >= 0).then_some(slot as usize);

        if !self.cache.is_block_table() {
            return index[..self.tokens()].iter().copied().map(resolve).collect();
        }

        let max_blocks = self.inputs.cache_index.shape[1];
        let positions: Vec<(usize, usize)> = match (&self.inputs.actual_seq_len, self.layout) {
            (Some(ends), _) => {
                let ends = ends.as_slice::<i64>().unwrap();
                let mut start = 0;
                let mut positions = Vec::new();
                for (batch, end) in ends.iter().enumerate() {
                    let end = *end as usize;
                    positions.extend((start..end).map(|token| (batch, token - start)));
                    start = end;
                }
                positions
            }
            (None, TokenLayout::Batched { seq, .. }) => (0..self.tokens())
                .map(|token| (token / seq as usize, token % seq as usize))
                .collect(),
            (None, TokenLayout::Fused { .. }) => (0..self.tokens()).map(|t| (0, t)).collect(),
        };

        positions
            .into_iter()
            .map(|(batch, position)| {
                let block = index[batch * max_blocks + position / block_size];
                resolve(block).map(|block| block * block_size + position % block_size)
            })
            .collect()
    }
}

fn int8(rng: &mut StdRng, shape: Vec<usize>, len: usize) -> Tensor {
    let values: Vec<i8> = (0..len).map(|_| rng.random_range(-8..=8)).collect();
    Tensor::from_vec(shape, values)
}

fn bf16s(rng: &mut StdRng, shape: Vec<usize>, len: usize, range: f32) -> Tensor {
    let values: Vec<bf16> = (0..len)
        .map(|_| bf16::from_f32(rng.random_range(-range..range)))
        .collect();
    Tensor::from_vec(shape, values)
}

fn scales(rng: &mut StdRng, len: usize, magnitude: f32) -> Tensor {
    let values: Vec<f32> = (0..len)
        .map(|_| rng.random_range(0.5 * magnitude..1.5 * magnitude))
        .collect();
    Tensor::from_vec(vec![len], values)
}

/// Outputs and caches of the scalar model, as `f32`.
#[derive(Debug, Clone)]
pub struct Expected {
    pub query: Vec<f32>,
    pub query_rope: Vec<f32>,
    pub dequant_scale_q_nope: Vec<f32>,
    pub query_norm: Vec<f32>,
    pub dequant_scale_q_norm: Vec<f32>,
    pub kv_cache: Vec<f32>,
    pub kr_cache: Vec<f32>,
}

fn round_bf16(value: f32) -> f32 {
    bf16::from_f32(value).to_f32()
}

fn round_i8(value: f32) -> f32 {
    i8::from_f32(value) as f32
}

fn divide(value: f32, scale: f32) -> f32 {
    if scale > 0.0 { value / scale } else { 0.0 }
}

fn per_channel(scales: &Option<Vec<f32>>, channel: usize) -> f32 {
    match scales {
        Some(scales) if scales.len() == 1 => scales[0],
        Some(scales) => scales[channel],
        None => 1.0,
    }
}

/// Row `x` times the `[k, n]` matrix `w`, accumulated in `k` order.
fn row_matmul(x: &[f32], w: &[f32], n: usize) -> Vec<f32> {
    (0..n)
        .map(|col| {
            let mut acc = 0.0f32;
            for (k, x) in x.iter().enumerate() {
                acc += x * w[k * n + col];
            }
            acc
        })
        .collect()
}

fn rms_norm(values: &mut [f32], gamma: &[f32], epsilon: f32) {
    let reciprocal = 1.0 / values.len() as f32;
    let mean = values.iter().map(|v| v * v).sum::<f32>() * reciprocal;
    let inverse = 1.0 / (mean + epsilon).sqrt();
    for (value, gamma) in values.iter_mut().zip(gamma) {
        *value = *value * inverse * gamma;
    }
}

fn rotate_half(values: &[f32], sin: &[f32], cos: &[f32]) -> Vec<f32> {
    let half = values.len() / 2;
    (0..values.len())
        .map(|i| {
            let rotated = if i < half { -values[i + half] } else { values[i - half] };
            values[i] * cos[i] + rotated * sin[i]
        })
        .collect()
}

fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |max, v| max.max(v.abs()))
}

/// Straight-line model of the whole prolog, one token at a time.
pub fn reference(fixture: &Fixture) -> Expected {
    let d = fixture.dims;
    let mode = fixture.mode;
    let inputs = &fixture.inputs;
    let tokens = fixture.tokens();
    let attributes = &fixture.attributes;
    let head_width = d.head_dim + d.rope;
    let qc_qr = d.heads * head_width;
    let ckv_kr = d.ckv + d.rope;

    let f = |tensor: &Tensor| tensor.to_f32_vec();
    let opt = |tensor: &Option<Tensor>| tensor.as_ref().map(|t| t.to_f32_vec());

    let x = f(&inputs.token_x);
    let w_dq = f(&inputs.weight_dq);
    let w_uq_qr = f(&inputs.weight_uq_qr);
    let w_uk = f(&inputs.weight_uk);
    let w_dkv_kr = f(&inputs.weight_dkv_kr);
    let gamma_cq = f(&inputs.rmsnorm_gamma_cq);
    let gamma_ckv = f(&inputs.rmsnorm_gamma_ckv);
    let sin = f(&inputs.rope_sin);
    let cos = f(&inputs.rope_cos);
    let scale_x = opt(&inputs.dequant_scale_x);
    let scale_w_dq = opt(&inputs.dequant_scale_w_dq);
    let scale_w_uq_qr = opt(&inputs.dequant_scale_w_uq_qr);
    let scale_w_dkv_kr = opt(&inputs.dequant_scale_w_dkv_kr);
    let quant_scale_ckv = opt(&inputs.quant_scale_ckv);
    let quant_scale_ckr = opt(&inputs.quant_scale_ckr);
    let smooth = opt(&inputs.smooth_scales_cq);

    let mut expected = Expected {
        query: vec![0.0; tokens * d.heads * d.ckv],
        query_rope: vec![0.0; tokens * d.heads * d.rope],
        dequant_scale_q_nope: vec![0.0; tokens * d.heads],
        query_norm: vec![0.0; tokens * d.cq],
        dequant_scale_q_norm: vec![0.0; tokens],
        kv_cache: f(&fixture.kv_cache),
        kr_cache: f(&fixture.kr_cache),
    };
    let slots = match d.blocks {
        0 => vec![None; tokens],
        _ => fixture.slots(),
    };

    // Narrows a raw accumulator to the stored projection, dequantizing int8 results.
    let project = |acc: f32, token: usize, channel: usize, weight_scale: &Option<Vec<f32>>| {
        match mode.input_quantized() {
            true => acc * scale_x.as_ref().unwrap()[token] * weight_scale.as_ref().unwrap()[channel],
            false => round_bf16(acc),
        }
    };

    for t in 0..tokens {
        let row = &x[t * d.embed..(t + 1) * d.embed];
        let sin = &sin[t * d.rope..(t + 1) * d.rope];
        let cos = &cos[t * d.rope..(t + 1) * d.rope];

        // Compressed query.
        let acc = row_matmul(row, &w_dq, d.cq);
        let mut cq: Vec<f32> = acc
            .iter()
            .enumerate()
            .map(|(c, acc)| project(*acc, t, c, &scale_w_dq))
            .collect();
        rms_norm(&mut cq, &gamma_cq, attributes.epsilon_cq);

        let (normalized, token_scale) = match mode.query_weight_quantized() {
            true => {
                if let Some(smooth) = &smooth {
                    for (value, smooth) in cq.iter_mut().zip(smooth) {
                        *value *= smooth;
                    }
                }
                let scale = max_abs(&cq) / 127.0;
                (cq.iter().map(|v| round_i8(divide(*v, scale))).collect::<Vec<_>>(), scale)
            }
            false => (cq.iter().map(|v| round_bf16(*v)).collect(), 1.0),
        };
        expected.query_norm[t * d.cq..(t + 1) * d.cq].copy_from_slice(&normalized);
        expected.dequant_scale_q_norm[t] = token_scale;

        // Query content and rope.
        let acc = row_matmul(&normalized, &w_uq_qr, qc_qr);
        let dequant = |col: usize| match mode.query_weight_quantized() {
            true => acc[col] * scale_w_uq_qr.as_ref().unwrap()[col] * token_scale,
            false => acc[col],
        };

        for n in 0..d.heads {
            let base = n * head_width;
            let rope: Vec<f32> = (0..d.rope)
                .map(|j| match mode.query_weight_quantized() {
                    true => dequant(base + d.head_dim + j),
                    false => round_bf16(acc[base + d.head_dim + j]),
                })
                .collect();
            let rope = rotate_half(&rope, sin, cos);
            let content: Vec<f32> = (0..d.head_dim)
                .map(|j| round_bf16(dequant(base + j)))
                .collect();

            let weights = &w_uk[n * d.head_dim * d.ckv..(n + 1) * d.head_dim * d.ckv];
            let absorbed: Vec<f32> = row_matmul(&content, weights, d.ckv)
                .into_iter()
                .map(round_bf16)
                .collect();

            let index = t * d.heads + n;
            let query = &mut expected.query[index * d.ckv..(index + 1) * d.ckv];
            let query_rope = &mut expected.query_rope[index * d.rope..(index + 1) * d.rope];

            match mode.query_quantized() {
                true => {
                    let scale = max_abs(&absorbed) / 127.0;
                    for (out, value) in query.iter_mut().zip(&absorbed) {
                        *out = round_i8(divide(*value, scale));
                    }
                    expected.dequant_scale_q_nope[index] = scale;
                    let rope_scale = quant_scale_ckv.as_ref().unwrap()[0];
                    for (out, value) in query_rope.iter_mut().zip(&rope) {
                        *out = round_bf16(round_bf16(*value) * rope_scale);
                    }
                }
                false => {
                    query.copy_from_slice(&absorbed);
                    for (out, value) in query_rope.iter_mut().zip(&rope) {
                        *out = round_bf16(*value);
                    }
                }
            }
        }

        // Caches.
        let Some(slot) = slots[t] else {
            continue;
        };
        let acc = row_matmul(row, &w_dkv_kr, ckv_kr);
        let kv: Vec<f32> = acc
            .iter()
            .enumerate()
            .map(|(c, acc)| project(*acc, t, c, &scale_w_dkv_kr))
            .collect();

        let mut ckv = kv[..d.ckv].to_vec();
        rms_norm(&mut ckv, &gamma_ckv, attributes.epsilon_ckv);
        let kr = rotate_half(&kv[d.ckv..], sin, cos);

        let encode = |value: f32, scale: f32| match mode.kv_quantized() {
            true => round_i8(value * scale),
            false => round_bf16(value),
        };
        let c0 = match mode.kv_quantized() {
            true => 32,
            false => 16,
        };
        let offset = |channel: usize, width: usize| match fixture.cache.is_nz() {
            true => nz_offset(slot, channel, width, d.block_size, c0),
            false => slot * width + channel,
        };

        for (c, value) in ckv.iter().enumerate() {
            expected.kv_cache[offset(c, d.ckv)] = encode(*value, per_channel(&quant_scale_ckv, c));
        }
        for (c, value) in kr.iter().enumerate() {
            expected.kr_cache[offset(c, d.rope)] = encode(*value, per_channel(&quant_scale_ckr, c));
        }
    }

    expected
}

/// Compares within a bf16 ulp or so; int8 codes may differ by one step.
pub fn assert_close(name: &str, actual: &[f32], expected: &[f32], elem: ElemType) {
    assert_eq!(actual.len(), expected.len(), "{name} length");

    for (index, (actual, expected)) in actual.iter().zip(expected).enumerate() {
        let tolerance = match elem {
            ElemType::I8 => 1.0,
            _ => 1e-3 + 1e-2 * expected.abs(),
        };
        assert!(
            (actual - expected).abs() <= tolerance,
            "{name}[{index}]: got {actual}, expected {expected}"
        );
    }
}

/// Checks every output and both caches against the scalar model.
pub fn assert_matches_reference(
    fixture: &Fixture,
    outputs: &OutputTensors,
    caches: PagedCaches,
) {
    let expected = reference(fixture);
    let (kv_cache, kr_cache) = caches.into_parts().unwrap();

    assert_close(
        "query",
        &outputs.query.to_f32_vec(),
        &expected.query,
        outputs.query.elem(),
    );
    assert_close(
        "query_rope",
        &outputs.query_rope.to_f32_vec(),
        &expected.query_rope,
        ElemType::BF16,
    );
    assert_close(
        "dequant_scale_q_nope",
        &outputs.dequant_scale_q_nope.to_f32_vec(),
        &expected.dequant_scale_q_nope,
        ElemType::F32,
    );
    assert_close("kv_cache", &kv_cache.to_f32_vec(), &expected.kv_cache, kv_cache.elem());
    assert_close("kr_cache", &kr_cache.to_f32_vec(), &expected.kr_cache, kr_cache.elem());

    if let Some(query_norm) = &outputs.query_norm {
        assert_close(
            "query_norm",
            &query_norm.to_f32_vec(),
            &expected.query_norm,
            query_norm.elem(),
        );
    }
    if let Some(scales) = &outputs.dequant_scale_q_norm {
        assert_close(
            "dequant_scale_q_norm",
            &scales.to_f32_vec(),
            &expected.dequant_scale_q_norm,
            ElemType::F32,
        );
    }
}
