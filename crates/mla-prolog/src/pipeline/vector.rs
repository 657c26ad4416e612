use alloc::{format, vec, vec::Vec};
use core::ops::Range;
use half::bf16;
use mla_prolog_runtime::{EngineId, EngineState, Wave, engine::StateTracker, topology::F32_BLOCK_LANES};

use crate::components::{Element, ExecutionError};
use crate::pipeline::{
    MatmulInput, PrologStage, QuantScheme, StageContext, channel_scale, io::buffer_mismatch,
    vector_heads, vector_rows,
};
use crate::tiling::RegionKind;

type Out<I> = <I as MatmulInput>::Out;

/// Largest magnitude of a symmetric int8 code.
pub const INT8_MAX: f32 = 127.0;

/// Runs the elementwise stages of the prolog on one vector engine.
pub struct VectorEngine<'a, P: QuantScheme> {
    id: EngineId,
    slot: u32,
    ctx: &'a StageContext<'a, P>,
    tracker: StateTracker,
    /// Per token scales of the normalized query, when they aren't staged in the workspace.
    token_scales: Vec<f32>,
}

impl<'a, P: QuantScheme> VectorEngine<'a, P> {
    /// Vector engine `index`, using workspace tile `slot`.
    pub fn new(index: u32, slot: u32, ctx: &'a StageContext<'a, P>) -> Self {
        Self {
            id: EngineId::vector(index),
            slot,
            ctx,
            tracker: StateTracker::default(),
            token_scales: Vec::new(),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn tracker(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn execute(&mut self, stage: PrologStage, wave: &Wave) -> Result<(), ExecutionError> {
        let rows = vector_rows(self.ctx.plan, self.id.index, wave.token_count);

        self.tracker.enter(self.id, EngineState::Computing);
        match stage {
            PrologStage::NormalizeCq => self.normalize_cq(wave, rows)?,
            PrologStage::NormalizeScatterCkv => self.normalize_scatter_ckv(wave, rows)?,
            PrologStage::RopeScatterKr => self.rope_scatter_kr(wave, rows)?,
            PrologStage::RopeQr => self.rope_qr(wave, rows)?,
            PrologStage::DequantizeQc => self.dequantize_qc(wave, rows)?,
            PrologStage::QuantizeQn => self.quantize_qn(wave, rows)?,
            other => {
                return Err(ExecutionError::InvalidSchedule {
                    engine: self.id,
                    reason: format!("can't run matrix stage {other:?}"),
                });
            }
        }
        self.ctx.counters.vector_stage();

        Ok(())
    }

    fn normalize_cq(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let plan = ctx.plan;
        let quant = plan.scenario.quant;
        let buffers = &ctx.buffers;
        let cq = plan.shape.cq as usize;

        self.token_scales.clear();
        self.token_scales.resize(wave.token_count as usize, 1.0);
        if rows.is_empty() {
            return Ok(());
        }

        let acc: Vec<Out<P::Input>> = ctx.load_rows(RegionKind::CqResult, self.slot, rows.clone())?;
        let mut normalized: Vec<P::QueryWeight> = Vec::with_capacity(acc.len());
        let mut scales = Vec::with_capacity(rows.len());

        for (row, values) in rows.clone().zip(acc.chunks_exact(cq)) {
            let token = (wave.token_start + row) as usize;
            let mut values: Vec<f32> = values.iter().map(|value| value.to_f32()).collect();

            if let (Some(scale_x), Some(scale_w)) = (buffers.scale_x, buffers.scale_w_dq) {
                for (value, scale) in values.iter_mut().zip(scale_w) {
                    *value = *value * scale_x[token] * scale;
                }
            }
            rms_norm(
                &mut values,
                buffers.gamma_cq,
                plan.tiling.reciprocal_cq,
                plan.tiling.epsilon_cq,
            );

            let scale = match quant.query_weight_quantized() {
                true => {
                    if let Some(smooth) = buffers.smooth_cq {
                        for (value, smooth) in values.iter_mut().zip(smooth) {
                            *value *= smooth;
                        }
                    }
                    symmetric_scale(&values)
                }
                false => 1.0,
            };
            normalized.extend(values.iter().map(|value| P::QueryWeight::from_f32(divide(*value, scale))));
            scales.push(scale);
        }

        ctx.store_rows(RegionKind::NormalizedCq, self.slot, rows.clone(), &normalized)?;

        if quant.query_weight_quantized() {
            match ctx.stages_scales() {
                true => {
                    let staged: Vec<f32> = scales
                        .iter()
                        .flat_map(|scale| [*scale; F32_BLOCK_LANES])
                        .collect();
                    ctx.store_rows(RegionKind::DequantScaleStaging, self.slot, rows.clone(), &staged)?;
                }
                false => {
                    self.token_scales[rows.start as usize..rows.end as usize]
                        .copy_from_slice(&scales);
                }
            }
        }

        if let Some(query_norm) = ctx.outputs.query_norm() {
            let mut query_norm = query_norm?;
            let query_norm = query_norm
                .as_mut_slice::<P::QueryWeight>()
                .ok_or_else(|| buffer_mismatch("query_norm", format!("must be {}", P::QueryWeight::ELEM)))?;
            let start = (wave.token_start + rows.start) as usize * cq;
            query_norm[start..start + normalized.len()].copy_from_slice(&normalized);
        }
        if let Some(scale_q_norm) = ctx.outputs.dequant_scale_q_norm() {
            let mut scale_q_norm = scale_q_norm?;
            let scale_q_norm = scale_q_norm
                .as_mut_slice::<f32>()
                .ok_or_else(|| buffer_mismatch("dequant_scale_q_norm", "must be f32".into()))?;
            let start = (wave.token_start + rows.start) as usize;
            scale_q_norm[start..start + scales.len()].copy_from_slice(&scales);
        }

        Ok(())
    }

    fn normalize_scatter_ckv(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let plan = ctx.plan;
        let buffers = &ctx.buffers;
        let ckv = plan.shape.ckv as usize;
        let width = plan.shape.ckv_kr_width() as usize;
        if rows.is_empty() {
            return Ok(());
        }

        let acc: Vec<Out<P::Input>> = ctx.load_rows(RegionKind::CkvKrResult, self.slot, rows.clone())?;
        let quantize = plan.scenario.quant.kv_quantized();
        let mut encoded_rows = Vec::with_capacity(rows.len());

        for (row, values) in rows.zip(acc.chunks_exact(width)) {
            let token = wave.token_start + row;
            if ctx.slots.slot(token).is_none() {
                continue;
            }
            let mut values: Vec<f32> = values[..ckv].iter().map(|value| value.to_f32()).collect();

            if let (Some(scale_x), Some(scale_w)) = (buffers.scale_x, buffers.scale_w_dkv_kr) {
                for (value, scale) in values.iter_mut().zip(scale_w) {
                    *value = *value * scale_x[token as usize] * scale;
                }
            }
            rms_norm(
                &mut values,
                buffers.gamma_ckv,
                plan.tiling.reciprocal_ckv,
                plan.tiling.epsilon_ckv,
            );

            let encoded: Vec<P::Cache> = values
                .iter()
                .enumerate()
                .map(|(channel, value)| match quantize {
                    true => P::Cache::from_f32(value * channel_scale(buffers.quant_scale_ckv, channel)),
                    false => P::Cache::from_f32(*value),
                })
                .collect();
            encoded_rows.push((token, encoded));
        }

        self.tracker.enter(self.id, EngineState::Draining);
        let mut cache = ctx.caches.kv_cache()?;
        let cache = cache
            .as_mut_slice::<P::Cache>()
            .ok_or_else(|| buffer_mismatch("kv_cache", format!("must be {}", P::Cache::ELEM)))?;
        ctx.counters.cache_write(ctx.slots.scatter(cache, &encoded_rows));

        Ok(())
    }

    fn rope_scatter_kr(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let plan = ctx.plan;
        let buffers = &ctx.buffers;
        let ckv = plan.shape.ckv as usize;
        let rope = plan.shape.rope as usize;
        let width = plan.shape.ckv_kr_width() as usize;
        if rows.is_empty() {
            return Ok(());
        }

        let acc: Vec<Out<P::Input>> = ctx.load_rows(RegionKind::CkvKrResult, self.slot, rows.clone())?;
        let quantize = plan.scenario.quant.kv_quantized();
        let mut encoded_rows = Vec::with_capacity(rows.len());

        for (row, values) in rows.zip(acc.chunks_exact(width)) {
            let token = wave.token_start + row;
            if ctx.slots.slot(token).is_none() {
                continue;
            }
            let mut values: Vec<f32> = values[ckv..].iter().map(|value| value.to_f32()).collect();

            if let (Some(scale_x), Some(scale_w)) = (buffers.scale_x, buffers.scale_w_dkv_kr) {
                for (value, scale) in values.iter_mut().zip(&scale_w[ckv..]) {
                    *value = *value * scale_x[token as usize] * scale;
                }
            }
            let start = token as usize * rope;
            rotate_half(
                &mut values,
                &buffers.rope_sin[start..start + rope],
                &buffers.rope_cos[start..start + rope],
            );

            let encoded: Vec<P::Cache> = values
                .iter()
                .enumerate()
                .map(|(channel, value)| match quantize {
                    true => P::Cache::from_f32(value * channel_scale(buffers.quant_scale_ckr, channel)),
                    false => P::Cache::from_f32(*value),
                })
                .collect();
            encoded_rows.push((token, encoded));
        }

        self.tracker.enter(self.id, EngineState::Draining);
        let mut cache = ctx.caches.kr_cache()?;
        let cache = cache
            .as_mut_slice::<P::Cache>()
            .ok_or_else(|| buffer_mismatch("kr_cache", format!("must be {}", P::Cache::ELEM)))?;
        ctx.counters.cache_write(ctx.slots.scatter(cache, &encoded_rows));

        Ok(())
    }

    /// Scales of the normalized query for wave rows `rows`.
    fn row_scales(&self, rows: Range<u32>) -> Result<Vec<f32>, ExecutionError> {
        if !self.ctx.plan.scenario.quant.query_weight_quantized() {
            return Ok(vec![1.0; rows.len()]);
        }

        match self.ctx.stages_scales() {
            true => {
                let staged: Vec<f32> =
                    self.ctx
                        .load_rows(RegionKind::DequantScaleStaging, self.slot, rows)?;
                Ok(staged
                    .iter()
                    .step_by(F32_BLOCK_LANES)
                    .copied()
                    .collect())
            }
            false => Ok(self.token_scales[rows.start as usize..rows.end as usize].to_vec()),
        }
    }

    fn rope_qr(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let shape = &ctx.plan.shape;
        let buffers = &ctx.buffers;
        if rows.is_empty() {
            return Ok(());
        }

        let heads = shape.heads as usize;
        let head_dim = shape.head_dim as usize;
        let rope = shape.rope as usize;
        let head_width = shape.head_width() as usize;
        let width = shape.qc_qr_width() as usize;

        let acc: Vec<Out<P::QueryWeight>> =
            ctx.load_rows(RegionKind::QcQrResult, self.slot, rows.clone())?;
        let scales = self.row_scales(rows.clone())?;
        let first = (wave.token_start + rows.start) as usize * heads * rope;
        let mut rotated_rows: Vec<bf16> = Vec::with_capacity(rows.len() * heads * rope);

        for ((row, values), token_scale) in rows.zip(acc.chunks_exact(width)).zip(scales) {
            let token = (wave.token_start + row) as usize;
            let sin = &buffers.rope_sin[token * rope..(token + 1) * rope];
            let cos = &buffers.rope_cos[token * rope..(token + 1) * rope];

            for head in 0..heads {
                let start = head * head_width + head_dim;
                let mut rotated: Vec<f32> = values[start..start + rope]
                    .iter()
                    .map(|value| value.to_f32())
                    .collect();

                if let Some(scale_w) = buffers.scale_w_uq_qr {
                    for (value, scale) in rotated.iter_mut().zip(&scale_w[start..start + rope]) {
                        *value = *value * scale * token_scale;
                    }
                }
                rotate_half(&mut rotated, sin, cos);
                rotated_rows.extend(rotated.into_iter().map(bf16::from_f32));
            }
        }

        self.tracker.enter(self.id, EngineState::Draining);
        let mut query_rope = ctx.outputs.query_rope()?;
        let query_rope = query_rope
            .as_mut_slice::<bf16>()
            .ok_or_else(|| buffer_mismatch("query_rope", "must be bf16".into()))?;
        query_rope[first..first + rotated_rows.len()].copy_from_slice(&rotated_rows);

        Ok(())
    }

    fn dequantize_qc(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let plan = ctx.plan;
        let shape = &plan.shape;
        let Some(scale_w) = ctx.buffers.scale_w_uq_qr else {
            return Err(buffer_mismatch(
                "dequant_scale_w_uq_qr",
                "is required to dequantize the query".into(),
            ));
        };

        // With staged scales every engine sees every row, so the work splits by head instead.
        let (rows, heads) = match ctx.stages_scales() {
            true => (0..wave.token_count, vector_heads(plan, self.id.index)),
            false => (rows, 0..shape.heads),
        };
        if rows.is_empty() || heads.is_empty() {
            return Ok(());
        }

        let head_dim = shape.head_dim as usize;
        let head_width = shape.head_width() as usize;
        let width = shape.qc_qr_width() as usize;

        let acc: Vec<Out<P::QueryWeight>> =
            ctx.load_rows(RegionKind::QcQrResult, self.slot, rows.clone())?;
        let scales = self.row_scales(rows.clone())?;
        let mut dequantized = Vec::with_capacity(rows.len() * heads.len() * head_dim);

        for (values, token_scale) in acc.chunks_exact(width).zip(scales) {
            for head in heads.clone() {
                let start = head as usize * head_width;
                for column in start..start + head_dim {
                    let value = values[column].to_f32() * scale_w[column] * token_scale;
                    dequantized.push(bf16::from_f32(value));
                }
            }
        }

        let columns = heads.start as usize * head_dim..heads.end as usize * head_dim;
        ctx.store_block(RegionKind::DequantizedQc, self.slot, rows, columns, &dequantized)
    }

    fn quantize_qn(&mut self, wave: &Wave, rows: Range<u32>) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let shape = &ctx.plan.shape;
        if rows.is_empty() {
            return Ok(());
        }

        let heads = shape.heads as usize;
        let ckv = shape.ckv as usize;
        let rope = shape.rope as usize;
        let rope_scale = ctx
            .buffers
            .quant_scale_ckv
            .and_then(|scales| scales.first().copied())
            .unwrap_or(1.0);

        let content: Vec<bf16> = ctx.load_rows(RegionKind::QnResult, self.slot, rows.clone())?;
        let first = (wave.token_start + rows.start) as usize * heads;
        let mut codes: Vec<i8> = Vec::with_capacity(content.len());
        let mut head_scales: Vec<f32> = Vec::with_capacity(rows.len() * heads);

        for values in content.chunks_exact(ckv) {
            let values: Vec<f32> = values.iter().map(|value| value.to_f32()).collect();
            let scale = symmetric_scale(&values);

            codes.extend(values.into_iter().map(|value| i8::from_f32(divide(value, scale))));
            head_scales.push(scale);
        }

        self.tracker.enter(self.id, EngineState::Draining);
        {
            let mut query = ctx.outputs.query()?;
            let query = query.as_mut_slice::<i8>().ok_or_else(|| {
                buffer_mismatch("query", "must be int8 with query quantization".into())
            })?;
            query[first * ckv..first * ckv + codes.len()].copy_from_slice(&codes);
        }
        {
            let mut scales = ctx.outputs.dequant_scale_q_nope()?;
            let scales = scales
                .as_mut_slice::<f32>()
                .ok_or_else(|| buffer_mismatch("dequant_scale_q_nope", "must be f32".into()))?;
            scales[first..first + head_scales.len()].copy_from_slice(&head_scales);
        }
        let mut query_rope = ctx.outputs.query_rope()?;
        let query_rope = query_rope
            .as_mut_slice::<bf16>()
            .ok_or_else(|| buffer_mismatch("query_rope", "must be bf16".into()))?;
        for slot in query_rope[first * rope..(first + head_scales.len()) * rope].iter_mut() {
            *slot = bf16::from_f32(slot.to_f32() * rope_scale);
        }

        Ok(())
    }
}

/// `x / sqrt(mean(x^2) + eps) * gamma`, in place.
pub(crate) fn rms_norm(values: &mut [f32], gamma: &[bf16], reciprocal: f32, epsilon: f32) {
    let mean = values.iter().map(|value| value * value).sum::<f32>() * reciprocal;
    let inverse = 1.0 / (mean + epsilon).sqrt();

    for (value, gamma) in values.iter_mut().zip(gamma) {
        *value = *value * inverse * gamma.to_f32();
    }
}

/// Rotates the two halves of `values` with the given angle tables, in place.
pub(crate) fn rotate_half(values: &mut [f32], sin: &[bf16], cos: &[bf16]) {
    let half = values.len() / 2;
    let source = values.to_vec();

    for (index, value) in values.iter_mut().enumerate() {
        let rotated = match index < half {
            true => -source[index + half],
            false => source[index - half],
        };
        *value = source[index] * cos[index].to_f32() + rotated * sin[index].to_f32();
    }
}

/// Symmetric int8 scale of a row, zero for an all zero row.
pub(crate) fn symmetric_scale(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |max, value| max.max(value.abs())) / INT8_MAX
}

fn divide(value: f32, scale: f32) -> f32 {
    match scale > 0.0 {
        true => value / scale,
        false => 0.0,
    }
}
