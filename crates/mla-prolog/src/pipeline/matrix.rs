use alloc::{format, vec::Vec};
use core::ops::Range;
use half::bf16;
use mla_prolog_runtime::{EngineId, EngineState, Wave, engine::StateTracker};

use crate::components::ExecutionError;
use crate::pipeline::{
    MatmulInput, Operand, PrologStage, QuantScheme, StageContext, TileMatmul, io::buffer_mismatch,
};
use crate::tiling::{MatmulPartition, RegionKind};

type Out<I> = <I as MatmulInput>::Out;

/// Runs the four projections of the prolog on one matrix engine.
pub struct MatrixEngine<'a, P: QuantScheme> {
    id: EngineId,
    slot: u32,
    ctx: &'a StageContext<'a, P>,
    tracker: StateTracker,
}

impl<'a, P: QuantScheme> MatrixEngine<'a, P> {
    /// Matrix engine `index`, using workspace tile `slot`.
    pub fn new(index: u32, slot: u32, ctx: &'a StageContext<'a, P>) -> Self {
        Self {
            id: EngineId::matrix(index),
            slot,
            ctx,
            tracker: StateTracker::default(),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn tracker(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn execute(&mut self, stage: PrologStage, wave: &Wave) -> Result<(), ExecutionError> {
        match stage {
            PrologStage::MatmulCq => {
                self.ctx.counters.wave();
                self.matmul_cq(wave)
            }
            PrologStage::MatmulCkvKr => self.matmul_ckv_kr(wave),
            PrologStage::MatmulQcQr => self.matmul_qc_qr(wave),
            PrologStage::MatmulQn => self.matmul_qn(wave),
            other => Err(ExecutionError::InvalidSchedule {
                engine: self.id,
                reason: format!("can't run vector stage {other:?}"),
            }),
        }
    }

    fn columns(&self, partition: &MatmulPartition) -> Range<usize> {
        let columns = partition.columns(self.id.index);
        columns.start as usize..columns.end as usize
    }

    fn tokens<'t, E>(&self, values: &'t [E], wave: &Wave, width: usize) -> &'t [E] {
        let start = wave.token_start as usize * width;
        &values[start..start + wave.token_count as usize * width]
    }

    fn matmul_cq(&mut self, wave: &Wave) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let shape = &ctx.plan.shape;
        let partition = &ctx.plan.tiling.mm_cq;
        let columns = self.columns(partition);
        if columns.is_empty() {
            return Ok(());
        }

        let embed = shape.embed as usize;
        let rows = wave.token_count as usize;
        let lhs = self.tokens(ctx.buffers.token_x, wave, embed);

        let out: Vec<Out<P::Input>> = TileMatmul::new(self.id, &mut self.tracker, ctx.counters).run(
            Operand::dense(lhs, rows, embed),
            Operand::dense(ctx.buffers.weight_dq, embed, shape.cq as usize),
            columns.clone(),
            partition.base,
        );

        ctx.store_block(RegionKind::CqResult, self.slot, 0..wave.token_count, columns, &out)
    }

    fn matmul_ckv_kr(&mut self, wave: &Wave) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let shape = &ctx.plan.shape;
        let Some(partition) = ctx.plan.tiling.mm_ckv_kr.as_ref() else {
            return Ok(());
        };
        let columns = self.columns(partition);
        if columns.is_empty() {
            return Ok(());
        }

        let embed = shape.embed as usize;
        let rows = wave.token_count as usize;
        let lhs = self.tokens(ctx.buffers.token_x, wave, embed);

        let out: Vec<Out<P::Input>> = TileMatmul::new(self.id, &mut self.tracker, ctx.counters).run(
            Operand::dense(lhs, rows, embed),
            Operand::dense(
                ctx.buffers.weight_dkv_kr,
                embed,
                shape.ckv_kr_width() as usize,
            ),
            columns.clone(),
            partition.base,
        );

        ctx.store_block(RegionKind::CkvKrResult, self.slot, 0..wave.token_count, columns, &out)
    }

    fn matmul_qc_qr(&mut self, wave: &Wave) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let shape = &ctx.plan.shape;
        let partition = &ctx.plan.tiling.mm_qc_qr;
        let columns = self.columns(partition);
        if columns.is_empty() {
            return Ok(());
        }

        let cq = shape.cq as usize;
        let rows = wave.token_count as usize;
        self.tracker.enter(self.id, EngineState::Loading);
        let normalized: Vec<P::QueryWeight> =
            ctx.load_rows(RegionKind::NormalizedCq, self.slot, 0..wave.token_count)?;

        let out: Vec<Out<P::QueryWeight>> =
            TileMatmul::new(self.id, &mut self.tracker, ctx.counters).run(
                Operand::dense(&normalized, rows, cq),
                Operand::dense(ctx.buffers.weight_uq_qr, cq, shape.qc_qr_width() as usize),
                columns.clone(),
                partition.base,
            );

        ctx.store_block(RegionKind::QcQrResult, self.slot, 0..wave.token_count, columns, &out)
    }

    fn matmul_qn(&mut self, wave: &Wave) -> Result<(), ExecutionError> {
        let ctx = self.ctx;
        let plan = ctx.plan;
        let shape = &plan.shape;
        let quant = plan.scenario.quant;
        let heads = plan.tiling.mm_qn.heads(self.id.index);
        if heads.is_empty() {
            return Ok(());
        }

        let rows = wave.token_count as usize;
        let head_dim = shape.head_dim as usize;
        let ckv = shape.ckv as usize;
        let head_weights = head_dim * ckv;

        // Query content sits in its own region once dequantized, else interleaved with the rope.
        let (source, head_stride) = match quant.query_weight_quantized() {
            true => (RegionKind::DequantizedQc, head_dim),
            false => (RegionKind::QcQrResult, shape.head_width() as usize),
        };
        self.tracker.enter(self.id, EngineState::Loading);
        let content: Vec<bf16> = ctx.load_rows(source, self.slot, 0..wave.token_count)?;
        let width = head_stride * shape.heads as usize;

        let weights = ctx.buffers.weight_uk;
        let head_weight = |head: u32| {
            let start = head as usize * head_weights;
            weights[start..start + head_weights].to_vec()
        };
        let mut preload = [head_weight(heads.start), Vec::new()];
        ctx.counters.weight_preload();

        for (index, head) in heads.clone().enumerate() {
            let current = index % 2;
            if head + 1 < heads.end {
                preload[1 - current] = head_weight(head + 1);
                ctx.counters.weight_preload();
            }

            let offset = head as usize * head_stride;
            let out = TileMatmul::new(self.id, &mut self.tracker, ctx.counters).run::<bf16>(
                Operand::new(&content[offset..], rows, head_dim, width),
                Operand::dense(&preload[current], head_dim, ckv),
                0..ckv,
                plan.tiling.mm_qn_base,
            );

            match quant.query_quantized() {
                true => {
                    let columns = head as usize * ckv..(head as usize + 1) * ckv;
                    ctx.store_block(RegionKind::QnResult, self.slot, 0..wave.token_count, columns, &out)?;
                }
                false => {
                    let heads_total = shape.heads as usize;
                    let mut query = ctx.outputs.query()?;
                    let query = query.as_mut_slice::<bf16>().ok_or_else(|| {
                        buffer_mismatch("query", "must be bf16 without query quantization".into())
                    })?;
                    for (row, values) in out.chunks_exact(ckv).enumerate() {
                        let token = wave.token_start as usize + row;
                        let start = (token * heads_total + head as usize) * ckv;
                        query[start..start + ckv].copy_from_slice(values);
                    }
                }
            }
        }

        Ok(())
    }
}
