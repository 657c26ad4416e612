use alloc::{format, vec::Vec};
use core::marker::PhantomData;
use core::ops::Range;
use half::bf16;
use mla_prolog_runtime::{
    DispatchCounters,
    memory::{Arena, ArenaView, RegionId},
};

use crate::components::{Element, ExecutionError};
use crate::pipeline::{
    CacheSlots, PagedCaches, PrologOutputs, PrologInputs, QuantScheme, Tensor, TensorElement,
    io::buffer_mismatch,
};
use crate::tiling::{PrologPlan, RegionKind, WorkspaceRegion};

/// Input tensors viewed with the element types of one quantization scheme.
///
/// Scales the scheme doesn't use are dropped even when provided.
pub struct PrologBuffers<'a, P: QuantScheme> {
    pub token_x: &'a [P::Input],
    pub weight_dq: &'a [P::Input],
    pub weight_dkv_kr: &'a [P::Input],
    pub weight_uq_qr: &'a [P::QueryWeight],
    pub weight_uk: &'a [bf16],
    pub gamma_cq: &'a [bf16],
    pub gamma_ckv: &'a [bf16],
    pub rope_sin: &'a [bf16],
    pub rope_cos: &'a [bf16],
    pub scale_x: Option<&'a [f32]>,
    pub scale_w_dq: Option<&'a [f32]>,
    pub scale_w_uq_qr: Option<&'a [f32]>,
    pub scale_w_dkv_kr: Option<&'a [f32]>,
    pub quant_scale_ckv: Option<&'a [f32]>,
    pub quant_scale_ckr: Option<&'a [f32]>,
    pub smooth_cq: Option<&'a [f32]>,
}

impl<'a, P: QuantScheme> PrologBuffers<'a, P> {
    /// Checks element types and sizes against the plan.
    pub fn bind(plan: &PrologPlan, inputs: &'a PrologInputs) -> Result<Self, ExecutionError> {
        let shape = &plan.shape;
        let quant = P::MODE;
        let tokens = shape.tokens() as usize;
        let embed = shape.embed as usize;
        let cq = shape.cq as usize;
        let ckv = shape.ckv as usize;
        let rope = shape.rope as usize;
        let qc_qr = shape.qc_qr_width() as usize;
        let ckv_kr = shape.ckv_kr_width() as usize;
        let heads = shape.heads as usize;
        let head_dim = shape.head_dim as usize;

        let input_scales = quant.input_quantized();
        let cache_scales = quant.kv_quantized();

        Ok(Self {
            token_x: typed("token_x", &inputs.token_x, tokens * embed)?,
            weight_dq: typed("weight_dq", &inputs.weight_dq, embed * cq)?,
            weight_dkv_kr: typed("weight_dkv_kr", &inputs.weight_dkv_kr, embed * ckv_kr)?,
            weight_uq_qr: typed("weight_uq_qr", &inputs.weight_uq_qr, cq * qc_qr)?,
            weight_uk: typed("weight_uk", &inputs.weight_uk, heads * head_dim * ckv)?,
            gamma_cq: typed("rmsnorm_gamma_cq", &inputs.rmsnorm_gamma_cq, cq)?,
            gamma_ckv: typed("rmsnorm_gamma_ckv", &inputs.rmsnorm_gamma_ckv, ckv)?,
            rope_sin: typed("rope_sin", &inputs.rope_sin, tokens * rope)?,
            rope_cos: typed("rope_cos", &inputs.rope_cos, tokens * rope)?,
            scale_x: scales("dequant_scale_x", &inputs.dequant_scale_x, input_scales, &[tokens])?,
            scale_w_dq: scales("dequant_scale_w_dq", &inputs.dequant_scale_w_dq, input_scales, &[cq])?,
            scale_w_uq_qr: scales(
                "dequant_scale_w_uq_qr",
                &inputs.dequant_scale_w_uq_qr,
                quant.query_weight_quantized(),
                &[qc_qr],
            )?,
            scale_w_dkv_kr: scales(
                "dequant_scale_w_dkv_kr",
                &inputs.dequant_scale_w_dkv_kr,
                input_scales,
                &[ckv_kr],
            )?,
            quant_scale_ckv: scales("quant_scale_ckv", &inputs.quant_scale_ckv, cache_scales, &[1, ckv])?,
            quant_scale_ckr: scales("quant_scale_ckr", &inputs.quant_scale_ckr, cache_scales, &[1, rope])?,
            smooth_cq: match quant.query_weight_quantized() {
                true => optional("smooth_scales_cq", &inputs.smooth_scales_cq, &[cq])?,
                false => None,
            },
        })
    }
}

fn typed<'a, E: TensorElement>(
    name: &'static str,
    tensor: &'a Tensor,
    len: usize,
) -> Result<&'a [E], ExecutionError> {
    let values = tensor
        .as_slice::<E>()
        .ok_or_else(|| buffer_mismatch(name, format!("must be {}, got {}", E::ELEM, tensor.elem())))?;

    if values.len() != len {
        return Err(buffer_mismatch(
            name,
            format!("has {} elements, expected {len}", values.len()),
        ));
    }

    Ok(values)
}

fn optional<'a>(
    name: &'static str,
    tensor: &'a Option<Tensor>,
    lens: &[usize],
) -> Result<Option<&'a [f32]>, ExecutionError> {
    let Some(tensor) = tensor else {
        return Ok(None);
    };
    let values = tensor
        .as_slice::<f32>()
        .ok_or_else(|| buffer_mismatch(name, format!("must be f32, got {}", tensor.elem())))?;

    match lens.contains(&values.len()) {
        true => Ok(Some(values)),
        false => Err(buffer_mismatch(
            name,
            format!("has {} elements, expected one of {lens:?}", values.len()),
        )),
    }
}

fn scales<'a>(
    name: &'static str,
    tensor: &'a Option<Tensor>,
    used: bool,
    lens: &[usize],
) -> Result<Option<&'a [f32]>, ExecutionError> {
    if !used {
        return Ok(None);
    }

    match optional(name, tensor, lens)? {
        Some(values) => Ok(Some(values)),
        None => Err(buffer_mismatch(name, "is required by the quantization mode".into())),
    }
}

/// Scale of `channel` from a per tensor or per channel scale vector.
pub fn channel_scale(scales: Option<&[f32]>, channel: usize) -> f32 {
    match scales {
        Some([single]) => *single,
        Some(scales) => scales[channel],
        None => 1.0,
    }
}

/// Everything a stage reads or writes, shared by every engine of a run.
pub struct StageContext<'a, P: QuantScheme> {
    pub plan: &'a PrologPlan,
    pub buffers: PrologBuffers<'a, P>,
    pub caches: &'a PagedCaches,
    pub outputs: &'a PrologOutputs,
    pub slots: CacheSlots,
    pub counters: &'a DispatchCounters,
    arena: &'a Arena,
    _scheme: PhantomData<P>,
}

impl<'a, P: QuantScheme> StageContext<'a, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: &'a PrologPlan,
        buffers: PrologBuffers<'a, P>,
        caches: &'a PagedCaches,
        outputs: &'a PrologOutputs,
        slots: CacheSlots,
        arena: &'a Arena,
        counters: &'a DispatchCounters,
    ) -> Self {
        Self {
            plan,
            buffers,
            caches,
            outputs,
            slots,
            counters,
            arena,
            _scheme: PhantomData,
        }
    }

    /// Whether per token scales go through the workspace.
    pub fn stages_scales(&self) -> bool {
        self.plan
            .layout
            .region(RegionKind::DequantScaleStaging)
            .is_some()
    }

    fn region(&self, kind: RegionKind) -> Result<(&'a WorkspaceRegion, RegionId), ExecutionError> {
        let layout = &self.plan.layout;
        let missing = || buffer_mismatch("workspace", format!("has no {} region", kind.name()));
        let region = layout.storage(kind).ok_or_else(missing)?;
        let index = layout
            .regions()
            .iter()
            .position(|candidate| candidate.kind == region.kind)
            .ok_or_else(missing)?;

        Ok((region, self.arena.region(index)?))
    }

    fn view<T: Element>(
        &self,
        kind: RegionKind,
        slot: u32,
        rows: Range<u32>,
    ) -> Result<(ArenaView<T>, usize), ExecutionError> {
        let (region, id) = self.region(kind)?;
        if T::ELEM != region.elem {
            return Err(buffer_mismatch(
                "workspace",
                format!("{} holds {}, accessed as {}", kind.name(), region.elem, T::ELEM),
            ));
        }

        let width = region.width as usize;
        let offset = slot as usize * region.slot_len() + rows.start as usize * width;
        let view = self.arena.view::<T>(id, offset, rows.len() * width)?;

        Ok((view, width))
    }

    /// Full width rows of the workspace tile of `slot`.
    pub fn load_rows<T: Element>(
        &self,
        kind: RegionKind,
        slot: u32,
        rows: Range<u32>,
    ) -> Result<Vec<T>, ExecutionError> {
        let (view, _) = self.view::<T>(kind, slot, rows)?;
        Ok(self.arena.to_vec(&view)?)
    }

    /// Overwrites full width rows.
    pub fn store_rows<T: Element>(
        &self,
        kind: RegionKind,
        slot: u32,
        rows: Range<u32>,
        values: &[T],
    ) -> Result<(), ExecutionError> {
        let (view, _) = self.view::<T>(kind, slot, rows)?;
        Ok(self.arena.store(&view, values)?)
    }

    /// Overwrites the `columns` of `rows`, `values` being row-major `[rows, columns]`.
    pub fn store_block<T: Element>(
        &self,
        kind: RegionKind,
        slot: u32,
        rows: Range<u32>,
        columns: Range<usize>,
        values: &[T],
    ) -> Result<(), ExecutionError> {
        let count = rows.len();
        let (view, width) = self.view::<T>(kind, slot, rows)?;
        let span = columns.len();

        if columns.end > width || values.len() != count * span {
            return Err(buffer_mismatch(
                "workspace",
                format!("{} block {columns:?} of {count} rows doesn't fit width {width}", kind.name()),
            ));
        }

        self.arena.write(&view, |items| {
            for (row, chunk) in values.chunks_exact(span.max(1)).enumerate() {
                let start = row * width + columns.start;
                items[start..start + span].copy_from_slice(chunk);
            }
        })?;

        Ok(())
    }
}
