use alloc::{format, string::String, vec, vec::Vec};
use std::sync::{Mutex, MutexGuard};

use crate::components::{
    ElemType, ExecutionError, FormattedConfigError, InputPresence, PrologAttributes,
    PrologDtypes, PrologProblem, PrologSetupError, ShapeDescriptor, TokenLayout,
};
use crate::pipeline::Tensor;
use crate::tiling::{PrologPlan, RegionKind, region_elem};

/// Inputs of one prolog invocation.
///
/// Shapes are row-major:
/// - `token_x`: `[T, He]` or `[B, S1, He]`
/// - `weight_dq`: `[He, Hcq]`, `weight_uq_qr`: `[Hcq, N * (D + Dr)]`
/// - `weight_uk`: `[N, D, Hckv]`, `weight_dkv_kr`: `[He, Hckv + Dr]`
/// - `rope_sin`, `rope_cos`: `[T, Dr]`
/// - `cache_index`: `[T]`, or the `[B, max_blocks]` block table of the BLK layouts
#[derive(Debug, Clone)]
pub struct PrologInputs {
    pub token_x: Tensor,
    pub weight_dq: Tensor,
    pub weight_uq_qr: Tensor,
    pub weight_uk: Tensor,
    pub weight_dkv_kr: Tensor,
    pub rmsnorm_gamma_cq: Tensor,
    pub rmsnorm_gamma_ckv: Tensor,
    pub rope_sin: Tensor,
    pub rope_cos: Tensor,
    pub cache_index: Tensor,
    /// Per token, `[T]`.
    pub dequant_scale_x: Option<Tensor>,
    /// Per channel, `[Hcq]`.
    pub dequant_scale_w_dq: Option<Tensor>,
    /// Per channel, `[N * (D + Dr)]`.
    pub dequant_scale_w_uq_qr: Option<Tensor>,
    /// Per channel, `[Hckv + Dr]`.
    pub dequant_scale_w_dkv_kr: Option<Tensor>,
    /// Per tensor `[1]` or per channel `[Hckv]`.
    pub quant_scale_ckv: Option<Tensor>,
    /// Per tensor `[1]` or per channel `[Dr]`.
    pub quant_scale_ckr: Option<Tensor>,
    /// Per channel, `[Hcq]`.
    pub smooth_scales_cq: Option<Tensor>,
    /// Cumulative token counts of the requests, `[B]`.
    pub actual_seq_len: Option<Tensor>,
}

impl PrologInputs {
    /// Which optional inputs are present.
    pub fn presence(&self) -> InputPresence {
        InputPresence {
            dequant_scale_x: self.dequant_scale_x.is_some(),
            dequant_scale_w_dq: self.dequant_scale_w_dq.is_some(),
            dequant_scale_w_uq_qr: self.dequant_scale_w_uq_qr.is_some(),
            dequant_scale_w_dkv_kr: self.dequant_scale_w_dkv_kr.is_some(),
            quant_scale_ckv: self.quant_scale_ckv.is_some(),
            quant_scale_ckr: self.quant_scale_ckr.is_some(),
            smooth_scales_cq: self.smooth_scales_cq.is_some(),
            actual_seq_len: self.actual_seq_len.is_some(),
        }
    }

    /// Input dtypes together with the caches'.
    pub fn dtypes(&self, caches: &PagedCaches) -> PrologDtypes {
        PrologDtypes::new(
            self.token_x.elem(),
            self.weight_dq.elem(),
            self.weight_uq_qr.elem(),
            self.weight_dkv_kr.elem(),
            self.weight_uk.elem(),
            caches.kv_elem,
            caches.kr_elem,
        )
    }

    /// Infers the problem from the tensor shapes.
    pub fn problem(
        &self,
        caches: &PagedCaches,
        attributes: PrologAttributes,
    ) -> Result<PrologProblem, PrologSetupError> {
        let layout = match self.token_x.shape.as_slice() {
            [tokens, _] => TokenLayout::Fused {
                tokens: *tokens as u32,
            },
            [batch, seq, _] => TokenLayout::Batched {
                batch: *batch as u32,
                seq: *seq as u32,
            },
            shape => return Err(rank_error("token_x", shape, "2 or 3")),
        };
        let embed = last_dim(&self.token_x);
        let cq = match self.weight_dq.shape.as_slice() {
            [_, cq] => *cq as u32,
            shape => return Err(rank_error("weight_dq", shape, "2")),
        };
        let (heads, head_dim, ckv) = match self.weight_uk.shape.as_slice() {
            [heads, head_dim, ckv] => (*heads as u32, *head_dim as u32, *ckv as u32),
            shape => return Err(rank_error("weight_uk", shape, "3")),
        };
        let rope = last_dim(&self.rope_sin);

        let shape = ShapeDescriptor::new(
            layout,
            embed,
            cq,
            ckv,
            rope,
            heads,
            head_dim,
            caches.kv_heads,
            caches.blocks,
            caches.block_size,
        );

        Ok(PrologProblem::new(
            shape,
            self.dtypes(caches),
            attributes,
            self.presence(),
        ))
    }
}

fn last_dim(tensor: &Tensor) -> u32 {
    tensor.shape.last().copied().unwrap_or(0) as u32
}

fn rank_error(name: &'static str, shape: &[usize], expected: &'static str) -> PrologSetupError {
    let shape = shape.to_vec();
    PrologSetupError::InvalidShape(FormattedConfigError::new(move || {
        format!("{name} has shape {shape:?}, expected rank {expected}")
    }))
}

/// Key/value and key rope caches, `[blocks, block_size, kv_heads, H]`, updated in place.
#[derive(Debug)]
pub struct PagedCaches {
    kv: Mutex<Tensor>,
    kr: Mutex<Tensor>,
    kv_elem: ElemType,
    kr_elem: ElemType,
    blocks: u32,
    block_size: u32,
    kv_heads: u32,
}

impl PagedCaches {
    /// Wraps both caches. Their leading dims must agree.
    pub fn new(kv_cache: Tensor, kr_cache: Tensor) -> Self {
        let dim = |index: usize| kv_cache.shape.get(index).copied().unwrap_or(0) as u32;

        Self {
            kv_elem: kv_cache.elem(),
            kr_elem: kr_cache.elem(),
            blocks: dim(0),
            block_size: dim(1),
            kv_heads: dim(2),
            kv: Mutex::new(kv_cache),
            kr: Mutex::new(kr_cache),
        }
    }

    /// Locks the key/value cache.
    pub fn kv_cache(&self) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
        self.kv.lock().map_err(|_| ExecutionError::EnginePanicked(None))
    }

    /// Locks the key rope cache.
    pub fn kr_cache(&self) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
        self.kr.lock().map_err(|_| ExecutionError::EnginePanicked(None))
    }

    /// Returns `(kv_cache, kr_cache)`.
    pub fn into_parts(self) -> Result<(Tensor, Tensor), ExecutionError> {
        let kv = self
            .kv
            .into_inner()
            .map_err(|_| ExecutionError::EnginePanicked(None))?;
        let kr = self
            .kr
            .into_inner()
            .map_err(|_| ExecutionError::EnginePanicked(None))?;

        Ok((kv, kr))
    }
}

/// Output buffers, written concurrently at disjoint offsets.
#[derive(Debug)]
pub struct PrologOutputs {
    query: Mutex<Tensor>,
    query_rope: Mutex<Tensor>,
    dequant_scale_q_nope: Mutex<Tensor>,
    query_norm: Option<Mutex<Tensor>>,
    dequant_scale_q_norm: Option<Mutex<Tensor>>,
}

/// Output tensors handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensors {
    /// `[T, N, Hckv]`, int8 under full quantization with quantized caches, else bf16.
    pub query: Tensor,
    /// `[T, N, Dr]`, bf16.
    pub query_rope: Tensor,
    /// `[T, N]`, f32. Zero unless the query content is quantized.
    pub dequant_scale_q_nope: Tensor,
    /// `[T, Hcq]`, when requested.
    pub query_norm: Option<Tensor>,
    /// `[T]`, when the normalized query is requested and quantized.
    pub dequant_scale_q_norm: Option<Tensor>,
}

impl PrologOutputs {
    /// Zero filled outputs matching a plan.
    pub fn allocate(plan: &PrologPlan) -> Self {
        let shape = &plan.shape;
        let quant = plan.scenario.quant;
        let tokens = shape.tokens() as usize;
        let heads = shape.heads as usize;

        let query_elem = match quant.query_quantized() {
            true => ElemType::I8,
            false => ElemType::BF16,
        };
        let norm_elem = region_elem(RegionKind::NormalizedCq, quant);
        let query_norm = plan.tiling.query_norm;

        Self {
            query: Mutex::new(Tensor::zeros(
                query_elem,
                vec![tokens, heads, shape.ckv as usize],
            )),
            query_rope: Mutex::new(Tensor::zeros(
                ElemType::BF16,
                vec![tokens, heads, shape.rope as usize],
            )),
            dequant_scale_q_nope: Mutex::new(Tensor::zeros(ElemType::F32, vec![tokens, heads])),
            query_norm: query_norm
                .then(|| Mutex::new(Tensor::zeros(norm_elem, vec![tokens, shape.cq as usize]))),
            dequant_scale_q_norm: (query_norm && norm_elem == ElemType::I8)
                .then(|| Mutex::new(Tensor::zeros(ElemType::F32, vec![tokens]))),
        }
    }

    /// Locks the query content output.
    pub fn query(&self) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
        lock(&self.query)
    }

    /// Locks the query rope output.
    pub fn query_rope(&self) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
        lock(&self.query_rope)
    }

    /// Locks the query content scales.
    pub fn dequant_scale_q_nope(&self) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
        lock(&self.dequant_scale_q_nope)
    }

    /// Locks the normalized query, if requested.
    pub fn query_norm(&self) -> Option<Result<MutexGuard<'_, Tensor>, ExecutionError>> {
        self.query_norm.as_ref().map(lock)
    }

    /// Locks the normalized query scales, if present.
    pub fn dequant_scale_q_norm(&self) -> Option<Result<MutexGuard<'_, Tensor>, ExecutionError>> {
        self.dequant_scale_q_norm.as_ref().map(lock)
    }

    /// Releases the tensors.
    pub fn into_tensors(self) -> Result<OutputTensors, ExecutionError> {
        let take = |mutex: Mutex<Tensor>| {
            mutex
                .into_inner()
                .map_err(|_| ExecutionError::EnginePanicked(None))
        };

        Ok(OutputTensors {
            query: take(self.query)?,
            query_rope: take(self.query_rope)?,
            dequant_scale_q_nope: take(self.dequant_scale_q_nope)?,
            query_norm: self.query_norm.map(take).transpose()?,
            dequant_scale_q_norm: self.dequant_scale_q_norm.map(take).transpose()?,
        })
    }
}

fn lock(mutex: &Mutex<Tensor>) -> Result<MutexGuard<'_, Tensor>, ExecutionError> {
    mutex.lock().map_err(|_| ExecutionError::EnginePanicked(None))
}

/// Describes a shape mismatch on `buffer`.
pub(crate) fn buffer_mismatch(buffer: &'static str, reason: String) -> ExecutionError {
    ExecutionError::BufferMismatch { buffer, reason }
}
