use alloc::{format, string::String};
use serde::{Deserialize, Serialize};

use crate::components::{
    CacheLayout, ElemType, PrologSetupError, QuantMode, ShapeDescriptor, shape::invalid_shape,
};

/// Element types of the inputs that decide the quantization mode.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrologDtypes {
    /// Token embeddings.
    pub token: ElemType,
    /// Compressed query projection.
    pub weight_dq: ElemType,
    /// Query content and rope projection.
    pub weight_uq_qr: ElemType,
    /// Compressed key/value and rope projection.
    pub weight_dkv_kr: ElemType,
    /// Per head key absorption weight.
    pub weight_uk: ElemType,
    /// Key/value cache.
    pub kv_cache: ElemType,
    /// Key rope cache.
    pub kr_cache: ElemType,
}

impl PrologDtypes {
    /// Unquantized bf16 everywhere.
    pub fn bf16() -> Self {
        Self::uniform(ElemType::BF16)
    }

    fn uniform(elem: ElemType) -> Self {
        Self::new(elem, elem, elem, elem, elem, elem, elem)
    }

    /// Dtypes of a quantization mode.
    pub fn for_mode(mode: QuantMode) -> Self {
        let cache = match mode.kv_quantized() {
            true => ElemType::I8,
            false => ElemType::BF16,
        };
        let (token, weight_uq_qr) = match mode {
            QuantMode::NoQuant => (ElemType::BF16, ElemType::BF16),
            QuantMode::PartialQuantKvNoQuant | QuantMode::PartialQuantKvQuant => {
                (ElemType::BF16, ElemType::I8)
            }
            QuantMode::FullQuantKvNoQuant | QuantMode::FullQuantKvQuant => {
                (ElemType::I8, ElemType::I8)
            }
        };

        Self::new(
            token,
            token,
            weight_uq_qr,
            token,
            ElemType::BF16,
            cache,
            cache,
        )
    }
}

/// Scalar attributes of the operator.
#[derive(new, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrologAttributes {
    /// Requested cache layout name.
    pub cache_mode: String,
    /// RMS norm epsilon of the compressed query.
    pub epsilon_cq: f32,
    /// RMS norm epsilon of the compressed key/value.
    pub epsilon_ckv: f32,
    /// Whether the normalized compressed query is emitted.
    pub query_norm: bool,
}

impl Default for PrologAttributes {
    fn default() -> Self {
        Self {
            cache_mode: String::from("PA_BSND"),
            epsilon_cq: 1e-5,
            epsilon_ckv: 1e-5,
            query_norm: false,
        }
    }
}

/// Which optional inputs are provided.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPresence {
    pub dequant_scale_x: bool,
    pub dequant_scale_w_dq: bool,
    pub dequant_scale_w_uq_qr: bool,
    pub dequant_scale_w_dkv_kr: bool,
    pub quant_scale_ckv: bool,
    pub quant_scale_ckr: bool,
    pub smooth_scales_cq: bool,
    pub actual_seq_len: bool,
}

/// Everything the planner knows about one invocation.
#[derive(new, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrologProblem {
    /// Logical sizes.
    pub shape: ShapeDescriptor,
    /// Input element types.
    pub dtypes: PrologDtypes,
    /// Operator attributes.
    pub attributes: PrologAttributes,
    /// Optional inputs that are present.
    pub presence: InputPresence,
}

impl PrologProblem {
    /// Rejects problems the pipeline can't run.
    pub fn validate(&self) -> Result<(), PrologSetupError> {
        self.shape.validate()?;
        if self.dtypes.weight_uk != ElemType::BF16 {
            return Err(PrologSetupError::UnsupportedMatmulOutput {
                matmul: "matmul_qn",
                input: self.dtypes.weight_uk,
            });
        }
        let mode = QuantMode::classify(&self.dtypes)?;
        self.check_required_inputs(mode)?;
        self.check_cache_alignment()?;

        Ok(())
    }

    fn check_required_inputs(&self, mode: QuantMode) -> Result<(), PrologSetupError> {
        let presence = &self.presence;
        let mut required = alloc::vec::Vec::new();

        if mode.query_weight_quantized() {
            required.push(("dequant_scale_w_uq_qr", presence.dequant_scale_w_uq_qr));
        }
        if mode.input_quantized() {
            required.push(("dequant_scale_x", presence.dequant_scale_x));
            required.push(("dequant_scale_w_dq", presence.dequant_scale_w_dq));
            required.push(("dequant_scale_w_dkv_kr", presence.dequant_scale_w_dkv_kr));
        }
        if mode.kv_quantized() {
            required.push(("quant_scale_ckv", presence.quant_scale_ckv));
            required.push(("quant_scale_ckr", presence.quant_scale_ckr));
        }
        if CacheLayout::parse(&self.attributes.cache_mode).is_block_table()
            && self.shape.is_fused()
        {
            required.push(("actual_seq_len", presence.actual_seq_len));
        }

        match required.into_iter().find(|(_, present)| !present) {
            Some((name, _)) => Err(PrologSetupError::MissingInput(name)),
            None => Ok(()),
        }
    }

    fn check_cache_alignment(&self) -> Result<(), PrologSetupError> {
        let layout = CacheLayout::parse(&self.attributes.cache_mode);
        if !layout.is_nz() {
            return Ok(());
        }

        let c0 = self.dtypes.kv_cache.dma_align();
        for (name, width) in [("ckv", self.shape.ckv), ("rope", self.shape.rope)] {
            if width % c0 != 0 {
                return Err(invalid_shape(format!(
                    "{layout} caches need {name} = {width} to be a multiple of {c0}"
                )));
            }
        }

        Ok(())
    }
}
