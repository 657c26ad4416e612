use mla_prolog_runtime::Topology;
use serde::{Deserialize, Serialize};

use crate::components::{ElemType, PrologDtypes, PrologProblem, PrologSetupError};

/// Tokens per wave, at most.
pub const MAX_STEP: u32 = 128;

/// Profile of the grouped compute specialization.
pub mod grouped {
    /// Token count of the profile.
    pub const TOKENS: u32 = 1;
    /// Key/value head count of the profile.
    pub const KV_HEADS: u32 = 1;
    /// Minimum vector engines.
    pub const MIN_VECTOR_ENGINES: u32 = 32;
    /// Minimum matrix engines.
    pub const MIN_MATRIX_ENGINES: u32 = 16;
    /// Matrix engines sharing one column group.
    pub const ENGINES_PER_GROUP: u32 = 8;
}

/// Head count from which the dequantize pipeline is split by head.
pub const DEQUANT_OPT_MIN_HEADS: u32 = 8;

/// Which tensors are quantized to int8.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum QuantMode {
    /// Everything in bf16.
    NoQuant,
    /// Only the query projection is int8.
    PartialQuantKvNoQuant,
    /// The query projection and the caches are int8.
    PartialQuantKvQuant,
    /// Tokens and the down projections are int8.
    FullQuantKvNoQuant,
    /// Tokens, the down projections and the caches are int8.
    FullQuantKvQuant,
}

impl QuantMode {
    /// Derives the mode from the input dtypes and checks the combination is supported.
    pub fn classify(dtypes: &PrologDtypes) -> Result<Self, PrologSetupError> {
        let kv_quant = dtypes.kv_cache == ElemType::I8;
        let mode = if dtypes.token == ElemType::I8 {
            match kv_quant {
                true => QuantMode::FullQuantKvQuant,
                false => QuantMode::FullQuantKvNoQuant,
            }
        } else if dtypes.weight_uq_qr == ElemType::I8 {
            match kv_quant {
                true => QuantMode::PartialQuantKvQuant,
                false => QuantMode::PartialQuantKvNoQuant,
            }
        } else {
            QuantMode::NoQuant
        };

        // Each mode admits exactly one combination, caches included.
        if PrologDtypes::for_mode(mode) == *dtypes {
            Ok(mode)
        } else {
            Err(PrologSetupError::UnsupportedDtypes(*dtypes))
        }
    }

    /// Position of the mode in the selector, `None` when unquantized.
    pub fn tag(&self) -> Option<u64> {
        match self {
            QuantMode::NoQuant => None,
            QuantMode::PartialQuantKvNoQuant => Some(0),
            QuantMode::PartialQuantKvQuant => Some(1),
            QuantMode::FullQuantKvNoQuant => Some(2),
            QuantMode::FullQuantKvQuant => Some(3),
        }
    }

    /// Inverse of [QuantMode::tag].
    pub fn from_tag(tag: Option<u64>) -> Option<Self> {
        match tag {
            None => Some(QuantMode::NoQuant),
            Some(0) => Some(QuantMode::PartialQuantKvNoQuant),
            Some(1) => Some(QuantMode::PartialQuantKvQuant),
            Some(2) => Some(QuantMode::FullQuantKvNoQuant),
            Some(3) => Some(QuantMode::FullQuantKvQuant),
            Some(_) => None,
        }
    }

    /// Whether the query projection weight is int8.
    pub fn query_weight_quantized(&self) -> bool {
        !matches!(self, QuantMode::NoQuant)
    }

    /// Whether tokens and the down projections are int8.
    pub fn input_quantized(&self) -> bool {
        matches!(
            self,
            QuantMode::FullQuantKvNoQuant | QuantMode::FullQuantKvQuant
        )
    }

    /// Whether the caches are int8.
    pub fn kv_quantized(&self) -> bool {
        matches!(
            self,
            QuantMode::PartialQuantKvQuant | QuantMode::FullQuantKvQuant
        )
    }

    /// Whether the query content output is requantized to int8.
    pub fn query_quantized(&self) -> bool {
        matches!(self, QuantMode::FullQuantKvQuant)
    }

    /// Whether the mode belongs to the partial family.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            QuantMode::PartialQuantKvNoQuant | QuantMode::PartialQuantKvQuant
        )
    }
}

/// Physical layout of the paged caches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum CacheLayout {
    /// Row per slot, slot taken from the cache index.
    #[display("PA_BSND")]
    PaBsnd,
    /// Fractal blocks, slot taken from the cache index.
    #[display("PA_NZ")]
    PaNz,
    /// Row per slot, slot resolved through a block table.
    #[display("PA_BLK_BSND")]
    PaBlkBsnd,
    /// Fractal blocks, slot resolved through a block table.
    #[display("PA_BLK_NZ")]
    PaBlkNz,
}

impl CacheLayout {
    const NAMED: [CacheLayout; 3] = [CacheLayout::PaBsnd, CacheLayout::PaNz, CacheLayout::PaBlkBsnd];

    /// Case sensitive prefix match against the recognized names.
    ///
    /// Anything else maps to [CacheLayout::PaBlkNz], see [CacheLayout::is_recognized].
    pub fn parse(name: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find(|layout| name.starts_with(layout.name()))
            .unwrap_or(CacheLayout::PaBlkNz)
    }

    /// Whether `name` selects a layout by prefix rather than through the fallback.
    pub fn is_recognized(name: &str) -> bool {
        Self::NAMED
            .iter()
            .chain([CacheLayout::PaBlkNz].iter())
            .any(|layout| name.starts_with(layout.name()))
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            CacheLayout::PaBsnd => "PA_BSND",
            CacheLayout::PaNz => "PA_NZ",
            CacheLayout::PaBlkBsnd => "PA_BLK_BSND",
            CacheLayout::PaBlkNz => "PA_BLK_NZ",
        }
    }

    /// Selector digit.
    pub fn tag(&self) -> u64 {
        match self {
            CacheLayout::PaBsnd => 1,
            CacheLayout::PaNz => 2,
            CacheLayout::PaBlkBsnd => 3,
            CacheLayout::PaBlkNz => 4,
        }
    }

    /// Inverse of [CacheLayout::tag].
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(CacheLayout::PaBsnd),
            2 => Some(CacheLayout::PaNz),
            3 => Some(CacheLayout::PaBlkBsnd),
            4 => Some(CacheLayout::PaBlkNz),
            _ => None,
        }
    }

    /// Whether slots are resolved through a block table.
    pub fn is_block_table(&self) -> bool {
        matches!(self, CacheLayout::PaBlkBsnd | CacheLayout::PaBlkNz)
    }

    /// Whether blocks are stored in the fractal layout.
    pub fn is_nz(&self) -> bool {
        matches!(self, CacheLayout::PaNz | CacheLayout::PaBlkNz)
    }
}

/// Degenerate inputs the pipeline handles without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmptyMode {
    /// Nothing is empty.
    NonEmpty,
    /// The caches have no block; queries are still produced.
    EmptyCache,
    /// There is no token; nothing runs.
    EmptyQuery,
}

impl EmptyMode {
    /// Selector digit.
    pub fn tag(&self) -> u64 {
        match self {
            EmptyMode::NonEmpty => 0,
            EmptyMode::EmptyCache => 1,
            EmptyMode::EmptyQuery => 2,
        }
    }

    /// Inverse of [EmptyMode::tag].
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(EmptyMode::NonEmpty),
            1 => Some(EmptyMode::EmptyCache),
            2 => Some(EmptyMode::EmptyQuery),
            _ => None,
        }
    }
}

/// Whether per request lengths locate tokens in the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActualSeqMode {
    /// Requests have a fixed length.
    Disabled,
    /// Fused tokens are split into requests by cumulative lengths.
    EnQLen,
}

/// How the token batch is spread over matrix engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Every engine computes a column slice for every token.
    ByColumn,
    /// Every engine computes the full width for a token range.
    ByToken,
}

/// The independent scenario tags of one invocation.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioClassification {
    pub quant: QuantMode,
    pub cache: CacheLayout,
    pub empty: EmptyMode,
    pub actual_len: ActualSeqMode,
    pub split: SplitStrategy,
    /// Grouped compute for single token decoding on wide platforms.
    pub group_compute: bool,
    /// Head aligned query projection slices so dequantization pipelines with it.
    pub dequant_opt: bool,
}

impl ScenarioClassification {
    /// Classifies a problem on the given platform.
    pub fn classify(
        problem: &PrologProblem,
        topology: Topology,
    ) -> Result<Self, PrologSetupError> {
        topology.validate()?;

        let shape = &problem.shape;
        let quant = QuantMode::classify(&problem.dtypes)?;

        let name = problem.attributes.cache_mode.as_str();
        let cache = CacheLayout::parse(name);
        if !CacheLayout::is_recognized(name) {
            log::warn!("Unrecognized cache mode {name:?}, falling back to {cache}");
        }

        let actual_len = match cache.is_block_table() && shape.is_fused() {
            true => ActualSeqMode::EnQLen,
            false => ActualSeqMode::Disabled,
        };

        let tokens = shape.tokens();
        let empty = if tokens == 0 {
            EmptyMode::EmptyQuery
        } else if shape.cache_blocks == 0 {
            EmptyMode::EmptyCache
        } else {
            EmptyMode::NonEmpty
        };

        let split = match tokens >= topology.matrix_engines * MAX_STEP {
            true => SplitStrategy::ByToken,
            false => SplitStrategy::ByColumn,
        };

        let group_compute = quant.is_partial()
            && tokens == grouped::TOKENS
            && shape.kv_heads == grouped::KV_HEADS
            && topology.vector_engines >= grouped::MIN_VECTOR_ENGINES
            && topology.matrix_engines >= grouped::MIN_MATRIX_ENGINES;
        let dequant_opt = !group_compute
            && quant.query_weight_quantized()
            && shape.heads >= DEQUANT_OPT_MIN_HEADS;

        Ok(Self {
            quant,
            cache,
            empty,
            actual_len,
            split,
            group_compute,
            dequant_opt,
        })
    }

    /// Engine counts the plan runs with. Grouped compute pins them to its profile.
    pub fn effective_topology(&self, topology: Topology) -> Topology {
        match self.group_compute {
            true => Topology::new(
                grouped::MIN_MATRIX_ENGINES,
                grouped::MIN_VECTOR_ENGINES,
            ),
            false => topology,
        }
    }

    /// Whether query dequantization scales go through the workspace.
    pub fn stages_dequant_scales(&self) -> bool {
        self.group_compute || self.dequant_opt
    }
}
