use core::ops::Range;
use mla_prolog_runtime::BufferHierarchy;
use serde::{Deserialize, Serialize};

/// Column width given to each engine so that every slice starts on a multiple of `align`.
pub fn calc_single_core_n(n: u32, cores: u32, align: u32) -> u32 {
    n.div_ceil(align * cores) * align
}

/// Shape of the tiles a matrix engine streams through its buffers.
#[derive(new, Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseTile {
    /// Rows, at most one wave.
    pub m: u32,
    /// Output columns per accumulator tile.
    pub n: u32,
    /// Reduction depth per loaded tile.
    pub k: u32,
}

impl BaseTile {
    /// Largest tile whose operands fit one half of the compute-in buffers and whose
    /// accumulator fits one half of the compute-out buffer.
    pub fn fit(
        buffers: &BufferHierarchy,
        m: u32,
        single_n: u32,
        reduction: u32,
        elem_size: u32,
        acc_size: u32,
        align: u32,
    ) -> Self {
        let n = buffers.max_base_n(m, acc_size, align).min(single_n.max(1));
        let k = buffers
            .max_base_k(m, n, elem_size, align)
            .min(reduction.max(1));

        Self::new(m, n, k)
    }
}

/// Column partition of one matmul over the matrix engines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulPartition {
    /// Total output columns.
    pub width: u32,
    /// Columns per engine.
    pub single_n: u32,
    /// Engines given a slice.
    pub blocks: u32,
    /// Reduction depth.
    pub reduction: u32,
    /// Number of reduction tiles, `ceil(reduction / base.k)`.
    pub k_split: u32,
    /// Every engine covers the full width for its own tokens.
    pub replicated: bool,
    /// Streaming tile.
    pub base: BaseTile,
}

impl MatmulPartition {
    /// Splits `width` columns into `single_n` wide slices.
    pub fn columns_split(width: u32, single_n: u32, reduction: u32, base: BaseTile) -> Self {
        let single_n = single_n.max(1);

        Self {
            width,
            single_n,
            blocks: width.div_ceil(single_n),
            reduction,
            k_split: reduction.div_ceil(base.k.max(1)),
            replicated: false,
            base,
        }
    }

    /// Gives every one of `engines` engines the full width.
    pub fn replicated(width: u32, engines: u32, reduction: u32, base: BaseTile) -> Self {
        Self {
            width,
            single_n: width,
            blocks: engines,
            reduction,
            k_split: reduction.div_ceil(base.k.max(1)),
            replicated: true,
            base,
        }
    }

    /// Output columns computed by `engine`, possibly empty.
    pub fn columns(&self, engine: u32) -> Range<u32> {
        if engine >= self.blocks {
            return self.width..self.width;
        }
        if self.replicated {
            return 0..self.width;
        }

        let start = (engine * self.single_n).min(self.width);
        let end = (start + self.single_n).min(self.width);
        start..end
    }
}

/// Head partition of the per head matmul.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeadPartition {
    /// Total heads.
    pub heads: u32,
    /// Heads per engine.
    pub heads_per_engine: u32,
    /// Engines given heads.
    pub blocks: u32,
    /// Every engine covers every head for its own tokens.
    pub replicated: bool,
}

impl HeadPartition {
    /// Splits `heads` over at most `engines` engines.
    pub fn split(heads: u32, engines: u32) -> Self {
        let heads_per_engine = heads.div_ceil(engines.max(1)).max(1);

        Self {
            heads,
            heads_per_engine,
            blocks: heads.div_ceil(heads_per_engine),
            replicated: false,
        }
    }

    /// Gives every one of `engines` engines all heads.
    pub fn replicated(heads: u32, engines: u32) -> Self {
        Self {
            heads,
            heads_per_engine: heads,
            blocks: engines,
            replicated: true,
        }
    }

    /// Heads computed by `engine`, possibly empty.
    pub fn heads(&self, engine: u32) -> Range<u32> {
        if engine >= self.blocks {
            return self.heads..self.heads;
        }
        if self.replicated {
            return 0..self.heads;
        }

        let start = (engine * self.heads_per_engine).min(self.heads);
        let end = (start + self.heads_per_engine).min(self.heads);
        start..end
    }
}

/// Token ranges of the split-by-token strategy.
///
/// The first `m_sub_cores` engines get `m_sub` tokens each, the others `m_sub - 1`.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenSplit {
    /// Tokens of the larger ranges.
    pub m_sub: u32,
    /// Engines given the larger ranges.
    pub m_sub_cores: u32,
}

impl TokenSplit {
    /// Splits `tokens` over `engines` engines.
    pub fn compute(tokens: u32, engines: u32) -> Self {
        let engines = engines.max(1);
        let m_sub = tokens.div_ceil(engines);
        let m_sub_cores = tokens - m_sub.saturating_sub(1) * engines;

        Self::new(m_sub, m_sub_cores)
    }

    /// Contiguous tokens owned by `engine`.
    pub fn tokens(&self, engine: u32) -> Range<u32> {
        if engine < self.m_sub_cores {
            let start = engine * self.m_sub;
            start..start + self.m_sub
        } else {
            let short = self.m_sub.saturating_sub(1);
            let start = self.m_sub_cores * self.m_sub + (engine - self.m_sub_cores) * short;
            start..start + short
        }
    }
}
