use alloc::{format, string::String};
use serde::{Deserialize, Serialize};

use crate::components::{FormattedConfigError, PrologSetupError};

/// How the tokens of one invocation are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenLayout {
    /// Rank 3 input `[batch, seq, embed]`.
    Batched {
        /// Number of requests.
        batch: u32,
        /// Tokens per request.
        seq: u32,
    },
    /// Rank 2 input `[tokens, embed]` with batch and sequence already merged.
    Fused {
        /// Number of tokens.
        tokens: u32,
    },
}

/// Logical sizes of one prolog invocation.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    /// Token layout.
    pub layout: TokenLayout,
    /// Embedding width `He`.
    pub embed: u32,
    /// Compressed query width `Hcq`.
    pub cq: u32,
    /// Compressed key/value width `Hckv`.
    pub ckv: u32,
    /// Rope width `Dr`.
    pub rope: u32,
    /// Query head count `N`.
    pub heads: u32,
    /// Per head content dim `D`.
    pub head_dim: u32,
    /// Key/value head count.
    pub kv_heads: u32,
    /// Blocks in the paged caches.
    pub cache_blocks: u32,
    /// Tokens per cache block.
    pub block_size: u32,
}

impl ShapeDescriptor {
    /// Total number of tokens `T`.
    pub fn tokens(&self) -> u32 {
        match self.layout {
            TokenLayout::Batched { batch, seq } => batch * seq,
            TokenLayout::Fused { tokens } => tokens,
        }
    }

    /// Whether batch and sequence arrive merged.
    pub fn is_fused(&self) -> bool {
        matches!(self.layout, TokenLayout::Fused { .. })
    }

    /// Width of one head in the combined content and rope projection, `D + Dr`.
    pub fn head_width(&self) -> u32 {
        self.head_dim + self.rope
    }

    /// Output width of the content and rope projection, `N * (D + Dr)`.
    pub fn qc_qr_width(&self) -> u32 {
        self.heads * self.head_width()
    }

    /// Output width of the compressed key/value and rope projection, `Hckv + Dr`.
    pub fn ckv_kr_width(&self) -> u32 {
        self.ckv + self.rope
    }

    /// Number of slots in each paged cache.
    pub fn cache_slots(&self) -> u64 {
        self.cache_blocks as u64 * self.block_size as u64
    }

    /// Rejects dims that are degenerate beyond what the empty modes cover.
    ///
    /// A zero token count or zero cache blocks are valid here, they select the empty modes.
    pub fn validate(&self) -> Result<(), PrologSetupError> {
        let dims = [
            ("embed", self.embed),
            ("cq", self.cq),
            ("ckv", self.ckv),
            ("rope", self.rope),
            ("heads", self.heads),
            ("head_dim", self.head_dim),
        ];

        for (name, value) in dims {
            if value == 0 {
                return Err(invalid_shape(format!("{name} must be positive")));
            }
        }
        if self.kv_heads != 1 {
            return Err(invalid_shape(format!(
                "only one key/value head is supported, got {}",
                self.kv_heads
            )));
        }
        if self.rope % 2 != 0 {
            return Err(invalid_shape(format!(
                "rope width {} must be even",
                self.rope
            )));
        }
        if self.cache_blocks > 0 && self.block_size == 0 {
            return Err(invalid_shape(format!(
                "{} cache blocks of size 0",
                self.cache_blocks
            )));
        }

        Ok(())
    }
}

pub(crate) fn invalid_shape(message: String) -> PrologSetupError {
    PrologSetupError::InvalidShape(FormattedConfigError::new(move || message.clone()))
}
