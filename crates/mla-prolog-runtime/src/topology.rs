use core::fmt::Display;

/// Size in bytes of one DMA burst. Every engine slice is aligned to it.
pub const DMA_BLOCK_BYTES: u32 = 32;

/// Number of vector engines attached to one matrix engine.
pub const VECTOR_ENGINES_PER_MATRIX: u32 = 2;

/// Number of `f32` lanes in one DMA block.
pub const F32_BLOCK_LANES: usize = DMA_BLOCK_BYTES as usize / core::mem::size_of::<f32>();

/// Engine counts reported by the platform.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Topology {
    /// Number of matrix engines available to one launch.
    pub matrix_engines: u32,
    /// Number of vector engines available to one launch.
    pub vector_engines: u32,
}

/// The platform reported an engine topology that can't run the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// No matrix engine is available.
    NoMatrixEngine,
    /// No vector engine is available.
    NoVectorEngine,
}

impl Display for TopologyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TopologyError::NoMatrixEngine => write!(f, "the platform reports 0 matrix engines"),
            TopologyError::NoVectorEngine => write!(f, "the platform reports 0 vector engines"),
        }
    }
}

impl Topology {
    /// A topology honoring the fixed vector to matrix ratio.
    pub fn paired(matrix_engines: u32) -> Self {
        Self::new(matrix_engines, matrix_engines * VECTOR_ENGINES_PER_MATRIX)
    }

    /// Rejects topologies with an empty engine class.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.matrix_engines == 0 {
            return Err(TopologyError::NoMatrixEngine);
        }
        if self.vector_engines == 0 {
            return Err(TopologyError::NoVectorEngine);
        }
        Ok(())
    }

    /// The matrix engine a vector engine reads its per-wave results from.
    pub fn paired_matrix(vector_index: u32) -> u32 {
        vector_index / VECTOR_ENGINES_PER_MATRIX
    }

    /// Whether the vector engine processes the back half of its pair's wave.
    pub fn is_back_vector(vector_index: u32) -> bool {
        vector_index % VECTOR_ENGINES_PER_MATRIX == 1
    }
}

/// Capacities of the on-chip staging memories of one engine pair.
///
/// Matrix engines move tiles through stage-in, compute-in and compute-out buffers, each split
/// in two halves used alternately. Vector engines own a single local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BufferHierarchy {
    /// Stage-in buffer, filled from global memory.
    pub stage_in_bytes: u32,
    /// Compute-in buffer for the left operand.
    pub compute_in_lhs_bytes: u32,
    /// Compute-in buffer for the right operand.
    pub compute_in_rhs_bytes: u32,
    /// Compute-out (accumulator) buffer.
    pub compute_out_bytes: u32,
    /// Vector engine local buffer.
    pub vector_local_bytes: u32,
}

impl Default for BufferHierarchy {
    fn default() -> Self {
        Self {
            stage_in_bytes: 512 * 1024,
            compute_in_lhs_bytes: 64 * 1024,
            compute_in_rhs_bytes: 64 * 1024,
            compute_out_bytes: 128 * 1024,
            vector_local_bytes: 192 * 1024,
        }
    }
}

impl BufferHierarchy {
    /// Largest reduction tile, a multiple of `align`, for which one half of each compute-in
    /// buffer holds an `m x k` lhs tile and a `k x n` rhs tile of `elem_size` bytes.
    pub fn max_base_k(&self, m: u32, n: u32, elem_size: u32, align: u32) -> u32 {
        let half_lhs = self.compute_in_lhs_bytes / 2;
        let half_rhs = self.compute_in_rhs_bytes / 2;
        let by_lhs = half_lhs / (m.max(1) * elem_size);
        let by_rhs = half_rhs / (n.max(1) * elem_size);
        let k = by_lhs.min(by_rhs);

        (k / align * align).max(align)
    }

    /// Largest number of output columns whose `m`-row accumulator fits one compute-out half.
    pub fn max_base_n(&self, m: u32, acc_size: u32, align: u32) -> u32 {
        let half = self.compute_out_bytes / 2;
        let n = half / (m.max(1) * acc_size);

        (n / align * align).max(align)
    }
}
