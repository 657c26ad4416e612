use mla_prolog_runtime::{EngineKind, Flag};

/// Cross-engine dependencies of one wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineFlag {
    /// Compressed query projection written.
    MmCq,
    /// Compressed key/value and rope projection written.
    MmCkvKr,
    /// Normalized compressed query written.
    VecNormCq,
    /// Query content and rope projection written.
    MmQcQr,
    /// Dequantized query content written.
    VecDequantQc,
    /// Key absorbed query content written.
    MmQn,
    /// Every vector engine is done with the wave's workspace.
    WaveDrained,
}

impl Flag for PipelineFlag {
    fn name(&self) -> &'static str {
        match self {
            PipelineFlag::MmCq => "mm_cq",
            PipelineFlag::MmCkvKr => "mm_ckv_kr",
            PipelineFlag::VecNormCq => "vec_norm_cq",
            PipelineFlag::MmQcQr => "mm_qc_qr",
            PipelineFlag::VecDequantQc => "vec_dequant_qc",
            PipelineFlag::MmQn => "mm_qn",
            PipelineFlag::WaveDrained => "wave_drained",
        }
    }

    fn producer(&self) -> EngineKind {
        match self {
            PipelineFlag::MmCq
            | PipelineFlag::MmCkvKr
            | PipelineFlag::MmQcQr
            | PipelineFlag::MmQn => EngineKind::Matrix,
            PipelineFlag::VecNormCq | PipelineFlag::VecDequantQc | PipelineFlag::WaveDrained => {
                EngineKind::Vector
            }
        }
    }
}
