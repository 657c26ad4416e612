use bytemuck::Pod;
use core::fmt::Debug;
use half::bf16;
use mla_prolog_runtime::topology::DMA_BLOCK_BYTES;
use serde::{Deserialize, Serialize};

/// Element types appearing in the prolog tensors and in the workspace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum ElemType {
    #[display("bf16")]
    BF16,
    #[display("int8")]
    I8,
    #[display("int32")]
    I32,
    #[display("f32")]
    F32,
    #[display("int64")]
    I64,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> u32 {
        match self {
            ElemType::BF16 => 2,
            ElemType::I8 => 1,
            ElemType::I32 | ElemType::F32 => 4,
            ElemType::I64 => 8,
        }
    }

    /// Number of elements in one DMA block, the column alignment of engine slices.
    pub const fn dma_align(&self) -> u32 {
        DMA_BLOCK_BYTES / self.size()
    }
}

/// A scalar that can live in a tensor or in the workspace.
///
/// Conversions go through `f32`, the precision every vector stage computes in. Integer
/// targets round half away from zero and saturate.
pub trait Element: Pod + Debug + PartialEq + Send + Sync + 'static {
    /// Runtime tag of the type.
    const ELEM: ElemType;

    /// Widens to `f32`.
    fn to_f32(self) -> f32;

    /// Narrows from `f32`.
    fn from_f32(value: f32) -> Self;
}

impl Element for bf16 {
    const ELEM: ElemType = ElemType::BF16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

impl Element for i8 {
    const ELEM: ElemType = ElemType::I8;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
}

impl Element for i32 {
    const ELEM: ElemType = ElemType::I32;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round() as i32
    }
}

impl Element for f32 {
    const ELEM: ElemType = ElemType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for i64 {
    const ELEM: ElemType = ElemType::I64;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round() as i64
    }
}
