use core::fmt::Debug;
use half::bf16;

use crate::components::{Element, QuantMode};
use crate::pipeline::TensorElement;

/// Operand type of a matmul, with its accumulator and stored result.
pub trait MatmulInput: TensorElement {
    /// Accumulator.
    type Acc: Copy + Default + Debug + Send + Sync;
    /// Result stored in the workspace.
    type Out: TensorElement;

    /// `acc + lhs * rhs`.
    fn mul_add(acc: Self::Acc, lhs: Self, rhs: Self) -> Self::Acc;

    /// Converts a finished accumulator to the stored result.
    fn narrow(acc: Self::Acc) -> Self::Out;
}

impl MatmulInput for bf16 {
    type Acc = f32;
    type Out = bf16;

    fn mul_add(acc: f32, lhs: Self, rhs: Self) -> f32 {
        acc + lhs.to_f32() * rhs.to_f32()
    }

    fn narrow(acc: f32) -> bf16 {
        bf16::from_f32(acc)
    }
}

impl MatmulInput for i8 {
    type Acc = i32;
    type Out = i32;

    fn mul_add(acc: i32, lhs: Self, rhs: Self) -> i32 {
        acc.wrapping_add(lhs as i32 * rhs as i32)
    }

    fn narrow(acc: i32) -> i32 {
        acc
    }
}

/// Element types of one quantization mode, one monomorphized pipeline each.
pub trait QuantScheme: Send + Sync + 'static {
    /// Runtime tag.
    const MODE: QuantMode;
    /// Tokens and the down projection weights.
    type Input: MatmulInput;
    /// Normalized compressed query and the query projection weight.
    type QueryWeight: MatmulInput;
    /// Both paged caches.
    type Cache: TensorElement;
    /// Query content output.
    type Query: TensorElement;
}

/// bf16 everywhere.
pub struct Unquantized;
/// int8 query projection, bf16 caches.
pub struct PartialKvBf16;
/// int8 query projection and caches.
pub struct PartialKvInt8;
/// int8 tokens and projections, bf16 caches.
pub struct FullKvBf16;
/// int8 tokens, projections, caches and query content.
pub struct FullKvInt8;

impl QuantScheme for Unquantized {
    const MODE: QuantMode = QuantMode::NoQuant;
    type Input = bf16;
    type QueryWeight = bf16;
    type Cache = bf16;
    type Query = bf16;
}

impl QuantScheme for PartialKvBf16 {
    const MODE: QuantMode = QuantMode::PartialQuantKvNoQuant;
    type Input = bf16;
    type QueryWeight = i8;
    type Cache = bf16;
    type Query = bf16;
}

impl QuantScheme for PartialKvInt8 {
    const MODE: QuantMode = QuantMode::PartialQuantKvQuant;
    type Input = bf16;
    type QueryWeight = i8;
    type Cache = i8;
    type Query = bf16;
}

impl QuantScheme for FullKvBf16 {
    const MODE: QuantMode = QuantMode::FullQuantKvNoQuant;
    type Input = i8;
    type QueryWeight = i8;
    type Cache = bf16;
    type Query = bf16;
}

impl QuantScheme for FullKvInt8 {
    const MODE: QuantMode = QuantMode::FullQuantKvQuant;
    type Input = i8;
    type QueryWeight = i8;
    type Cache = i8;
    type Query = i8;
}
