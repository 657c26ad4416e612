use alloc::{vec, vec::Vec};
use half::bf16;

use crate::components::{ElemType, Element};

/// Host storage of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    BF16(Vec<bf16>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// Row-major host tensor.
#[derive(new, Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Logical shape, outermost first.
    pub shape: Vec<usize>,
    /// Elements.
    pub data: TensorData,
}

/// An [Element] that can be stored in a [Tensor].
pub trait TensorElement: Element {
    /// Wraps owned elements.
    fn wrap(values: Vec<Self>) -> TensorData;
    /// Borrows the elements if `data` holds this type.
    fn view(data: &TensorData) -> Option<&[Self]>;
    /// Mutably borrows the elements if `data` holds this type.
    fn view_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

macro_rules! tensor_element {
    ($ty:ty, $variant:ident) => {
        impl TensorElement for $ty {
            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn view_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

tensor_element!(bf16, BF16);
tensor_element!(i8, I8);
tensor_element!(i32, I32);
tensor_element!(f32, F32);
tensor_element!(i64, I64);

impl TensorData {
    /// Element type.
    pub fn elem(&self) -> ElemType {
        match self {
            TensorData::BF16(_) => ElemType::BF16,
            TensorData::I8(_) => ElemType::I8,
            TensorData::I32(_) => ElemType::I32,
            TensorData::F32(_) => ElemType::F32,
            TensorData::I64(_) => ElemType::I64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::BF16(values) => values.len(),
            TensorData::I8(values) => values.len(),
            TensorData::I32(values) => values.len(),
            TensorData::F32(values) => values.len(),
            TensorData::I64(values) => values.len(),
        }
    }

    /// Whether there is no element.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Tensor {
    /// Tensor holding `values`.
    pub fn from_vec<E: TensorElement>(shape: Vec<usize>, values: Vec<E>) -> Self {
        Self::new(shape, E::wrap(values))
    }

    /// Zero filled tensor of `elem`.
    pub fn zeros(elem: ElemType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        let data = match elem {
            ElemType::BF16 => TensorData::BF16(vec![bf16::ZERO; len]),
            ElemType::I8 => TensorData::I8(vec![0; len]),
            ElemType::I32 => TensorData::I32(vec![0; len]),
            ElemType::F32 => TensorData::F32(vec![0.0; len]),
            ElemType::I64 => TensorData::I64(vec![0; len]),
        };

        Self::new(shape, data)
    }

    /// Element type.
    pub fn elem(&self) -> ElemType {
        self.data.elem()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there is no element.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements as `E`, `None` on a type mismatch.
    pub fn as_slice<E: TensorElement>(&self) -> Option<&[E]> {
        E::view(&self.data)
    }

    /// Mutable elements as `E`, `None` on a type mismatch.
    pub fn as_mut_slice<E: TensorElement>(&mut self) -> Option<&mut [E]> {
        E::view_mut(&mut self.data)
    }

    /// Every element widened to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        fn widen<E: Element>(values: &[E]) -> Vec<f32> {
            values.iter().map(|value| value.to_f32()).collect()
        }

        match &self.data {
            TensorData::BF16(values) => widen(values),
            TensorData::I8(values) => widen(values),
            TensorData::I32(values) => widen(values),
            TensorData::F32(values) => values.clone(),
            TensorData::I64(values) => widen(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_views_check_the_element_type() {
        let mut tensor = Tensor::from_vec(vec![2, 2], vec![1i8, -2, 3, -4]);

        assert_eq!(tensor.elem(), ElemType::I8);
        assert_eq!(tensor.as_slice::<i8>(), Some(&[1i8, -2, 3, -4][..]));
        assert!(tensor.as_slice::<bf16>().is_none());

        if let Some(values) = tensor.as_mut_slice::<i8>() {
            values[0] = 7;
        }
        assert_eq!(tensor.to_f32_vec(), vec![7.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn zeros_match_the_shape() {
        let tensor = Tensor::zeros(ElemType::BF16, vec![3, 4, 5]);

        assert_eq!(tensor.len(), 60);
        assert!(tensor.as_slice::<bf16>().is_some_and(|values| values.iter().all(|v| *v == bf16::ZERO)));
    }
}
