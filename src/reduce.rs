//! Element-wise combining primitives applied by the reduction engine.
//!
//! Buffers move through the engine as raw bytes; this module interprets
//! them as typed elements and folds one contribution into another.

use crate::error::{ArborError, Result};
use crate::types::{DataType, ReduceOp};

/// Trait for types that support the four combining operators.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Read/write a value from a little-endian byte slice (alignment-safe).
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

/// Combine `src` into `dst` in place, element by element.
///
/// Both slices must contain at least `count * dtype.size_in_bytes()` bytes.
/// The operator is assumed commutative and associative over `count`
/// elements; the engine folds contributions in arrival order.
pub fn apply_op(
    op: ReduceOp,
    src: &[u8],
    dst: &mut [u8],
    count: usize,
    dtype: DataType,
) -> Result<()> {
    match dtype {
        DataType::F32 => apply_op_typed::<f32>(op, src, dst, count),
        DataType::F64 => apply_op_typed::<f64>(op, src, dst, count),
        DataType::I32 => apply_op_typed::<i32>(op, src, dst, count),
        DataType::I64 => apply_op_typed::<i64>(op, src, dst, count),
        DataType::U32 => apply_op_typed::<u32>(op, src, dst, count),
        DataType::U64 => apply_op_typed::<u64>(op, src, dst, count),
        DataType::I8 => apply_op_typed::<i8>(op, src, dst, count),
        DataType::U8 => apply_op_typed::<u8>(op, src, dst, count),
        _ => {
            return Err(ArborError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    }
    Ok(())
}

fn apply_op_typed<T: Reducible + LeBytes>(op: ReduceOp, src: &[u8], dst: &mut [u8], count: usize) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&src[off..off + t_size]);
        let b = T::read_le(&dst[off..off + t_size]);
        let r = T::reduce(a, b, op);
        r.write_le(&mut dst[off..off + t_size]);
    }
}
