//! Elementwise reduction kernels over little-endian byte slices.
//!
//! Integers wrap on overflow. Float `Min`/`Max` ignore NaN the way
//! `f32::min`/`f32::max` do. Half-precision types are widened to `f32`,
//! combined, and rounded back.

use half::{bf16, f16};

use ccl_types::{CclError, DataType, ReduceOp, Result};

trait Element: Copy {
    const SIZE: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn apply(op: ReduceOp, a: Self, b: Self) -> Self;
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

macro_rules! int_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn read(bytes: &[u8]) -> Self { <$ty>::from_le_bytes(array(bytes)) }
            fn write(self, bytes: &mut [u8]) { bytes.copy_from_slice(&self.to_le_bytes()) }
            fn apply(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum     => a.wrapping_add(b),
                    ReduceOp::Product => a.wrapping_mul(b),
                    ReduceOp::Min     => a.min(b),
                    ReduceOp::Max     => a.max(b),
                }
            }
        }
    )*};
}

macro_rules! float_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn read(bytes: &[u8]) -> Self { <$ty>::from_le_bytes(array(bytes)) }
            fn write(self, bytes: &mut [u8]) { bytes.copy_from_slice(&self.to_le_bytes()) }
            fn apply(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum     => a + b,
                    ReduceOp::Product => a * b,
                    ReduceOp::Min     => a.min(b),
                    ReduceOp::Max     => a.max(b),
                }
            }
        }
    )*};
}

macro_rules! half_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const SIZE: usize = 2;
            fn read(bytes: &[u8]) -> Self { <$ty>::from_le_bytes(array(bytes)) }
            fn write(self, bytes: &mut [u8]) { bytes.copy_from_slice(&self.to_le_bytes()) }
            fn apply(op: ReduceOp, a: Self, b: Self) -> Self {
                <$ty>::from_f32(f32::apply(op, a.to_f32(), b.to_f32()))
            }
        }
    )*};
}

int_element!(u8, i8, i32, i64);
float_element!(f32, f64);
half_element!(f16, bf16);

fn combine_typed<T: Element>(op: ReduceOp, acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.chunks_exact_mut(T::SIZE).zip(other.chunks_exact(T::SIZE)) {
        T::apply(op, T::read(a), T::read(b)).write(a);
    }
}

/// `acc[i] = acc[i] ⊕ other[i]` for every element.
pub fn combine(op: ReduceOp, dtype: DataType, acc: &mut [u8], other: &[u8]) -> Result<()> {
    if acc.len() != other.len() || acc.len() % dtype.element_bytes() != 0 {
        return Err(CclError::InvalidArgument(format!(
            "cannot combine {} bytes with {} bytes of {dtype}",
            acc.len(),
            other.len()
        )));
    }
    match dtype {
        DataType::U8   => combine_typed::<u8>(op, acc, other),
        DataType::I8   => combine_typed::<i8>(op, acc, other),
        DataType::I32  => combine_typed::<i32>(op, acc, other),
        DataType::I64  => combine_typed::<i64>(op, acc, other),
        DataType::F16  => combine_typed::<f16>(op, acc, other),
        DataType::BF16 => combine_typed::<bf16>(op, acc, other),
        DataType::F32  => combine_typed::<f32>(op, acc, other),
        DataType::F64  => combine_typed::<f64>(op, acc, other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccl_types::Buffer;

    fn run(op: ReduceOp, a: Buffer, b: &Buffer) -> Buffer {
        let dtype = a.dtype();
        let mut bytes = a.into_bytes();
        combine(op, dtype, &mut bytes, b.as_bytes()).unwrap();
        Buffer::from_bytes(dtype, bytes).unwrap()
    }

    #[test]
    fn integer_ops_wrap() {
        let out = run(ReduceOp::Sum, Buffer::from_i32(&[i32::MAX, 1]), &Buffer::from_i32(&[1, 2]));
        assert_eq!(out.to_i32().unwrap(), vec![i32::MIN, 3]);

        let out = run(ReduceOp::Product, Buffer::from_u8(&[16, 3]), &Buffer::from_u8(&[16, 3]));
        assert_eq!(out.to_u8().unwrap(), vec![0, 9]);

        let out = run(ReduceOp::Min, Buffer::from_i8(&[-3, 7]), &Buffer::from_i8(&[2, -8]));
        assert_eq!(out.to_i8().unwrap(), vec![-3, -8]);

        let out = run(ReduceOp::Max, Buffer::from_i64(&[-3, 7]), &Buffer::from_i64(&[2, -8]));
        assert_eq!(out.to_i64().unwrap(), vec![2, 7]);
    }

    #[test]
    fn float_min_max_ignore_nan() {
        let out = run(
            ReduceOp::Max,
            Buffer::from_f32(&[f32::NAN, 1.0]),
            &Buffer::from_f32(&[2.0, f32::NAN]),
        );
        assert_eq!(out.to_f32().unwrap(), vec![2.0, 1.0]);

        let out = run(ReduceOp::Min, Buffer::from_f64(&[f64::NAN]), &Buffer::from_f64(&[-4.0]));
        assert_eq!(out.to_f64().unwrap(), vec![-4.0]);
    }

    #[test]
    fn half_types_round_through_f32() {
        let a = Buffer::from_f16(&[f16::from_f32(1.5), f16::from_f32(2.0)]);
        let b = Buffer::from_f16(&[f16::from_f32(0.25), f16::from_f32(3.0)]);
        let out = run(ReduceOp::Sum, a, &b).to_f16().unwrap();
        assert_eq!(out[0].to_f32(), 1.75);
        assert_eq!(out[1].to_f32(), 5.0);

        let a = Buffer::from_bf16(&[bf16::from_f32(3.0)]);
        let b = Buffer::from_bf16(&[bf16::from_f32(-2.0)]);
        assert_eq!(run(ReduceOp::Product, a, &b).to_bf16().unwrap()[0].to_f32(), -6.0);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut acc = vec![0u8; 8];
        assert!(combine(ReduceOp::Sum, DataType::I32, &mut acc, &[0u8; 4]).is_err());
        assert!(combine(ReduceOp::Sum, DataType::I32, &mut acc[..6], &[0u8; 6]).is_err());
    }

    #[test]
    fn empty_slices_are_fine() {
        assert!(combine(ReduceOp::Sum, DataType::F64, &mut [], &[]).is_ok());
    }
}
