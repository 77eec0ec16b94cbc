// Typed buffers and buffer descriptors.
//
// Buffers are owned little-endian byte regions tagged with an element type.
// Moving a buffer into a collective request is what guarantees the engine
// exclusive access for the duration of the call.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{CclError, Result};

// ── Data Type ────────────────────────────────────────────────────────────────

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    U8   = 0,
    I8   = 1,
    I32  = 2,
    I64  = 3,
    F16  = 4,
    BF16 = 5,
    F32  = 6,
    F64  = 7,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        Self::U8,
        Self::I8,
        Self::I32,
        Self::I64,
        Self::F16,
        Self::BF16,
        Self::F32,
        Self::F64,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::U8   => "u8",
            Self::I8   => "i8",
            Self::I32  => "i32",
            Self::I64  => "i64",
            Self::F16  => "f16",
            Self::BF16 => "bf16",
            Self::F32  => "f32",
            Self::F64  => "f64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = CclError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "byte" | "uint8"             => Ok(Self::U8),
            "i8" | "char" | "int8"              => Ok(Self::I8),
            "i32" | "int" | "int32"             => Ok(Self::I32),
            "i64" | "long" | "int64"            => Ok(Self::I64),
            "f16" | "half" | "float16"          => Ok(Self::F16),
            "bf16" | "bfloat16"                 => Ok(Self::BF16),
            "f32" | "float" | "float32"         => Ok(Self::F32),
            "f64" | "double" | "float64"        => Ok(Self::F64),
            other => Err(CclError::InvalidArgument(format!("unknown dtype '{other}'"))),
        }
    }
}

// ── Device / Descriptor ──────────────────────────────────────────────────────

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

/// Shape-free description of a buffer handed to a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub dtype: DataType,
    /// Number of elements.
    pub count: usize,
    /// `false` for strided views; the engine only accepts contiguous memory.
    pub contiguous: bool,
    pub device: Device,
}

impl BufferDescriptor {
    pub fn contiguous(dtype: DataType, count: usize, device: Device) -> Self {
        Self {
            dtype,
            count,
            contiguous: true,
            device,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.count * self.dtype.element_bytes()
    }
}

/// Precondition checked by the embedding layer before delegating to the
/// engine: every buffer is contiguous and no two buffers share a device.
pub fn is_available(buffers: &[BufferDescriptor]) -> bool {
    let mut devices = HashSet::with_capacity(buffers.len());
    buffers
        .iter()
        .all(|b| b.contiguous && devices.insert(b.device))
}

// ── Buffer ───────────────────────────────────────────────────────────────────

/// Owned contiguous region of `count` elements of `dtype`, stored
/// little-endian.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    dtype: DataType,
    bytes: Vec<u8>,
}

impl Buffer {
    /// `count` zero-valued elements.
    pub fn zeros(dtype: DataType, count: usize) -> Self {
        Self {
            dtype,
            bytes: vec![0u8; count * dtype.element_bytes()],
        }
    }

    /// Wrap raw little-endian bytes. The length must be a whole number of
    /// elements.
    pub fn from_bytes(dtype: DataType, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % dtype.element_bytes() != 0 {
            return Err(CclError::InvalidArgument(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(Self { dtype, bytes })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.bytes.len() / self.dtype.element_bytes()
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor::contiguous(self.dtype, self.count(), Device::Cpu)
    }

    /// Same dtype and element count as `other`.
    pub fn same_layout(&self, other: &Buffer) -> bool {
        self.dtype == other.dtype && self.bytes.len() == other.bytes.len()
    }

    /// Overwrite this buffer's contents with `other`'s. Layouts must match.
    pub fn copy_from(&mut self, other: &Buffer) -> Result<()> {
        if !self.same_layout(other) {
            return Err(CclError::InvalidArgument(format!(
                "cannot copy {} x {} into {} x {}",
                other.count(),
                other.dtype,
                self.count(),
                self.dtype
            )));
        }
        self.bytes.copy_from_slice(&other.bytes);
        Ok(())
    }

    fn expect_dtype(&self, dtype: DataType) -> Result<()> {
        if self.dtype != dtype {
            return Err(CclError::InvalidArgument(format!(
                "buffer holds {}, not {dtype}",
                self.dtype
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dtype", &self.dtype)
            .field("count", &self.count())
            .finish()
    }
}

/// Copy a width-checked chunk into a fixed array.
pub(crate) fn le_array<const N: usize>(chunk: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(chunk);
    out
}

macro_rules! typed_access {
    ($($ty:ty => $dtype:ident, $from:ident, $to:ident;)*) => {
        impl Buffer {
            $(
                pub fn $from(values: &[$ty]) -> Self {
                    let mut bytes =
                        Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
                    for v in values {
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    Self { dtype: DataType::$dtype, bytes }
                }

                pub fn $to(&self) -> Result<Vec<$ty>> {
                    self.expect_dtype(DataType::$dtype)?;
                    Ok(self
                        .bytes
                        .chunks_exact(std::mem::size_of::<$ty>())
                        .map(|c| <$ty>::from_le_bytes(le_array(c)))
                        .collect())
                }
            )*
        }
    };
}

typed_access! {
    u8   => U8,   from_u8,   to_u8;
    i8   => I8,   from_i8,   to_i8;
    i32  => I32,  from_i32,  to_i32;
    i64  => I64,  from_i64,  to_i64;
    f16  => F16,  from_f16,  to_f16;
    bf16 => BF16, from_bf16, to_bf16;
    f32  => F32,  from_f32,  to_f32;
    f64  => F64,  from_f64,  to_f64;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_discriminants() {
        for v in 0..=7u8 {
            let dt = DataType::from_u8(v).unwrap();
            assert_eq!(dt as u8, v);
        }
        assert!(DataType::from_u8(8).is_none());
    }

    #[test]
    fn dtype_parse_aliases() {
        assert_eq!("float".parse::<DataType>().unwrap(), DataType::F32);
        assert_eq!("bfloat16".parse::<DataType>().unwrap(), DataType::BF16);
        assert_eq!("long".parse::<DataType>().unwrap(), DataType::I64);
        assert!("complex64".parse::<DataType>().is_err());
    }

    #[test]
    fn typed_values_survive_bytes() {
        let buf = Buffer::from_f32(&[1.5, -2.0, 3.25]);
        assert_eq!(buf.count(), 3);
        assert_eq!(buf.len_bytes(), 12);
        assert_eq!(buf.to_f32().unwrap(), vec![1.5, -2.0, 3.25]);
        assert!(buf.to_i32().is_err());

        let h = Buffer::from_bf16(&[bf16::from_f32(0.5)]);
        assert_eq!(h.to_bf16().unwrap()[0].to_f32(), 0.5);
    }

    #[test]
    fn from_bytes_rejects_partial_elements() {
        assert!(Buffer::from_bytes(DataType::I32, vec![0u8; 6]).is_err());
        let buf = Buffer::from_bytes(DataType::I32, vec![0u8; 8]).unwrap();
        assert_eq!(buf.count(), 2);
    }

    #[test]
    fn copy_from_requires_same_layout() {
        let mut dst = Buffer::zeros(DataType::I64, 2);
        dst.copy_from(&Buffer::from_i64(&[7, 8])).unwrap();
        assert_eq!(dst.to_i64().unwrap(), vec![7, 8]);
        assert!(dst.copy_from(&Buffer::from_i64(&[1])).is_err());
        assert!(dst.copy_from(&Buffer::from_f64(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn availability_requires_contiguous_unique_devices() {
        let a = BufferDescriptor::contiguous(DataType::F32, 4, Device::Accelerator(0));
        let b = BufferDescriptor::contiguous(DataType::F32, 4, Device::Accelerator(1));
        assert!(is_available(&[a, b]));
        assert!(is_available(&[]));

        // Same device twice.
        assert!(!is_available(&[a, a]));

        // Two host buffers count as the same device.
        let cpu = BufferDescriptor::contiguous(DataType::F32, 4, Device::Cpu);
        assert!(is_available(&[cpu]));
        assert!(!is_available(&[cpu, cpu]));

        let strided = BufferDescriptor { contiguous: false, ..b };
        assert!(!is_available(&[a, strided]));
    }
}
