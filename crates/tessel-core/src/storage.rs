use half::{bf16, f16};

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};

// Storage - one contiguous, typed array of blob elements
//
// A blob never owns storage directly: the arena holds Storage in slots and
// blobs point at slots. Storage is an enum over the storage dtypes so that
// one arena can be instantiated for any precision at runtime; kernels borrow
// the typed slice they expect through `Element::slice`.

/// A typed, contiguous array of elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

fn try_zeros<S: Element>(n: usize) -> Result<Vec<S>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).map_err(|e| Error::Allocation {
        requested_bytes: n.saturating_mul(S::DTYPE.size_in_bytes()),
        reason: e.to_string(),
    })?;
    v.resize(n, S::default());
    Ok(v)
}

impl Storage {
    /// Allocate `n` zeroed elements of `dtype`.
    pub fn zeros(dtype: DType, n: usize) -> Result<Storage> {
        Ok(match dtype {
            DType::F16 => Storage::F16(try_zeros(n)?),
            DType::BF16 => Storage::BF16(try_zeros(n)?),
            DType::F32 => Storage::F32(try_zeros(n)?),
            DType::F64 => Storage::F64(try_zeros(n)?),
        })
    }

    /// Build storage of `dtype` from f64 values (rounding as needed).
    pub fn from_f64_slice(data: &[f64], dtype: DType) -> Storage {
        match dtype {
            DType::F16 => Storage::F16(data.iter().map(|&v| f16::from_f64(v)).collect()),
            DType::BF16 => Storage::BF16(data.iter().map(|&v| bf16::from_f64(v)).collect()),
            DType::F32 => Storage::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => Storage::F64(data.to_vec()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Storage::F16(v) => v.len(),
            Storage::BF16(v) => v.len(),
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the payload in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Typed read access. Fails if `S` is not this storage's dtype.
    pub fn as_slice<S: Element>(&self) -> Result<&[S]> {
        let got = self.dtype();
        S::slice(self).ok_or(Error::DTypeMismatch {
            expected: S::DTYPE,
            got,
        })
    }

    /// Typed write access. Fails if `S` is not this storage's dtype.
    pub fn as_mut_slice<S: Element>(&mut self) -> Result<&mut [S]> {
        let got = self.dtype();
        S::slice_mut(self).ok_or(Error::DTypeMismatch {
            expected: S::DTYPE,
            got,
        })
    }

    /// Copy out every element widened to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Storage::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            Storage::BF16(v) => v.iter().map(|x| x.to_f64()).collect(),
            Storage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::F64(v) => v.clone(),
        }
    }

    /// Overwrite all elements from f64 values.
    pub fn copy_from_f64(&mut self, data: &[f64]) -> Result<()> {
        if data.len() != self.len() {
            return Err(Error::msg(format!(
                "copy_from_f64: storage holds {} elements, got {}",
                self.len(),
                data.len()
            )));
        }
        *self = Storage::from_f64_slice(data, self.dtype());
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: f64) {
        match self {
            Storage::F16(v) => v.fill(f16::from_f64(value)),
            Storage::BF16(v) => v.fill(bf16::from_f64(value)),
            Storage::F32(v) => v.fill(value as f32),
            Storage::F64(v) => v.fill(value),
        }
    }

    /// Convert to another dtype (exact when widening).
    pub fn cast(&self, dtype: DType) -> Storage {
        if dtype == self.dtype() {
            return self.clone();
        }
        Storage::from_f64_slice(&self.to_f64_vec(), dtype)
    }

    /// Raw little-endian bytes of the payload.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Storage::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Rebuild storage from raw little-endian bytes.
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Storage> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(Error::Format(format!(
                "{} payload bytes is not a multiple of the {dtype} width {width}",
                bytes.len()
            )));
        }
        Ok(match dtype {
            DType::F16 => Storage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::BF16 => Storage::BF16(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::F32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F64 => Storage::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b)
                    })
                    .collect(),
            ),
        })
    }
}
