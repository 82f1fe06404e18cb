use std::fmt;
use std::ops::{AddAssign, MulAssign};

use half::{bf16, f16};

use crate::error::{Error, Result};
use crate::storage::Storage;

// DType - storage formats a blob can hold
//
//   F16  - 16-bit IEEE half float, compact storage for activations/weights
//   BF16 - 16-bit brain float, same footprint with f32's exponent range
//   F32  - 32-bit float, the default workhorse and the usual compute type
//   F64  - 64-bit float, for high-precision work and reference checks
//
// MIXED PRECISION:
//
//   Every blob arena and every layer is bound to a Precision, a pair of
//   (storage dtype, compute dtype). Values persist in the storage type; all
//   arithmetic runs in the compute type. Crossing between the two is always
//   an explicit call:
//
//     let x: C = C::load(s);     // storage -> compute (exact widening)
//     let s: S = y.store();      // compute -> storage (rounds)
//
//   A reduction (sum, max, normalizer, dot product) accumulates in C and is
//   stored once. Accumulating in S silently collapses precision for f16 once
//   the running sum grows past a few thousand ulps.

/// Enum of the supported storage formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Short lowercase name (`"f16"`, `"f32"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Parse a name produced by [`DType::as_str`] (also accepts `float16` style names).
    pub fn parse(s: &str) -> Result<DType> {
        match s {
            "f16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f32" | "float32" | "float" => Ok(DType::F32),
            "f64" | "float64" | "double" => Ok(DType::F64),
            _ => Err(Error::msg(format!("unknown dtype '{s}'"))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Element - a storage scalar

/// Trait implemented by the Rust types a blob can store.
///
/// Widening to f32/f64 is exact for every implementor; narrowing rounds to
/// nearest.
pub trait Element:
    Copy + Send + Sync + Default + PartialOrd + fmt::Debug + 'static
{
    /// The corresponding DType variant.
    const DTYPE: DType;

    fn to_f32(self) -> f32;
    fn to_f64(self) -> f64;
    fn from_f32(v: f32) -> Self;
    fn from_f64(v: f64) -> Self;

    /// Borrow a typed slice out of storage, if the dtype matches.
    fn slice(storage: &Storage) -> Option<&[Self]>;

    /// Mutably borrow a typed slice out of storage, if the dtype matches.
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;

    /// Wrap a vector into storage.
    fn into_storage(v: Vec<Self>) -> Storage;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $to32:expr, $to64:expr, $from32:expr, $from64:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;
            #[inline]
            fn to_f32(self) -> f32 {
                $to32(self)
            }
            #[inline]
            fn to_f64(self) -> f64 {
                $to64(self)
            }
            #[inline]
            fn from_f32(v: f32) -> Self {
                $from32(v)
            }
            #[inline]
            fn from_f64(v: f64) -> Self {
                $from64(v)
            }
            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }
            fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
            fn into_storage(v: Vec<Self>) -> Storage {
                Storage::$variant(v)
            }
        }
    };
}

impl_element!(
    f16,
    F16,
    |x: f16| x.to_f32(),
    |x: f16| x.to_f64(),
    f16::from_f32,
    f16::from_f64
);
impl_element!(
    bf16,
    BF16,
    |x: bf16| x.to_f32(),
    |x: bf16| x.to_f64(),
    bf16::from_f32,
    bf16::from_f64
);
impl_element!(
    f32,
    F32,
    |x: f32| x,
    |x: f32| x as f64,
    |v: f32| v,
    |v: f64| v as f32
);
impl_element!(
    f64,
    F64,
    |x: f64| x as f32,
    |x: f64| x,
    |v: f32| v as f64,
    |v: f64| v
);

// Accumulator - a compute scalar

/// Trait implemented by the types arithmetic runs in (f32, f64).
pub trait Accumulator:
    num_traits::Float + AddAssign + MulAssign + Send + Sync + Default + fmt::Debug + 'static
{
    /// The corresponding DType variant.
    const DTYPE: DType;

    /// Storage to compute conversion.
    fn load<S: Element>(s: S) -> Self;

    /// Compute to storage conversion (rounds for narrower storage).
    fn store<S: Element>(self) -> S;

    fn from_usize(n: usize) -> Self;

    /// Narrow (or pass through) an f64 constant into the compute type.
    fn cast_f64(v: f64) -> Self;

    /// Widen to f64 for reporting.
    fn into_f64(self) -> f64;
}

impl Accumulator for f32 {
    const DTYPE: DType = DType::F32;
    #[inline]
    fn load<S: Element>(s: S) -> Self {
        s.to_f32()
    }
    #[inline]
    fn store<S: Element>(self) -> S {
        S::from_f32(self)
    }
    fn from_usize(n: usize) -> Self {
        n as f32
    }
    fn cast_f64(v: f64) -> Self {
        v as f32
    }
    fn into_f64(self) -> f64 {
        self as f64
    }
}

impl Accumulator for f64 {
    const DTYPE: DType = DType::F64;
    #[inline]
    fn load<S: Element>(s: S) -> Self {
        s.to_f64()
    }
    #[inline]
    fn store<S: Element>(self) -> S {
        S::from_f64(self)
    }
    fn from_usize(n: usize) -> Self {
        n as f64
    }
    fn cast_f64(v: f64) -> Self {
        v
    }
    fn into_f64(self) -> f64 {
        self
    }
}

// Precision - the (storage, compute) policy

/// A (storage dtype, compute dtype) binding.
///
/// Compute must be F32 or F64 and at least as wide as storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Precision {
    storage: DType,
    compute: DType,
}

impl Precision {
    /// f32 storage, f32 arithmetic.
    pub const F32: Precision = Precision {
        storage: DType::F32,
        compute: DType::F32,
    };

    /// f16 storage, f32 arithmetic.
    pub const HALF: Precision = Precision {
        storage: DType::F16,
        compute: DType::F32,
    };

    /// bf16 storage, f32 arithmetic.
    pub const BF16: Precision = Precision {
        storage: DType::BF16,
        compute: DType::F32,
    };

    /// f64 storage, f64 arithmetic.
    pub const F64: Precision = Precision {
        storage: DType::F64,
        compute: DType::F64,
    };

    /// Validate and build a precision pair.
    pub fn new(storage: DType, compute: DType) -> Result<Self> {
        let compute_ok = matches!(compute, DType::F32 | DType::F64);
        if !compute_ok || compute.size_in_bytes() < storage.size_in_bytes() {
            return Err(Error::UnsupportedPrecision { storage, compute });
        }
        Ok(Precision { storage, compute })
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Absolute tolerance within which two results computed under this
    /// precision are considered equal.
    pub fn tolerance(&self) -> f64 {
        match (self.storage, self.compute) {
            (DType::F16 | DType::BF16, _) => 1e-3,
            (_, DType::F32) => 1e-5,
            _ => 1e-10,
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Precision::F32
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.storage, self.compute)
    }
}

/// Run `$body` with `$S` bound to the storage type and `$C` bound to the
/// compute type of a runtime [`Precision`]. `$body` must evaluate to a
/// `Result`.
///
/// ```ignore
/// dispatch_precision!(arena.precision(), S, C => {
///     let x = arena.load_values::<S, C>(bottom)?;
///     arena.store_values::<S, C>(top, &x)
/// })
/// ```
#[macro_export]
macro_rules! dispatch_precision {
    ($precision:expr, $S:ident, $C:ident => $body:expr) => {{
        let precision: $crate::Precision = $precision;
        match (precision.storage(), precision.compute()) {
            ($crate::DType::F16, $crate::DType::F32) => {
                #[allow(dead_code)]
                type $S = $crate::half::f16;
                #[allow(dead_code)]
                type $C = f32;
                $body
            }
            ($crate::DType::F16, $crate::DType::F64) => {
                #[allow(dead_code)]
                type $S = $crate::half::f16;
                #[allow(dead_code)]
                type $C = f64;
                $body
            }
            ($crate::DType::BF16, $crate::DType::F32) => {
                #[allow(dead_code)]
                type $S = $crate::half::bf16;
                #[allow(dead_code)]
                type $C = f32;
                $body
            }
            ($crate::DType::BF16, $crate::DType::F64) => {
                #[allow(dead_code)]
                type $S = $crate::half::bf16;
                #[allow(dead_code)]
                type $C = f64;
                $body
            }
            ($crate::DType::F32, $crate::DType::F32) => {
                #[allow(dead_code)]
                type $S = f32;
                #[allow(dead_code)]
                type $C = f32;
                $body
            }
            ($crate::DType::F32, $crate::DType::F64) => {
                #[allow(dead_code)]
                type $S = f32;
                #[allow(dead_code)]
                type $C = f64;
                $body
            }
            ($crate::DType::F64, $crate::DType::F64) => {
                #[allow(dead_code)]
                type $S = f64;
                #[allow(dead_code)]
                type $C = f64;
                $body
            }
            (storage, compute) => Err($crate::Error::UnsupportedPrecision { storage, compute }),
        }
    }};
}
