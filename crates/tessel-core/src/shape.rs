use std::fmt;

use crate::error::{Error, Result};

// Shape - N-dimensional shape of a blob
//
// A Shape is the ordered list of dimension sizes of a blob:
//   - Scalar: Shape([])            0 axes, 1 element
//   - Matrix: Shape([3, 4])        2 axes, 12 elements
//   - Image batch: Shape([N, C, H, W])
//
// Besides the general N-D view, layers written against the classic
// (num, channels, height, width) convention read shapes through the legacy
// accessors. They are only defined for shapes with at most 4 axes; a missing
// trailing axis reads as 1, so [2, 10] is seen as (2, 10, 1, 1).

/// N-dimensional shape of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

/// Largest rank the legacy (num, channels, height, width) accessors accept.
pub const LEGACY_MAX_AXES: usize = 4;

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element; any zero dimension gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Element count, or `None` if the product overflows `usize`.
    pub fn checked_elem_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Product of the dimensions in `[start, end)`.
    pub fn count_range(&self, start: usize, end: usize) -> Result<usize> {
        if start > end || end > self.rank() {
            return Err(Error::msg(format!(
                "count_range [{start}, {end}) invalid for shape {self}"
            )));
        }
        Ok(self.0[start..end].iter().product())
    }

    /// Product of the dimensions from `start` to the last axis.
    pub fn count_from(&self, start: usize) -> Result<usize> {
        self.count_range(start, self.rank())
    }

    /// Size of a specific axis.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::AxisOutOfRange {
            axis: d as i64,
            rank: self.rank(),
        })
    }

    /// Map a possibly negative axis index into `[0, rank)`.
    ///
    /// `-1` is the last axis, `-rank` the first.
    pub fn canonical_axis(&self, axis: i64) -> Result<usize> {
        let rank = self.rank() as i64;
        if axis < -rank || axis >= rank {
            return Err(Error::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        Ok(if axis < 0 { axis + rank } else { axis } as usize)
    }

    /// Row-major (C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    // Legacy 4-D accessors

    fn legacy_dim(&self, index: usize) -> Result<usize> {
        if self.rank() > LEGACY_MAX_AXES {
            return Err(Error::LegacyShape { shape: self.clone() });
        }
        Ok(self.0.get(index).copied().unwrap_or(1))
    }

    /// Whether the legacy accessors are defined for this shape.
    pub fn is_legacy_compatible(&self) -> bool {
        self.rank() <= LEGACY_MAX_AXES
    }

    /// Number of items (axis 0).
    pub fn num(&self) -> Result<usize> {
        self.legacy_dim(0)
    }

    /// Channel count (axis 1).
    pub fn channels(&self) -> Result<usize> {
        self.legacy_dim(1)
    }

    /// Height (axis 2).
    pub fn height(&self) -> Result<usize> {
        self.legacy_dim(2)
    }

    /// Width (axis 3).
    pub fn width(&self) -> Result<usize> {
        self.legacy_dim(3)
    }

    /// The shape as a (num, channels, height, width) tuple.
    pub fn legacy_dims(&self) -> Result<[usize; 4]> {
        Ok([self.num()?, self.channels()?, self.height()?, self.width()?])
    }

    /// Flat row-major offset of element (n, c, h, w).
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> Result<usize> {
        let [num, channels, height, width] = self.legacy_dims()?;
        if n >= num || c >= channels || h >= height || w >= width {
            return Err(Error::msg(format!(
                "index ({n}, {c}, {h}, {w}) out of bounds for shape {self}"
            )));
        }
        Ok(((n * channels + c) * height + h) * width + w)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((2, 3, 4, 5)) instead of Shape::new(vec![2, 3, 4, 5])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}
