// Reshape - change the shape of a blob without touching its data
//
// The top becomes a view of the bottom: both values and gradients are
// shared through the arena, so forward and backward have nothing to do.
//
// SHAPE SPEC:
//
//   Each entry of `shape` is a literal dimension, 0 (copy the bottom axis at
//   the same position) or -1 (infer so the element count is preserved; at
//   most one). The spec replaces `num_axes` bottom axes starting at `axis`
//   (-1 = all remaining); the axes before and after are kept:
//
//     bottom (2, 3, 4, 5), shape [0, -1, 1, 1]          -> (2, 60, 1, 1)
//     bottom (2, 8),       shape [2, 4], axis 1         -> (2, 2, 4)
//     bottom (2, 8),       shape [1], axis 1, num_axes 0 -> (2, 1, 8)

use rand::rngs::StdRng;
use tessel_core::{BlobArena, BlobId, Error, Result, Shape};

use crate::config::{LayerKind, ReshapeParams};
use crate::layer::{Count, LayerEnv, Operator};

pub struct Reshape {
    params: ReshapeParams,
    copy_axes: Vec<usize>,
    inferred_axis: Option<usize>,
    // product of the literal dimensions
    constant_count: usize,
}

impl Reshape {
    pub fn new(params: ReshapeParams) -> Self {
        Reshape {
            params,
            copy_axes: Vec::new(),
            inferred_axis: None,
            constant_count: 1,
        }
    }

    /// Compute the top shape for `bottom`.
    pub fn infer_shape(&self, layer: &str, bottom: &Shape) -> Result<Shape> {
        let rank = bottom.rank();
        let start = if self.params.axis >= 0 {
            self.params.axis as usize
        } else {
            let s = rank as i64 + self.params.axis + 1;
            if s < 0 {
                return Err(Error::AxisOutOfRange {
                    axis: self.params.axis,
                    rank,
                });
            }
            s as usize
        };
        if start > rank {
            return Err(Error::AxisOutOfRange {
                axis: self.params.axis,
                rank,
            });
        }
        let end = match self.params.num_axes {
            -1 => rank,
            n if n >= 0 && start + n as usize <= rank => start + n as usize,
            n => {
                return Err(Error::config(
                    layer,
                    format!("num_axes {n} out of range for axis {start} of shape {bottom}"),
                ))
            }
        };

        let spec = &self.params.shape;
        let mut dims: Vec<usize> = bottom.dims()[..start].to_vec();
        for &d in spec {
            dims.push(if d > 0 { d as usize } else { 0 });
        }
        dims.extend_from_slice(&bottom.dims()[end..]);

        for &i in &self.copy_axes {
            let from = start + i;
            if from >= rank {
                return Err(Error::shape(
                    layer,
                    format!("shape entry {i} copies axis {from}, but the bottom {bottom} has {rank} axes"),
                ));
            }
            dims[from] = bottom.dims()[from];
        }

        if let Some(i) = self.inferred_axis {
            let mut fixed = [bottom.count_range(0, start)?, bottom.count_from(end)?]
                .into_iter()
                .chain(self.copy_axes.iter().map(|&c| bottom.dims()[start + c]));
            let explicit = fixed
                .try_fold(self.constant_count, |acc, d| acc.checked_mul(d))
                .ok_or_else(|| {
                    Error::shape(layer, format!("reshape of {bottom} fixes more elements than fit in memory"))
                })?;
            let total = bottom.elem_count();
            if explicit == 0 || total % explicit != 0 {
                return Err(Error::shape(
                    layer,
                    format!(
                        "cannot infer axis {i} of the reshape: {total} elements \
                         do not divide by the {explicit} fixed by the other axes"
                    ),
                ));
            }
            dims[start + i] = total / explicit;
        }

        let shape = Shape::new(dims);
        let dst = shape.checked_elem_count().ok_or_else(|| {
            Error::shape(layer, format!("element count of reshape target {shape} overflows"))
        })?;
        if dst != bottom.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: bottom.elem_count(),
                dst,
                dst_shape: shape,
            });
        }
        Ok(shape)
    }
}

impl Operator for Reshape {
    fn kind(&self) -> LayerKind {
        LayerKind::Reshape
    }

    fn bottom_count(&self) -> Count {
        Count::Exact(1)
    }

    fn top_count(&self) -> Count {
        Count::Exact(1)
    }

    fn allows_in_place(&self) -> bool {
        false
    }

    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        _rng: &mut StdRng,
        _arena: &mut BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        self.copy_axes.clear();
        self.inferred_axis = None;
        self.constant_count = 1;
        for (i, &d) in self.params.shape.iter().enumerate() {
            match d {
                0 => self.copy_axes.push(i),
                -1 => {
                    if self.inferred_axis.is_some() {
                        return Err(Error::config(
                            env.name,
                            "new shape contains multiple -1 dims; at most one is allowed",
                        ));
                    }
                    self.inferred_axis = Some(i);
                }
                d if d > 0 => {
                    self.constant_count = usize::try_from(d)
                        .ok()
                        .and_then(|d| self.constant_count.checked_mul(d))
                        .ok_or_else(|| {
                            Error::config(
                                env.name,
                                format!("shape entries overflow the element count at entry {i} ({d})"),
                            )
                        })?;
                }
                d => {
                    return Err(Error::config(
                        env.name,
                        format!("shape entry {i} is {d}; dims must be >= -1"),
                    ))
                }
            }
        }
        Ok(())
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let shape = self.infer_shape(env.name, arena.shape(bottom[0])?)?;
        arena.alias_as(top[0], bottom[0], shape)
    }

    fn forward_host(
        &mut self,
        _env: &LayerEnv<'_>,
        _arena: &mut BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        Ok(())
    }

    fn backward_host(
        &mut self,
        _env: &LayerEnv<'_>,
        _arena: &mut BlobArena,
        _top: &[BlobId],
        _propagate_down: &[bool],
        _bottom: &[BlobId],
    ) -> Result<()> {
        Ok(())
    }
}
