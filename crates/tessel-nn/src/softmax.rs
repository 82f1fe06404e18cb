// Softmax - normalized exponentials along one axis
//
// The bottom is viewed as [outer, channels, inner] around `axis`; each of the
// outer * inner columns of `channels` values is normalized independently.
//
// NUMERICAL STABILITY:
//
//   y_c = exp(x_c - max) / sum_c' exp(x_c' - max)
//
// The max is always subtracted, and both the max and the normalizer are
// formed in the compute type, so half-precision storage only rounds the final
// probabilities. Without the shift, exp overflows f16 (and f32 for inputs
// above ~88) long before the ratio itself is out of range.
//
// BACKWARD:
//
//   dx_c = (dy_c - sum_c' dy_c' * y_c') * y_c

use rand::rngs::StdRng;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Result};

use crate::config::{LayerKind, SoftmaxParams};
use crate::layer::{Count, LayerEnv, Operator};

pub struct Softmax {
    params: SoftmaxParams,
    outer: usize,
    channels: usize,
    inner: usize,
}

impl Softmax {
    pub fn new(params: SoftmaxParams) -> Self {
        Softmax {
            params,
            outer: 0,
            channels: 0,
            inner: 0,
        }
    }

    fn forward_typed<S: Element, C: Accumulator>(
        &self,
        arena: &mut BlobArena,
        bottom: BlobId,
        top: BlobId,
    ) -> Result<()> {
        let x = arena.load_values::<S, C>(bottom)?;
        let (channels, inner) = (self.channels, self.inner);
        let mut y = vec![C::zero(); x.len()];
        for o in 0..self.outer {
            let base = o * channels * inner;
            for i in 0..inner {
                let at = |c: usize| base + c * inner + i;
                let mut max = C::neg_infinity();
                for c in 0..channels {
                    max = max.max(x[at(c)]);
                }
                let mut sum = C::zero();
                for c in 0..channels {
                    let e = (x[at(c)] - max).exp();
                    y[at(c)] = e;
                    sum += e;
                }
                for c in 0..channels {
                    y[at(c)] = y[at(c)] / sum;
                }
            }
        }
        arena.store_values::<S, C>(top, &y)
    }

    fn backward_typed<S: Element, C: Accumulator>(
        &self,
        arena: &mut BlobArena,
        top: BlobId,
        bottom: BlobId,
    ) -> Result<()> {
        let y = arena.load_values::<S, C>(top)?;
        let dy = arena.load_diff::<S, C>(top)?;
        let (channels, inner) = (self.channels, self.inner);
        let mut dx = vec![C::zero(); y.len()];
        for o in 0..self.outer {
            let base = o * channels * inner;
            for i in 0..inner {
                let at = |c: usize| base + c * inner + i;
                let mut dot = C::zero();
                for c in 0..channels {
                    dot += dy[at(c)] * y[at(c)];
                }
                for c in 0..channels {
                    dx[at(c)] = (dy[at(c)] - dot) * y[at(c)];
                }
            }
        }
        arena.store_diff::<S, C>(bottom, &dx)
    }
}

impl Operator for Softmax {
    fn kind(&self) -> LayerKind {
        LayerKind::Softmax
    }

    fn bottom_count(&self) -> Count {
        Count::Exact(1)
    }

    fn top_count(&self) -> Count {
        Count::Exact(1)
    }

    fn setup(
        &mut self,
        _env: &LayerEnv<'_>,
        _rng: &mut StdRng,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        arena.shape(bottom[0])?.canonical_axis(self.params.axis)?;
        Ok(())
    }

    fn reshape(
        &mut self,
        _env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let shape = arena.shape(bottom[0])?.clone();
        let axis = shape.canonical_axis(self.params.axis)?;
        self.outer = shape.count_range(0, axis)?;
        self.channels = shape.dims()[axis];
        self.inner = shape.count_from(axis + 1)?;
        if top[0] != bottom[0] {
            arena.reshape(top[0], shape)?;
        }
        Ok(())
    }

    fn forward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        dispatch_precision!(env.precision, S, C => {
            self.forward_typed::<S, C>(arena, bottom[0], top[0])
        })
    }

    fn backward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        dispatch_precision!(env.precision, S, C => {
            self.backward_typed::<S, C>(arena, top[0], bottom[0])
        })
    }
}
