// InnerProduct - fully-connected layer: y = x W^T + b
//
// The bottom is viewed as a matrix [M, K] where M = count(0, axis) and
// K = count(axis); the top replaces the flattened remainder with N =
// num_output, so a (2, 3, 4, 5) bottom with N = 10 gives a [2, 10] top.
//
// PARAMETER SHAPES:
//
//   weight: [N, K]   ([K, N] when `transpose` is set)
//   bias:   [N]
//
// K is fixed at setup from the first bottom; a later bottom with a different
// K is a shape error, since the weights cannot be resized meaningfully.
//
// COMPUTATION (all sums accumulate in the compute type):
//
//   forward:   y[m, n]  = sum_k x[m, k] * W[n, k] + b[n]
//   backward:  dW[n, k] += sum_m dy[m, n] * x[m, k]
//              db[n]    += sum_m dy[m, n]
//              dx[m, k]  = sum_n dy[m, n] * W[n, k]

use rand::rngs::StdRng;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Error, Result};

use crate::config::{InnerProductParams, LayerKind};
use crate::filler;
use crate::layer::{Count, LayerEnv, Operator};

pub struct InnerProduct {
    params: InnerProductParams,
    weight: Option<BlobId>,
    bias: Option<BlobId>,
    // cached at every shape inference
    m: usize,
    k: usize,
    n: usize,
}

impl InnerProduct {
    pub fn new(params: InnerProductParams) -> Self {
        InnerProduct {
            params,
            weight: None,
            bias: None,
            m: 0,
            k: 0,
            n: 0,
        }
    }

    fn weight(&self, layer: &str) -> Result<BlobId> {
        self.weight
            .ok_or_else(|| Error::config(layer, "inner product used before setup"))
    }

    // Weight element for output n, input k.
    #[inline]
    fn w_index(&self, n: usize, k: usize) -> usize {
        if self.params.transpose {
            k * self.n + n
        } else {
            n * self.k + k
        }
    }

    fn forward_typed<S: Element, C: Accumulator>(
        &self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: BlobId,
        top: BlobId,
    ) -> Result<()> {
        let x = arena.load_values::<S, C>(bottom)?;
        let w = arena.load_values::<S, C>(self.weight(env.name)?)?;
        let b = match self.bias {
            Some(bias) => Some(arena.load_values::<S, C>(bias)?),
            None => None,
        };
        let (m, k, n) = (self.m, self.k, self.n);
        let mut y = vec![C::zero(); m * n];
        for i in 0..m {
            let row = &x[i * k..(i + 1) * k];
            for j in 0..n {
                let mut acc = C::zero();
                for (kk, &xv) in row.iter().enumerate() {
                    acc += xv * w[self.w_index(j, kk)];
                }
                if let Some(b) = &b {
                    acc += b[j];
                }
                y[i * n + j] = acc;
            }
        }
        arena.store_values::<S, C>(top, &y)
    }

    fn backward_typed<S: Element, C: Accumulator>(
        &self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: BlobId,
        propagate_down: bool,
        bottom: BlobId,
    ) -> Result<()> {
        let weight = self.weight(env.name)?;
        let (m, k, n) = (self.m, self.k, self.n);
        let dy = arena.load_diff::<S, C>(top)?;
        let propagate_param = |i: usize| env.param_propagate_down.get(i).copied().unwrap_or(false);

        if propagate_param(0) {
            let x = arena.load_values::<S, C>(bottom)?;
            let mut dw = vec![C::zero(); n * k];
            for j in 0..n {
                for kk in 0..k {
                    let mut acc = C::zero();
                    for i in 0..m {
                        acc += dy[i * n + j] * x[i * k + kk];
                    }
                    dw[self.w_index(j, kk)] = acc;
                }
            }
            arena.accumulate_diff::<S, C>(weight, &dw)?;
        }
        if let Some(bias) = self.bias {
            if propagate_param(1) {
                let mut db = vec![C::zero(); n];
                for i in 0..m {
                    for (j, d) in db.iter_mut().enumerate() {
                        *d += dy[i * n + j];
                    }
                }
                arena.accumulate_diff::<S, C>(bias, &db)?;
            }
        }
        if propagate_down {
            let w = arena.load_values::<S, C>(weight)?;
            let mut dx = vec![C::zero(); m * k];
            for i in 0..m {
                for kk in 0..k {
                    let mut acc = C::zero();
                    for j in 0..n {
                        acc += dy[i * n + j] * w[self.w_index(j, kk)];
                    }
                    dx[i * k + kk] = acc;
                }
            }
            arena.store_diff::<S, C>(bottom, &dx)?;
        }
        Ok(())
    }
}

impl Operator for InnerProduct {
    fn kind(&self) -> LayerKind {
        LayerKind::InnerProduct
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
        rng: &mut StdRng,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let n = self.params.num_output;
        if n == 0 {
            return Err(Error::config(env.name, "num_output must be positive"));
        }
        let shape = arena.shape(bottom[0])?.clone();
        let axis = shape.canonical_axis(self.params.axis)?;
        let k = shape.count_from(axis)?;
        if k == 0 {
            return Err(Error::shape(
                env.name,
                format!("inner product input {shape} has no elements past axis {axis}"),
            ));
        }
        self.k = k;
        self.n = n;

        let weight_shape = if self.params.transpose {
            vec![k, n]
        } else {
            vec![n, k]
        };
        let weight = arena.create(format!("{}.weight", env.name), weight_shape)?;
        filler::fill(env.name, &self.params.weight_filler, arena, weight, rng)?;
        self.weight = Some(weight);

        if self.params.bias_term {
            let bias = arena.create(format!("{}.bias", env.name), vec![n])?;
            filler::fill(env.name, &self.params.bias_filler, arena, bias, rng)?;
            self.bias = Some(bias);
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
        let shape = arena.shape(bottom[0])?.clone();
        if shape.elem_count() == 0 {
            return Err(Error::shape(
                env.name,
                format!("inner product input {shape} has no elements"),
            ));
        }
        let axis = shape.canonical_axis(self.params.axis)?;
        let k = shape.count_from(axis)?;
        if k != self.k {
            return Err(Error::shape(
                env.name,
                format!(
                    "input size incompatible with inner product parameters: \
                     weights expect {} inputs, {shape} gives {k} from axis {axis}",
                    self.k
                ),
            ));
        }
        self.m = shape.count_range(0, axis)?;
        let mut top_dims = shape.dims()[..axis].to_vec();
        top_dims.push(self.n);
        arena.reshape(top[0], top_dims)
    }

    fn forward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        dispatch_precision!(env.precision, S, C => {
            self.forward_typed::<S, C>(env, arena, bottom[0], top[0])
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
        dispatch_precision!(env.precision, S, C => {
            self.backward_typed::<S, C>(env, arena, top[0], propagate_down[0], bottom[0])
        })
    }

    fn params(&self) -> Vec<BlobId> {
        self.weight.into_iter().chain(self.bias).collect()
    }
}
