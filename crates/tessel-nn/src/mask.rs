// Mask - learned element-wise gate over each item
//
// The bottom is viewed as [M, K] with M = count(0, axis) and K = count(axis),
// like InnerProduct, and the top is the flattened [M, K] (legacy view
// (M, K, 1, 1)). One parameter blob holds a weight per input position, shaped
// [1] followed by the bottom dims past `axis`, so a (2, 3, 4, 5) bottom gives a
// [1, 3, 4, 5] mask and a [2, 60] top.
//
//   forward:   y[m, k]  = x[m, k] * w[k]
//   backward:  dw[k]   += sum_m dy[m, k] * x[m, k]
//              dx[m, k] = dy[m, k] * w[k]
//
// The default filler is the constant 1, which starts the layer as a flatten.

use rand::rngs::StdRng;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Error, Result};

use crate::config::{LayerKind, MaskParams};
use crate::filler;
use crate::layer::{Count, LayerEnv, Operator};

pub struct Mask {
    params: MaskParams,
    weight: Option<BlobId>,
    m: usize,
    k: usize,
}

impl Mask {
    pub fn new(params: MaskParams) -> Self {
        Mask {
            params,
            weight: None,
            m: 0,
            k: 0,
        }
    }

    fn weight(&self, layer: &str) -> Result<BlobId> {
        self.weight
            .ok_or_else(|| Error::config(layer, "mask used before setup"))
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
        let y: Vec<C> = x
            .chunks(self.k)
            .flat_map(|row| row.iter().zip(&w).map(|(&xv, &wv)| xv * wv))
            .collect();
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
        let k = self.k;
        let dy = arena.load_diff::<S, C>(top)?;

        if env.param_propagate_down.first().copied().unwrap_or(false) {
            let x = arena.load_values::<S, C>(bottom)?;
            let mut dw = vec![C::zero(); k];
            for i in 0..self.m {
                for (j, d) in dw.iter_mut().enumerate() {
                    *d += dy[i * k + j] * x[i * k + j];
                }
            }
            arena.accumulate_diff::<S, C>(weight, &dw)?;
        }
        if propagate_down {
            let w = arena.load_values::<S, C>(weight)?;
            let dx: Vec<C> = dy
                .chunks(k)
                .flat_map(|row| row.iter().zip(&w).map(|(&d, &wv)| d * wv))
                .collect();
            arena.store_diff::<S, C>(bottom, &dx)?;
        }
        Ok(())
    }
}

impl Operator for Mask {
    fn kind(&self) -> LayerKind {
        LayerKind::Mask
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
        let shape = arena.shape(bottom[0])?.clone();
        let axis = shape.canonical_axis(self.params.axis)?;
        let k = shape.count_from(axis)?;
        if k == 0 {
            return Err(Error::shape(
                env.name,
                format!("mask input {shape} has no elements past axis {axis}"),
            ));
        }
        self.k = k;
        let mut weight_dims = vec![1];
        weight_dims.extend_from_slice(&shape.dims()[axis..]);
        let weight = arena.create(format!("{}.mask", env.name), weight_dims)?;
        filler::fill(env.name, &self.params.weight_filler, arena, weight, rng)?;
        self.weight = Some(weight);
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
        let axis = shape.canonical_axis(self.params.axis)?;
        let k = shape.count_from(axis)?;
        if k != self.k {
            return Err(Error::shape(
                env.name,
                format!("mask holds {} weights, {shape} gives {k} from axis {axis}", self.k),
            ));
        }
        self.m = shape.count_range(0, axis)?;
        let mut top_dims = shape.dims()[..axis].to_vec();
        top_dims.push(k);
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
        self.weight.into_iter().collect()
    }
}
