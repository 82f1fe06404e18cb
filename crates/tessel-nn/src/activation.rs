// Activation - element-wise ReLU, Sigmoid and TanH
//
//   ReLU:    y = x > 0 ? x : negative_slope * x     dy/dx = y > 0 ? 1 : slope
//   Sigmoid: y = 1 / (1 + exp(-x))                  dy/dx = y * (1 - y)
//   TanH:    y = tanh(x)                            dy/dx = 1 - y^2
//
// Every gradient is expressed through the forward output y, so the layers
// run in place (top == bottom) without keeping a copy of x. For ReLU with
// a non-negative slope, y > 0 exactly when x > 0.

use rand::rngs::StdRng;
use tessel_accel::ActivationMode;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Error, Result};

use crate::config::LayerKind;
use crate::layer::{Count, LayerEnv, Operator};

pub struct Activation {
    kind: LayerKind,
    mode: ActivationMode,
}

impl Activation {
    pub fn relu(negative_slope: f64) -> Self {
        Activation {
            kind: LayerKind::ReLU,
            mode: ActivationMode::Relu { negative_slope },
        }
    }

    pub fn sigmoid() -> Self {
        Activation {
            kind: LayerKind::Sigmoid,
            mode: ActivationMode::Sigmoid,
        }
    }

    pub fn tanh() -> Self {
        Activation {
            kind: LayerKind::TanH,
            mode: ActivationMode::Tanh,
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }

    fn forward_typed<S: Element, C: Accumulator>(
        &self,
        arena: &mut BlobArena,
        bottom: BlobId,
        top: BlobId,
    ) -> Result<()> {
        let mut v = arena.load_values::<S, C>(bottom)?;
        match self.mode {
            ActivationMode::Relu { negative_slope } => {
                let slope = C::cast_f64(negative_slope);
                for x in v.iter_mut() {
                    if *x <= C::zero() {
                        *x = *x * slope;
                    }
                }
            }
            ActivationMode::Sigmoid => {
                for x in v.iter_mut() {
                    *x = C::one() / (C::one() + (-*x).exp());
                }
            }
            ActivationMode::Tanh => {
                for x in v.iter_mut() {
                    *x = x.tanh();
                }
            }
        }
        arena.store_values::<S, C>(top, &v)
    }

    fn backward_typed<S: Element, C: Accumulator>(
        &self,
        arena: &mut BlobArena,
        top: BlobId,
        bottom: BlobId,
    ) -> Result<()> {
        let y = arena.load_values::<S, C>(top)?;
        let mut d = arena.load_diff::<S, C>(top)?;
        match self.mode {
            ActivationMode::Relu { negative_slope } => {
                let slope = C::cast_f64(negative_slope);
                for (d, &y) in d.iter_mut().zip(&y) {
                    if y <= C::zero() {
                        *d = *d * slope;
                    }
                }
            }
            ActivationMode::Sigmoid => {
                for (d, &y) in d.iter_mut().zip(&y) {
                    *d = *d * y * (C::one() - y);
                }
            }
            ActivationMode::Tanh => {
                for (d, &y) in d.iter_mut().zip(&y) {
                    *d = *d * (C::one() - y * y);
                }
            }
        }
        arena.store_diff::<S, C>(bottom, &d)
    }
}

impl Operator for Activation {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn bottom_count(&self) -> Count {
        Count::Exact(1)
    }

    fn top_count(&self) -> Count {
        Count::Exact(1)
    }

    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        _rng: &mut StdRng,
        _arena: &mut BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        if let ActivationMode::Relu { negative_slope } = self.mode {
            if !(negative_slope >= 0.0 && negative_slope.is_finite()) {
                return Err(Error::config(
                    env.name,
                    format!("negative_slope must be finite and >= 0, got {negative_slope}"),
                ));
            }
        }
        Ok(())
    }

    fn reshape(
        &mut self,
        _env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        if top[0] != bottom[0] {
            arena.reshape_like(top[0], bottom[0])?;
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
