// Fillers - parameter initialization at layer setup
//
// AVAILABLE FILLERS:
//
//   Constant { value }      all elements = value
//   Uniform { min, max }    U(min, max)
//   Gaussian { mean, std }  N(mean, std)
//   Xavier                  U(-a, a), a = sqrt(3 / fan_in)
//   Msra                    N(0, std), std = sqrt(2 / fan_in)
//
// fan_in is count / shape[0]: for an inner-product weight [N, K] that is K.
// Values are drawn in f64 from the layer's seeded StdRng and written through
// the arena, which rounds them to the storage type once.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use tessel_core::{BlobArena, BlobId, Error, Result, Shape};

use crate::config::FillerConfig;

/// `count / shape[0]`, the number of inputs feeding each output.
pub fn fan_in(shape: &Shape) -> usize {
    match shape.dims().first() {
        Some(&n) if n > 0 => shape.elem_count() / n,
        _ => 0,
    }
}

fn uniform(n: usize, min: f64, max: f64, rng: &mut StdRng) -> Vec<f64> {
    let dist = Uniform::new_inclusive(min, max);
    (0..n).map(|_| dist.sample(rng)).collect()
}

fn gaussian(layer: &str, n: usize, mean: f64, std: f64, rng: &mut StdRng) -> Result<Vec<f64>> {
    let dist = Normal::new(mean, std)
        .map_err(|e| Error::config(layer, format!("gaussian filler: {e}")))?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

/// Fill `blob`'s values as described by `filler`.
pub fn fill(
    layer: &str,
    filler: &FillerConfig,
    arena: &mut BlobArena,
    blob: BlobId,
    rng: &mut StdRng,
) -> Result<()> {
    let shape = arena.shape(blob)?.clone();
    let n = shape.elem_count();
    let values = match *filler {
        FillerConfig::Constant { value } => return arena.fill_values(blob, value),
        FillerConfig::Uniform { min, max } => {
            if !(min <= max && min.is_finite() && max.is_finite()) {
                return Err(Error::config(
                    layer,
                    format!("uniform filler needs finite min <= max, got [{min}, {max}]"),
                ));
            }
            uniform(n, min, max, rng)
        }
        FillerConfig::Gaussian { mean, std } => gaussian(layer, n, mean, std, rng)?,
        FillerConfig::Xavier => {
            let scale = (3.0 / fan_in_checked(layer, &shape)?).sqrt();
            uniform(n, -scale, scale, rng)
        }
        FillerConfig::Msra => {
            let std = (2.0 / fan_in_checked(layer, &shape)?).sqrt();
            gaussian(layer, n, 0.0, std, rng)?
        }
    };
    arena.set_values_f64(blob, &values)
}

fn fan_in_checked(layer: &str, shape: &Shape) -> Result<f64> {
    match fan_in(shape) {
        0 => Err(Error::config(
            layer,
            format!("cannot derive fan-in of parameter shape {shape}"),
        )),
        n => Ok(n as f64),
    }
}
