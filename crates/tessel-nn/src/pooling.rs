// Pooling - 2-D max or average pooling over (num, channels, height, width)
//
// OUTPUT SIZE:
//
//   pooled = ceil((in + 2 * pad - kernel) / stride) + 1
//
// and, when padding is used, one less if the last window would start inside
// the padding (so every window overlaps the input). The ceiling means the
// last window may be clipped at the border.
//
// WINDOWS:
//
//   The input range of output (ph, pw) is clipped to the image. Max pooling
//   takes the first maximum in row-major order; average pooling divides by
//   the window size clipped to [-pad, in + pad), so padded positions count
//   as zeros.
//
// TOPS:
//
//   Max pooling accepts an optional second top receiving the argmax of every
//   output as an index h * width + w into its input plane. Average pooling
//   produces exactly one top. The index top is stored in the storage type, so
//   under f16 storage indices above 2048 are rounded and no longer exact.
//
// The host path keeps the argmax from forward in `mask` for backward; the
// accelerator path recomputes it.

use rand::rngs::StdRng;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Error, Result};

use crate::config::{LayerKind, PoolMethod, PoolingParams};
use crate::layer::{Count, LayerEnv, Operator};

/// Validated pooling parameters. The kernel of global pooling is only known
/// once the input size is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub method: PoolMethod,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
    pub global: bool,
}

/// Pooling geometry for one input size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub height: usize,
    pub width: usize,
    pub pooled_h: usize,
    pub pooled_w: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
}

// Resolve the "x OR (x_h and x_w)" parameter pairs.
fn pair(
    layer: &str,
    what: &str,
    both: Option<usize>,
    h: Option<usize>,
    w: Option<usize>,
) -> Result<Option<(usize, usize)>> {
    match (both, h, w) {
        (None, None, None) => Ok(None),
        (Some(v), None, None) => Ok(Some((v, v))),
        (None, Some(h), Some(w)) => Ok(Some((h, w))),
        (Some(_), _, _) => Err(Error::config(
            layer,
            format!("{what} is {what}_size OR {what}_h and {what}_w; not both"),
        )),
        _ => Err(Error::config(
            layer,
            format!("for non-square {what}s both {what}_h and {what}_w are required"),
        )),
    }
}

impl PoolSpec {
    pub fn from_params(layer: &str, p: &PoolingParams) -> Result<Self> {
        let kernel = pair(layer, "kernel", p.kernel_size, p.kernel_h, p.kernel_w)?;
        // stride and pad have defaults, so the _h/_w forms override them
        let stride = pair(layer, "stride", None, p.stride_h, p.stride_w)?
            .unwrap_or((p.stride, p.stride));
        let pad = pair(layer, "pad", None, p.pad_h, p.pad_w)?.unwrap_or((p.pad, p.pad));

        let kernel = if p.global_pooling {
            if kernel.is_some() {
                return Err(Error::config(
                    layer,
                    "with global pooling the kernel size cannot be specified",
                ));
            }
            if pad != (0, 0) || stride != (1, 1) {
                return Err(Error::config(
                    layer,
                    "with global pooling only pad 0 and stride 1 are supported",
                ));
            }
            (0, 0)
        } else {
            let kernel = kernel.ok_or_else(|| {
                Error::config(layer, "kernel_size or kernel_h and kernel_w are required")
            })?;
            if kernel.0 == 0 || kernel.1 == 0 {
                return Err(Error::config(layer, "kernel dimensions must be greater than zero"));
            }
            if pad.0 >= kernel.0 || pad.1 >= kernel.1 {
                return Err(Error::config(
                    layer,
                    format!("pad {pad:?} must be smaller than the kernel {kernel:?}"),
                ));
            }
            kernel
        };
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::config(layer, "stride must be greater than zero"));
        }
        Ok(PoolSpec {
            method: p.pool,
            kernel,
            stride,
            pad,
            global: p.global_pooling,
        })
    }

    /// Geometry for an input of `height` x `width`.
    pub fn geometry(&self, layer: &str, height: usize, width: usize) -> Result<PoolGeometry> {
        let kernel = if self.global {
            (height, width)
        } else {
            self.kernel
        };
        let pooled = |size: usize, k: usize, s: usize, p: usize| -> Result<usize> {
            if size + 2 * p < k || k == 0 {
                return Err(Error::shape(
                    layer,
                    format!("input size {size} with pad {p} is smaller than the kernel {k}"),
                ));
            }
            let mut out = (size + 2 * p - k).div_ceil(s) + 1;
            if p > 0 && (out - 1) * s >= size + p {
                out -= 1;
            }
            Ok(out)
        };
        Ok(PoolGeometry {
            height,
            width,
            pooled_h: pooled(height, kernel.0, self.stride.0, self.pad.0)?,
            pooled_w: pooled(width, kernel.1, self.stride.1, self.pad.1)?,
            kernel,
            stride: self.stride,
            pad: self.pad,
        })
    }
}

impl PoolGeometry {
    pub fn in_plane(&self) -> usize {
        self.height * self.width
    }

    pub fn out_plane(&self) -> usize {
        self.pooled_h * self.pooled_w
    }

    // Clipped input range of output (ph, pw) and the averaging divisor.
    fn window(&self, ph: usize, pw: usize) -> (usize, usize, usize, usize, usize) {
        let hstart = (ph * self.stride.0) as isize - self.pad.0 as isize;
        let wstart = (pw * self.stride.1) as isize - self.pad.1 as isize;
        let hend = (hstart + self.kernel.0 as isize).min((self.height + self.pad.0) as isize);
        let wend = (wstart + self.kernel.1 as isize).min((self.width + self.pad.1) as isize);
        let size = ((hend - hstart) * (wend - wstart)).max(1) as usize;
        (
            hstart.max(0) as usize,
            (hend as usize).min(self.height),
            wstart.max(0) as usize,
            (wend as usize).min(self.width),
            size,
        )
    }
}

pub struct Pooling {
    params: PoolingParams,
    spec: Option<PoolSpec>,
    geometry: Option<PoolGeometry>,
    planes: usize,
    // argmax per output, as an index into its input plane
    mask: Vec<usize>,
}

impl Pooling {
    pub fn new(params: PoolingParams) -> Self {
        Pooling {
            params,
            spec: None,
            geometry: None,
            planes: 0,
            mask: Vec::new(),
        }
    }

    fn ready(&self, layer: &str) -> Result<(PoolSpec, PoolGeometry)> {
        match (self.spec, self.geometry) {
            (Some(s), Some(g)) => Ok((s, g)),
            _ => Err(Error::config(layer, "pooling used before shape inference")),
        }
    }

    fn forward_typed<S: Element, C: Accumulator>(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: BlobId,
        top: &[BlobId],
    ) -> Result<()> {
        let (spec, g) = self.ready(env.name)?;
        let x = arena.load_values::<S, C>(bottom)?;
        let (in_plane, out_plane) = (g.in_plane(), g.out_plane());
        let mut y = vec![C::zero(); self.planes * out_plane];
        if spec.method == PoolMethod::Max {
            self.mask.clear();
            self.mask.resize(y.len(), 0);
        }
        for p in 0..self.planes {
            let xp = &x[p * in_plane..(p + 1) * in_plane];
            for ph in 0..g.pooled_h {
                for pw in 0..g.pooled_w {
                    let o = p * out_plane + ph * g.pooled_w + pw;
                    let (hs, he, ws, we, size) = g.window(ph, pw);
                    match spec.method {
                        PoolMethod::Max => {
                            let mut best: Option<(usize, C)> = None;
                            for h in hs..he {
                                for w in ws..we {
                                    let k = h * g.width + w;
                                    if best.map_or(true, |(_, b)| xp[k] > b) {
                                        best = Some((k, xp[k]));
                                    }
                                }
                            }
                            let (k, v) = best.unwrap_or((0, C::zero()));
                            y[o] = v;
                            self.mask[o] = k;
                        }
                        PoolMethod::Ave => {
                            let mut sum = C::zero();
                            for h in hs..he {
                                for w in ws..we {
                                    sum += xp[h * g.width + w];
                                }
                            }
                            y[o] = sum / C::from_usize(size);
                        }
                    }
                }
            }
        }
        arena.store_values::<S, C>(top[0], &y)?;
        if let Some(&mask_top) = top.get(1) {
            let mask: Vec<C> = self.mask.iter().map(|&k| C::from_usize(k)).collect();
            arena.store_values::<S, C>(mask_top, &mask)?;
        }
        Ok(())
    }

    fn backward_typed<S: Element, C: Accumulator>(
        &self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: BlobId,
        bottom: BlobId,
    ) -> Result<()> {
        let (spec, g) = self.ready(env.name)?;
        let dy = arena.load_diff::<S, C>(top)?;
        let (in_plane, out_plane) = (g.in_plane(), g.out_plane());
        let mut dx = vec![C::zero(); self.planes * in_plane];
        match spec.method {
            PoolMethod::Max => {
                if self.mask.len() != dy.len() {
                    return Err(Error::config(env.name, "max pooling backward before forward"));
                }
                for (o, (&d, &k)) in dy.iter().zip(&self.mask).enumerate() {
                    dx[(o / out_plane) * in_plane + k] += d;
                }
            }
            PoolMethod::Ave => {
                for p in 0..self.planes {
                    for ph in 0..g.pooled_h {
                        for pw in 0..g.pooled_w {
                            let (hs, he, ws, we, size) = g.window(ph, pw);
                            let share = dy[p * out_plane + ph * g.pooled_w + pw] / C::from_usize(size);
                            for h in hs..he {
                                for w in ws..we {
                                    dx[p * in_plane + h * g.width + w] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
        arena.store_diff::<S, C>(bottom, &dx)
    }
}

impl Operator for Pooling {
    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn bottom_count(&self) -> Count {
        Count::Exact(1)
    }

    fn top_count(&self) -> Count {
        match self.params.pool {
            PoolMethod::Max => Count::Range(1, 2),
            PoolMethod::Ave => Count::Exact(1),
        }
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
        self.spec = Some(PoolSpec::from_params(env.name, &self.params)?);
        Ok(())
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let spec = self
            .spec
            .ok_or_else(|| Error::config(env.name, "pooling reshaped before setup"))?;
        let shape = arena.shape(bottom[0])?.clone();
        if shape.rank() != 4 {
            return Err(Error::shape(
                env.name,
                format!("pooling input must have 4 axes (num, channels, height, width), got {shape}"),
            ));
        }
        let [num, channels, height, width] = shape.legacy_dims()?;
        let g = spec.geometry(env.name, height, width)?;
        self.planes = num * channels;
        self.geometry = Some(g);
        self.mask.clear();
        for &t in top {
            arena.reshape(t, (num, channels, g.pooled_h, g.pooled_w))?;
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
            self.forward_typed::<S, C>(env, arena, bottom[0], top)
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
            self.backward_typed::<S, C>(env, arena, top[0], bottom[0])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kernel: usize, stride: usize, pad: usize) -> PoolingParams {
        PoolingParams {
            kernel_size: Some(kernel),
            stride,
            pad,
            ..Default::default()
        }
    }

    #[test]
    fn test_output_size_ceil() -> Result<()> {
        let spec = PoolSpec::from_params("p", &params(2, 2, 0))?;
        let g = spec.geometry("p", 3, 3)?;
        assert_eq!((g.pooled_h, g.pooled_w), (2, 2));
        Ok(())
    }

    #[test]
    fn test_output_size_drops_window_in_padding() -> Result<()> {
        let spec = PoolSpec::from_params("p", &params(2, 2, 1))?;
        // ceil((5 + 2 - 2) / 2) + 1 = 4, but window 3 starts at 6 - 1 = 5 (padding)
        assert_eq!(spec.geometry("p", 5, 5)?.pooled_h, 3);
        let spec = PoolSpec::from_params("p", &params(3, 2, 1))?;
        assert_eq!(spec.geometry("p", 4, 4)?.pooled_h, 3);
        Ok(())
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            PoolSpec::from_params("p", &params(2, 1, 2)),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            PoolSpec::from_params("p", &PoolingParams::default()),
            Err(Error::Config { .. })
        ));
        let both = PoolingParams {
            kernel_size: Some(2),
            kernel_h: Some(2),
            kernel_w: Some(3),
            ..Default::default()
        };
        assert!(matches!(PoolSpec::from_params("p", &both), Err(Error::Config { .. })));
        let global = PoolingParams {
            global_pooling: true,
            kernel_size: Some(2),
            ..Default::default()
        };
        assert!(matches!(PoolSpec::from_params("p", &global), Err(Error::Config { .. })));
    }

    #[test]
    fn test_global_pooling_geometry() -> Result<()> {
        let spec = PoolSpec::from_params(
            "p",
            &PoolingParams {
                global_pooling: true,
                ..Default::default()
            },
        )?;
        let g = spec.geometry("p", 6, 4)?;
        assert_eq!(g.kernel, (6, 4));
        assert_eq!((g.pooled_h, g.pooled_w), (1, 1));
        Ok(())
    }

    #[test]
    fn test_average_divisor_counts_padding() -> Result<()> {
        let spec = PoolSpec::from_params("p", &params(3, 1, 1))?;
        let g = spec.geometry("p", 3, 3)?;
        // corner window covers [-1, 2) x [-1, 2): 9 positions, 4 inside
        let (hs, he, ws, we, size) = g.window(0, 0);
        assert_eq!((hs, he, ws, we, size), (0, 2, 0, 2, 9));
        Ok(())
    }
}
