// Device kernels - data-parallel implementations run on the device pool
//
// Each kernel works on packed NCHW slices in the storage type S and does its
// arithmetic in the compute type C. Work is split along independent slices
// (softmax columns, pooling planes, element chunks) with rayon; callers run
// kernels inside the device's thread pool and the pool joins before the call
// returns, so every write is visible when the kernel function comes back.
//
// DESIGN DECISIONS:
// - Softmax always subtracts the per-column maximum before exponentiating
// - Reductions accumulate in C and round to S once
// - Max-pooling backward recomputes the argmax from (x, y) instead of
//   keeping a mask, scanning the window in the same order as forward

use rayon::prelude::*;
use tessel_core::{Accumulator, Element};

use crate::descriptor::{ActivationMode, PoolingMode};

const CHUNK: usize = 4096;

//  SOFTMAX (over the channel axis of an [outer, channels, inner] view)

pub(crate) fn softmax_forward<S: Element, C: Accumulator>(
    x: &[S],
    y: &mut [S],
    channels: usize,
    inner: usize,
) {
    let slice = channels * inner;
    y.par_chunks_mut(slice)
        .zip(x.par_chunks(slice))
        .for_each(|(y, x)| {
            for i in 0..inner {
                let mut max = C::load(x[i]);
                for c in 1..channels {
                    max = max.max(C::load(x[c * inner + i]));
                }
                let mut sum = C::zero();
                for c in 0..channels {
                    sum += (C::load(x[c * inner + i]) - max).exp();
                }
                for c in 0..channels {
                    let e = (C::load(x[c * inner + i]) - max).exp();
                    y[c * inner + i] = (e / sum).store();
                }
            }
        });
}

pub(crate) fn softmax_backward<S: Element, C: Accumulator>(
    y: &[S],
    dy: &[S],
    dx: &mut [S],
    channels: usize,
    inner: usize,
) {
    let slice = channels * inner;
    dx.par_chunks_mut(slice)
        .zip(y.par_chunks(slice).zip(dy.par_chunks(slice)))
        .for_each(|(dx, (y, dy))| {
            for i in 0..inner {
                let mut dot = C::zero();
                for c in 0..channels {
                    let k = c * inner + i;
                    dot += C::load(dy[k]) * C::load(y[k]);
                }
                for c in 0..channels {
                    let k = c * inner + i;
                    dx[k] = ((C::load(dy[k]) - dot) * C::load(y[k])).store();
                }
            }
        });
}

//  ACTIVATION

pub(crate) fn activation_forward<S: Element, C: Accumulator>(
    mode: ActivationMode,
    x: &[S],
    y: &mut [S],
) {
    let one = C::one();
    y.par_chunks_mut(CHUNK)
        .zip(x.par_chunks(CHUNK))
        .for_each(|(y, x)| {
            for (y, &x) in y.iter_mut().zip(x) {
                let v = C::load(x);
                let out = match mode {
                    ActivationMode::Relu { negative_slope } => {
                        if v > C::zero() {
                            v
                        } else {
                            v * C::cast_f64(negative_slope)
                        }
                    }
                    ActivationMode::Sigmoid => one / (one + (-v).exp()),
                    ActivationMode::Tanh => v.tanh(),
                };
                *y = out.store();
            }
        });
}

pub(crate) fn activation_backward<S: Element, C: Accumulator>(
    mode: ActivationMode,
    y: &[S],
    dy: &[S],
    dx: &mut [S],
) {
    let one = C::one();
    dx.par_chunks_mut(CHUNK)
        .zip(y.par_chunks(CHUNK).zip(dy.par_chunks(CHUNK)))
        .for_each(|(dx, (y, dy))| {
            for ((dx, &y), &dy) in dx.iter_mut().zip(y).zip(dy) {
                let (y, g) = (C::load(y), C::load(dy));
                let out = match mode {
                    ActivationMode::Relu { negative_slope } => {
                        if y > C::zero() {
                            g
                        } else {
                            g * C::cast_f64(negative_slope)
                        }
                    }
                    ActivationMode::Sigmoid => g * y * (one - y),
                    ActivationMode::Tanh => g * (one - y * y),
                };
                *dx = out.store();
            }
        });
}

//  POOLING

/// Geometry of one pooling call on packed NCHW planes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolGeometry {
    pub height: usize,
    pub width: usize,
    pub pooled_h: usize,
    pub pooled_w: usize,
    pub window: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
}

impl PoolGeometry {
    // Window of output (ph, pw): the clipped input range plus the
    // unclipped size used as the averaging divisor.
    fn window_at(&self, ph: usize, pw: usize) -> (usize, usize, usize, usize, usize) {
        let hstart = (ph * self.stride.0) as isize - self.pad.0 as isize;
        let wstart = (pw * self.stride.1) as isize - self.pad.1 as isize;
        let hend = (hstart + self.window.0 as isize).min((self.height + self.pad.0) as isize);
        let wend = (wstart + self.window.1 as isize).min((self.width + self.pad.1) as isize);
        let size = ((hend - hstart) * (wend - wstart)).max(1) as usize;
        let hs = hstart.max(0) as usize;
        let ws = wstart.max(0) as usize;
        let he = (hend as usize).min(self.height);
        let we = (wend as usize).min(self.width);
        (hs, he, ws, we, size)
    }

    // First position holding the largest value in the window.
    fn argmax<S: Element, C: Accumulator>(&self, plane: &[S], ph: usize, pw: usize) -> Option<usize> {
        let (hs, he, ws, we, _) = self.window_at(ph, pw);
        let mut best: Option<(usize, C)> = None;
        for h in hs..he {
            for w in ws..we {
                let k = h * self.width + w;
                let v = C::load(plane[k]);
                if best.map_or(true, |(_, b)| v > b) {
                    best = Some((k, v));
                }
            }
        }
        best.map(|(k, _)| k)
    }
}

pub(crate) fn pooling_forward<S: Element, C: Accumulator>(
    mode: PoolingMode,
    g: PoolGeometry,
    x: &[S],
    y: &mut [S],
) {
    let (in_plane, out_plane) = (g.height * g.width, g.pooled_h * g.pooled_w);
    y.par_chunks_mut(out_plane)
        .zip(x.par_chunks(in_plane))
        .for_each(|(y, x)| {
            for ph in 0..g.pooled_h {
                for pw in 0..g.pooled_w {
                    let out = match mode {
                        PoolingMode::Max => g
                            .argmax::<S, C>(x, ph, pw)
                            .map_or(C::zero(), |k| C::load(x[k])),
                        PoolingMode::AverageIncludePadding => {
                            let (hs, he, ws, we, size) = g.window_at(ph, pw);
                            let mut sum = C::zero();
                            for h in hs..he {
                                for w in ws..we {
                                    sum += C::load(x[h * g.width + w]);
                                }
                            }
                            sum / C::from_usize(size)
                        }
                    };
                    y[ph * g.pooled_w + pw] = out.store();
                }
            }
        });
}

pub(crate) fn pooling_backward<S: Element, C: Accumulator>(
    mode: PoolingMode,
    g: PoolGeometry,
    x: &[S],
    dy: &[S],
    dx: &mut [S],
) {
    let (in_plane, out_plane) = (g.height * g.width, g.pooled_h * g.pooled_w);
    dx.par_chunks_mut(in_plane)
        .zip(x.par_chunks(in_plane).zip(dy.par_chunks(out_plane)))
        .for_each(|(dx, (x, dy))| {
            let mut acc = vec![C::zero(); in_plane];
            for ph in 0..g.pooled_h {
                for pw in 0..g.pooled_w {
                    let grad = C::load(dy[ph * g.pooled_w + pw]);
                    match mode {
                        PoolingMode::Max => {
                            if let Some(k) = g.argmax::<S, C>(x, ph, pw) {
                                acc[k] += grad;
                            }
                        }
                        PoolingMode::AverageIncludePadding => {
                            let (hs, he, ws, we, size) = g.window_at(ph, pw);
                            let share = grad / C::from_usize(size);
                            for h in hs..he {
                                for w in ws..we {
                                    acc[h * g.width + w] += share;
                                }
                            }
                        }
                    }
                }
            }
            for (d, a) in dx.iter_mut().zip(acc) {
                *d = a.store();
            }
        });
}
