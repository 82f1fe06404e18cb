// Host and accelerator paths must agree
//
// Each case builds the same layer twice, once on the host and once with the
// accelerator strategy selected, runs forward and backward on identical
// inputs and compares tops and bottom gradients within the precision's
// tolerance.

use tessel::nn::{PoolMethod, PoolingParams, ReluParams, SoftmaxParams};
use tessel::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(approx_eq(*g, *e, tol), "index {i}: {g} vs {e} (tol {tol})");
    }
}

fn device(max_descriptors: Option<usize>) -> Result<AccelDevice> {
    AccelDevice::with_config(AccelConfig {
        ordinal: 0,
        num_threads: Some(2),
        max_descriptors,
    })
}

// Distinct values in [-4.8, 4.8) for up to 97 elements.
fn inputs(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i * 62) % 97) as f64 / 10.0 - 4.8).collect()
}

struct Run {
    top: Vec<f64>,
    bottom_diff: Vec<f64>,
    accelerated: bool,
}

fn run(cfg: &LayerConfig, precision: Precision, dims: Vec<usize>, dev: Option<AccelDevice>) -> Result<Run> {
    let mut ctx = Context::new().with_precision(precision);
    if let Some(dev) = dev {
        ctx = ctx.with_device(dev).with_mode(Mode::Accelerator);
    }
    let mut arena = BlobArena::new(precision);
    let x = arena.create("x", dims)?;
    let y = arena.create_empty("y");
    let n = arena.count(x)?;
    arena.set_values_f64(x, &inputs(n))?;

    let mut layer = create_layer(cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    let m = arena.count(y)?;
    let dy: Vec<f64> = (0..m).map(|i| (i % 5) as f64 * 0.5 - 1.0).collect();
    arena.set_diff_f64(y, &dy)?;
    layer.backward(&mut arena, &[y], &[true], &[x])?;

    Ok(Run {
        top: arena.to_f64_values(y)?,
        bottom_diff: arena.to_f64_diff(x)?,
        accelerated: layer.has_accelerator(),
    })
}

fn check_equivalent(cfg: &LayerConfig, dims: Vec<usize>) -> Result<()> {
    for precision in [Precision::F32, Precision::HALF] {
        let tol = precision.tolerance() * 10.0;
        let host = run(cfg, precision, dims.clone(), None)?;
        let accel = run(cfg, precision, dims.clone(), Some(device(None)?))?;
        assert!(!host.accelerated);
        assert!(accel.accelerated);
        assert_vec_approx(&accel.top, &host.top, tol);
        assert_vec_approx(&accel.bottom_diff, &host.bottom_diff, tol);
    }
    Ok(())
}

#[test]
fn test_softmax_paths_agree() -> Result<()> {
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    check_equivalent(&cfg, vec![2, 5, 3, 3])?;
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams { axis: -1 }));
    check_equivalent(&cfg, vec![4, 6])
}

#[test]
fn test_activation_paths_agree() -> Result<()> {
    for params in [
        LayerParams::ReLU(ReluParams::default()),
        LayerParams::ReLU(ReluParams {
            negative_slope: 0.1,
        }),
        LayerParams::Sigmoid,
        LayerParams::TanH,
    ] {
        check_equivalent(&LayerConfig::new("act", params), vec![3, 4, 5])?;
    }
    Ok(())
}

#[test]
fn test_pooling_paths_agree() -> Result<()> {
    for pool in [PoolMethod::Max, PoolMethod::Ave] {
        let cfg = LayerConfig::new(
            "pool",
            LayerParams::Pooling(PoolingParams {
                pool,
                kernel_size: Some(3),
                stride: 2,
                pad: 1,
                ..Default::default()
            }),
        );
        check_equivalent(&cfg, vec![1, 2, 6, 7])?;
    }
    Ok(())
}

#[test]
fn test_mode_switch_uses_host_path() -> Result<()> {
    let dev = device(None)?;
    let ctx = Context::new().with_device(dev).with_mode(Mode::Accelerator);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 4))?;
    let y = arena.create_empty("y");
    arena.set_values_f64(x, &inputs(8))?;
    let cfg = LayerConfig::new("t", LayerParams::TanH);
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    let accel = arena.to_f64_values(y)?;

    layer.set_mode(Mode::Host);
    arena.fill_values(y, 0.0)?;
    layer.forward(&mut arena, &[x], &[y])?;
    assert_vec_approx(&arena.to_f64_values(y)?, &accel, 1e-5);
    Ok(())
}

#[test]
fn test_accelerator_follows_reshape() -> Result<()> {
    let ctx = Context::new()
        .with_device(device(None)?)
        .with_mode(Mode::Accelerator);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (1, 3))?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;

    arena.reshape(x, (2, 5))?;
    arena.fill_values(x, 2.0)?;
    layer.reshape(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    assert_vec_approx(&arena.to_f64_values(y)?, &[0.2; 10], 1e-6);
    Ok(())
}

// Descriptor lifecycle

#[test]
fn test_descriptors_released_with_layer() -> Result<()> {
    let dev = device(None)?;
    let ctx = Context::new().with_device(dev.clone());
    {
        let mut arena = BlobArena::new(ctx.precision);
        let x = arena.create("x", (2, 3))?;
        let y = arena.create_empty("y");
        let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
        let mut layer = create_layer(&cfg, &ctx)?;
        assert_eq!(dev.live_descriptors(), 0);
        layer.setup(&mut arena, &[x], &[y])?;
        assert!(dev.live_descriptors() > 0);
    }
    assert_eq!(dev.live_descriptors(), 0);
    Ok(())
}

#[test]
fn test_failed_acquisition_releases_everything() -> Result<()> {
    let dev = device(Some(2))?;
    let ctx = Context::new().with_device(dev.clone());
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3))?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[y]),
        Err(Error::Resource(_))
    ));
    assert_eq!(dev.live_descriptors(), 0);

    // a host-only layer needs no descriptors
    let host = cfg.with_engine(Engine::Host);
    let mut layer = create_layer(&host, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    assert_eq!(dev.live_descriptors(), 0);
    Ok(())
}
