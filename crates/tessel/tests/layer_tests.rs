// Integration tests for the layer contract and the host operators
//
// Every test builds layers through the factory from configuration records and
// drives them through setup / forward / backward against one BlobArena, the
// way a graph scheduler would.

use tessel::nn::{
    FillerConfig, InnerProductParams, MaskParams, PoolMethod, PoolingParams, ReluParams, ReshapeParams,
    ScriptBlob, ScriptDelegate, ScriptParams, SoftmaxParams, SplitParams,
};
use tessel::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

// Deterministic inputs in [-2, 2).
fn ramp(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i * 37) % 17) as f64 * 0.25 - 2.0).collect()
}

fn ip_config(name: &str, num_output: usize) -> LayerConfig {
    LayerConfig::new(
        name,
        LayerParams::InnerProduct(InnerProductParams {
            num_output,
            weight_filler: FillerConfig::Constant { value: 0.5 },
            bias_filler: FillerConfig::Constant { value: 1.0 },
            ..Default::default()
        }),
    )
}

// Lifecycle

#[test]
fn test_forward_before_setup_is_invalid_state() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3))?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    assert_eq!(layer.state(), LayerState::Constructed);
    assert!(matches!(
        layer.forward(&mut arena, &[x], &[y]),
        Err(Error::InvalidState { .. })
    ));

    layer.setup(&mut arena, &[x], &[y])?;
    assert_eq!(layer.state(), LayerState::Ready);
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[y]),
        Err(Error::InvalidState { .. })
    ));
    Ok(())
}

#[test]
fn test_cardinality_checked_at_setup() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let a = arena.create("a", 4)?;
    let b = arena.create("b", 4)?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::new("relu", LayerParams::ReLU(ReluParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    match layer.setup(&mut arena, &[a, b], &[y]) {
        Err(Error::Cardinality {
            side, expected, got, ..
        }) => {
            assert_eq!(side, "bottom");
            assert_eq!(expected, "exactly 1");
            assert_eq!(got, 2);
        }
        other => panic!("expected cardinality error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_arena_precision_must_match_layer() -> Result<()> {
    let ctx = Context::new().with_precision(Precision::HALF);
    let mut arena = BlobArena::new(Precision::F32);
    let x = arena.create("x", 4)?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::new("t", LayerParams::TanH);
    let mut layer = create_layer(&cfg, &ctx)?;
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[y]),
        Err(Error::Config { .. })
    ));
    Ok(())
}

// InnerProduct

#[test]
fn test_inner_product_shapes() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("data", (2, 3, 4, 5))?;
    let y = arena.create_empty("ip");
    let mut layer = create_layer(&ip_config("ip", 10), &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;

    assert_eq!(arena.shape(y)?.dims(), &[2, 10]);
    assert_eq!(arena.shape(y)?.legacy_dims()?, [2, 10, 1, 1]);
    let params = layer.params();
    assert_eq!(params.len(), 2);
    assert_eq!(arena.shape(params[0])?.dims(), &[10, 60]);
    assert_eq!(arena.shape(params[1])?.dims(), &[10]);
    assert_eq!(arena.name(params[0])?, "ip.weight");
    Ok(())
}

#[test]
fn test_inner_product_forward_backward() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("data", (2, 60))?;
    let y = arena.create_empty("ip");
    arena.fill_values(x, 1.0)?;
    let mut layer = create_layer(&ip_config("ip", 10), &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    // 60 * 1.0 * 0.5 + 1.0
    assert_vec_approx(&arena.to_f64_values(y)?, &[31.0; 20], 1e-5);

    arena.fill_diff(y, 1.0)?;
    layer.backward(&mut arena, &[y], &[true], &[x])?;
    let [weight, bias] = [layer.params()[0], layer.params()[1]];
    // input gradient is written: sum over 10 outputs of 0.5
    assert_vec_approx(&arena.to_f64_diff(x)?, &[5.0; 120], 1e-5);
    assert_vec_approx(&arena.to_f64_diff(weight)?, &[2.0; 600], 1e-5);
    assert_vec_approx(&arena.to_f64_diff(bias)?, &[2.0; 10], 1e-5);

    // parameter gradients accumulate, input gradients do not
    layer.backward(&mut arena, &[y], &[true], &[x])?;
    assert_vec_approx(&arena.to_f64_diff(x)?, &[5.0; 120], 1e-5);
    assert_vec_approx(&arena.to_f64_diff(weight)?, &[4.0; 600], 1e-5);
    assert_vec_approx(&arena.to_f64_diff(bias)?, &[4.0; 10], 1e-5);
    Ok(())
}

#[test]
fn test_inner_product_param_propagate_flags() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("data", (1, 4))?;
    let y = arena.create_empty("ip");
    let mut layer = create_layer(&ip_config("ip", 2), &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.set_param_propagate_down(0, false);
    arena.fill_values(x, 1.0)?;
    arena.fill_values(layer.params()[0], 1.0)?;
    arena.fill_diff(x, 9.0)?;

    layer.forward(&mut arena, &[x], &[y])?;
    arena.fill_diff(y, 1.0)?;
    layer.backward(&mut arena, &[y], &[false], &[x])?;
    assert_eq!(arena.to_f64_diff(layer.params()[0])?, vec![0.0; 8]);
    assert_eq!(arena.to_f64_diff(layer.params()[1])?, vec![1.0; 2]);
    // bottom untouched when its flag is unset
    assert_eq!(arena.to_f64_diff(x)?, vec![9.0; 4]);
    Ok(())
}

#[test]
fn test_inner_product_rejects_changed_input_size() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("data", (2, 6))?;
    let y = arena.create_empty("ip");
    let mut layer = create_layer(&ip_config("ip", 3), &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;

    // a new batch size is fine
    arena.reshape(x, (5, 6))?;
    layer.reshape(&mut arena, &[x], &[y])?;
    assert_eq!(arena.shape(y)?.dims(), &[5, 3]);

    arena.reshape(x, (5, 7))?;
    assert!(matches!(
        layer.reshape(&mut arena, &[x], &[y]),
        Err(Error::Shape { .. })
    ));
    Ok(())
}

#[test]
fn test_fillers_reproducible_from_seed() -> Result<()> {
    let params = |seed| -> Result<Vec<f64>> {
        let ctx = Context::new().with_seed(seed);
        let mut arena = BlobArena::new(ctx.precision);
        let x = arena.create("data", (1, 8))?;
        let y = arena.create_empty("ip");
        let cfg = LayerConfig::new(
            "ip",
            LayerParams::InnerProduct(InnerProductParams {
                num_output: 4,
                weight_filler: FillerConfig::Xavier,
                ..Default::default()
            }),
        );
        let mut layer = create_layer(&cfg, &ctx)?;
        layer.setup(&mut arena, &[x], &[y])?;
        arena.to_f64_values(layer.params()[0])
    };
    let a = params(11)?;
    assert_eq!(a, params(11)?);
    assert_ne!(a, params(12)?);
    let bound = (3.0f64 / 8.0).sqrt();
    assert!(a.iter().all(|v| v.abs() <= bound + 1e-6));
    Ok(())
}

// Mask

#[test]
fn test_mask_setup_shapes_and_backward() -> Result<()> {
    let ctx = Context::new().with_seed(9);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("data", (2, 3, 4, 5))?;
    let y = arena.create_empty("masked");
    arena.set_values_f64(x, &(0..120).map(|i| i as f64 * 0.01).collect::<Vec<_>>())?;
    let cfg = LayerConfig::new(
        "mask",
        LayerParams::Mask(MaskParams {
            weight_filler: FillerConfig::Uniform { min: 0.0, max: 1.0 },
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    assert_eq!(arena.shape(y)?.legacy_dims()?, [2, 60, 1, 1]);
    let mask = layer.params()[0];
    assert_eq!(arena.shape(mask)?.dims(), &[1, 3, 4, 5]);
    let w = arena.to_f64_values(mask)?;
    assert!(w.iter().all(|v| (0.0..=1.0).contains(v)));

    layer.forward(&mut arena, &[x], &[y])?;
    let out = arena.to_f64_values(y)?;
    for i in 0..120 {
        assert!(approx_eq(out[i], i as f64 * 0.01 * w[i % 60], 1e-5));
    }

    arena.fill_diff(y, 1.0)?;
    layer.backward(&mut arena, &[y], &[true], &[x])?;
    // dw[k] = x[0, k] + x[1, k]
    let expected: Vec<f64> = (0..60).map(|k| (2 * k + 60) as f64 * 0.01).collect();
    assert_vec_approx(&arena.to_f64_diff(mask)?, &expected, 1e-5);
    let dx: Vec<f64> = (0..120).map(|i| w[i % 60]).collect();
    assert_vec_approx(&arena.to_f64_diff(x)?, &dx, 1e-6);
    Ok(())
}

// Softmax

#[test]
fn test_softmax_columns_sum_to_one() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 10, 2, 3))?;
    let y = arena.create_empty("prob");
    arena.set_values_f64(x, &ramp(120))?;
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;

    let p = arena.to_f64_values(y)?;
    for n in 0..2 {
        for i in 0..6 {
            let sum: f64 = (0..10).map(|c| p[n * 60 + c * 6 + i]).sum();
            assert!(approx_eq(sum, 1.0, 1e-5), "column ({n}, {i}) sums to {sum}");
        }
    }
    assert!(p.iter().all(|&v| v > 0.0 && v <= 1.0));
    Ok(())
}

#[test]
fn test_softmax_matches_reference_over_wide_range() -> Result<()> {
    let (outer, channels, inner) = (2, 5, 3);
    let n = outer * channels * inner;
    for precision in [Precision::F32, Precision::HALF] {
        let ctx = Context::new().with_precision(precision);
        let mut arena = BlobArena::new(ctx.precision);
        let x = arena.create("x", (outer, channels, inner))?;
        let y = arena.create_empty("prob");
        let values: Vec<f64> = (0..n).map(|i| ((i * 13) % n) as f64 * 100.0 / (n - 1) as f64 - 50.0).collect();
        arena.set_values_f64(x, &values)?;
        let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
        let mut layer = create_layer(&cfg, &ctx)?;
        layer.setup(&mut arena, &[x], &[y])?;
        layer.forward(&mut arena, &[x], &[y])?;

        // reference from the stored (possibly rounded) inputs
        let stored = arena.to_f64_values(x)?;
        let mut expected = vec![0.0; n];
        for o in 0..outer {
            for i in 0..inner {
                let at = |c: usize| (o * channels + c) * inner + i;
                let max = (0..channels).map(|c| stored[at(c)]).fold(f64::NEG_INFINITY, f64::max);
                let sum: f64 = (0..channels).map(|c| (stored[at(c)] - max).exp()).sum();
                for c in 0..channels {
                    expected[at(c)] = (stored[at(c)] - max).exp() / sum;
                }
            }
        }
        assert_vec_approx(&arena.to_f64_values(y)?, &expected, 1e-3);
    }
    Ok(())
}

#[test]
fn test_softmax_large_inputs_in_half_precision() -> Result<()> {
    let ctx = Context::new().with_precision(Precision::HALF);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (1, 4))?;
    let y = arena.create_empty("prob");
    arena.set_values_f64(x, &[1000.0, 1000.0, 1000.0, 1000.0])?;
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    assert_vec_approx(&arena.to_f64_values(y)?, &[0.25; 4], 1e-3);
    Ok(())
}

#[test]
fn test_softmax_backward_in_place() -> Result<()> {
    let ctx = Context::new().with_precision(Precision::F64);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (1, 2))?;
    arena.set_values_f64(x, &[0.0, 0.0])?;
    let cfg = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[x])?;
    layer.forward(&mut arena, &[x], &[x])?;
    assert_vec_approx(&arena.to_f64_values(x)?, &[0.5, 0.5], 1e-12);

    arena.set_diff_f64(x, &[1.0, 0.0])?;
    layer.backward(&mut arena, &[x], &[true], &[x])?;
    // (dy - sum(dy * y)) * y = (1 - 0.5) * 0.5, (0 - 0.5) * 0.5
    assert_vec_approx(&arena.to_f64_diff(x)?, &[0.25, -0.25], 1e-12);
    Ok(())
}

// Reshape

#[test]
fn test_reshape_aliases_without_copy() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3, 4, 5))?;
    let y = arena.create_empty("flat");
    let values: Vec<f64> = (0..120).map(|i| i as f64).collect();
    arena.set_values_f64(x, &values)?;
    let cfg = LayerConfig::new(
        "flat",
        LayerParams::Reshape(ReshapeParams {
            shape: vec![0, -1, 1, 1],
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;

    assert_eq!(arena.shape(y)?.dims(), &[2, 60, 1, 1]);
    assert!(arena.is_alias(x, y)?);
    for n in 0..2 {
        for c in 0..60 {
            assert_eq!(arena.value_at(y, n, c, 0, 0)?, (n * 60 + c) as f64);
        }
    }
    // gradients written to the top land in the bottom
    arena.fill_diff(y, 3.0)?;
    layer.backward(&mut arena, &[y], &[true], &[x])?;
    assert_eq!(arena.to_f64_diff(x)?, vec![3.0; 120]);
    Ok(())
}

#[test]
fn test_reshape_stale_until_reinferred() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3, 4, 5))?;
    let y = arena.create_empty("flat");
    let cfg = LayerConfig::new(
        "flat",
        LayerParams::Reshape(ReshapeParams {
            shape: vec![0, -1],
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[y])?;

    arena.reshape(x, (4, 3, 4, 5))?;
    assert!(arena.is_stale(y)?);
    assert!(matches!(arena.values::<f32>(y), Err(Error::StaleAlias { .. })));
    assert!(matches!(
        layer.forward(&mut arena, &[x], &[y]),
        Err(Error::StaleShape { .. })
    ));
    assert_eq!(layer.state(), LayerState::ShapeStale);

    layer.reshape(&mut arena, &[x], &[y])?;
    assert_eq!(arena.shape(y)?.dims(), &[4, 60]);
    assert_eq!(arena.values::<f32>(y)?.len(), 240);
    layer.forward(&mut arena, &[x], &[y])?;
    Ok(())
}

#[test]
fn test_reshape_in_place_rejected() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3))?;
    let cfg = LayerConfig::new(
        "r",
        LayerParams::Reshape(ReshapeParams {
            shape: vec![-1],
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[x]),
        Err(Error::Config { .. })
    ));
    Ok(())
}

// Activations

#[test]
fn test_relu_in_place() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", 4)?;
    arena.set_values_f64(x, &[-1.0, 0.0, 2.0, -3.5])?;
    let cfg = LayerConfig::new("relu", LayerParams::ReLU(ReluParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &[x])?;
    layer.forward(&mut arena, &[x], &[x])?;
    assert_eq!(arena.to_f64_values(x)?, vec![0.0, 0.0, 2.0, 0.0]);

    arena.fill_diff(x, 1.0)?;
    layer.backward(&mut arena, &[x], &[true], &[x])?;
    assert_eq!(arena.to_f64_diff(x)?, vec![0.0, 0.0, 1.0, 0.0]);
    Ok(())
}

#[test]
fn test_relu_negative_slope_must_be_non_negative() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", 4)?;
    let y = arena.create_empty("y");
    let cfg = LayerConfig::from_json(r#"{"name": "r", "type": "ReLU", "negative_slope": -0.1}"#)?;
    let mut layer = create_layer(&cfg, &ctx)?;
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[y]),
        Err(Error::Config { .. })
    ));
    Ok(())
}

// Split

#[test]
fn test_split_shares_values_and_sums_gradients() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (2, 3))?;
    let tops = [
        arena.create_empty("x_0"),
        arena.create_empty("x_1"),
        arena.create_empty("x_2"),
    ];
    arena.set_values_f64(x, &ramp(6))?;
    let cfg = LayerConfig::new("split", LayerParams::Split(SplitParams::default()));
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &tops)?;
    layer.forward(&mut arena, &[x], &tops)?;

    for &t in &tops {
        assert_eq!(arena.shape(t)?.dims(), &[2, 3]);
        assert!(arena.is_alias(t, x)?);
        assert!(!arena.is_diff_alias(t, x)?);
        assert_eq!(arena.to_f64_values(t)?, arena.to_f64_values(x)?);
    }
    arena.fill_diff(tops[0], 1.0)?;
    arena.fill_diff(tops[1], 2.0)?;
    arena.set_diff_f64(tops[2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])?;
    layer.backward(&mut arena, &tops, &[true], &[x])?;
    assert_eq!(arena.to_f64_diff(x)?, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    Ok(())
}

// Pooling

fn pool_layer(pool: PoolMethod, tops: usize) -> Result<(Layer, BlobArena, BlobId, Vec<BlobId>)> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (1, 1, 4, 4))?;
    let values: Vec<f64> = (0..16).map(|i| i as f64).collect();
    arena.set_values_f64(x, &values)?;
    let top: Vec<BlobId> = (0..tops).map(|i| arena.create_empty(format!("pool_{i}"))).collect();
    let cfg = LayerConfig::new(
        "pool",
        LayerParams::Pooling(PoolingParams {
            pool,
            kernel_size: Some(2),
            stride: 2,
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &top)?;
    Ok((layer, arena, x, top))
}

#[test]
fn test_max_pooling_with_mask_top() -> Result<()> {
    let (mut layer, mut arena, x, top) = pool_layer(PoolMethod::Max, 2)?;
    layer.forward(&mut arena, &[x], &top)?;
    assert_eq!(arena.shape(top[0])?.dims(), &[1, 1, 2, 2]);
    assert_eq!(arena.to_f64_values(top[0])?, vec![5.0, 7.0, 13.0, 15.0]);
    assert_eq!(arena.to_f64_values(top[1])?, vec![5.0, 7.0, 13.0, 15.0]);

    arena.fill_diff(top[0], 1.0)?;
    layer.backward(&mut arena, &top, &[true], &[x])?;
    let dx = arena.to_f64_diff(x)?;
    for (i, d) in dx.iter().enumerate() {
        let expected = if [5, 7, 13, 15].contains(&i) { 1.0 } else { 0.0 };
        assert_eq!(*d, expected, "dx[{i}]");
    }
    Ok(())
}

#[test]
fn test_half_precision_index_top_rounds_but_backward_is_exact() -> Result<()> {
    let ctx = Context::new().with_precision(Precision::HALF);
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", (1, 1, 1, 2050))?;
    let tops = [arena.create_empty("pool"), arena.create_empty("argmax")];
    let cfg = LayerConfig::new(
        "pool",
        LayerParams::Pooling(PoolingParams {
            kernel_h: Some(1),
            kernel_w: Some(1),
            ..Default::default()
        }),
    );
    let mut layer = create_layer(&cfg, &ctx)?;
    layer.setup(&mut arena, &[x], &tops)?;
    layer.forward(&mut arena, &[x], &tops)?;
    let argmax = arena.to_f64_values(tops[1])?;
    assert_eq!(argmax[2047], 2047.0);
    // 2049 is not representable in f16
    assert_eq!(argmax[2049], 2048.0);

    let mut dy = vec![0.0; 2050];
    dy[2049] = 1.0;
    arena.set_diff_f64(tops[0], &dy)?;
    layer.backward(&mut arena, &tops, &[true], &[x])?;
    let dx = arena.to_f64_diff(x)?;
    assert_eq!(dx[2049], 1.0);
    assert_eq!(dx[2048], 0.0);
    Ok(())
}

#[test]
fn test_average_pooling() -> Result<()> {
    let (mut layer, mut arena, x, top) = pool_layer(PoolMethod::Ave, 1)?;
    layer.forward(&mut arena, &[x], &top)?;
    assert_vec_approx(&arena.to_f64_values(top[0])?, &[2.5, 4.5, 10.5, 12.5], 1e-6);

    arena.fill_diff(top[0], 4.0)?;
    layer.backward(&mut arena, &top, &[true], &[x])?;
    assert_vec_approx(&arena.to_f64_diff(x)?, &[1.0; 16], 1e-6);
    Ok(())
}

#[test]
fn test_average_pooling_rejects_mask_top() {
    assert!(matches!(
        pool_layer(PoolMethod::Ave, 2),
        Err(Error::Cardinality { .. })
    ));
}

// Script delegation and replication

struct Scale {
    factor: f32,
}

impl ScriptDelegate for Scale {
    fn setup(
        &mut self,
        param_str: &str,
        _bottom: &[ScriptBlob],
        _top: &[ScriptBlob],
    ) -> tessel::nn::DelegateResult {
        self.factor = param_str.parse()?;
        Ok(())
    }

    fn reshape(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> tessel::nn::DelegateResult {
        top[0].reshape(bottom[0].shape.clone());
        Ok(())
    }

    fn forward(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> tessel::nn::DelegateResult {
        if bottom[0].data.iter().any(|v| *v < 0.0) {
            return Err("negative input".into());
        }
        top[0].data = bottom[0].data.iter().map(|v| v * self.factor).collect();
        Ok(())
    }

    fn backward(
        &mut self,
        top: &[ScriptBlob],
        _propagate_down: &[bool],
        bottom: &mut [ScriptBlob],
    ) -> tessel::nn::DelegateResult {
        bottom[0].diff = top[0].diff.iter().map(|v| v * self.factor).collect();
        Ok(())
    }
}

fn scripts() -> ScriptRegistry {
    let mut registry = ScriptRegistry::new();
    registry.register("ops.Scale", |_: &ScriptParams| {
        Ok(Box::new(Scale { factor: 1.0 }) as Box<dyn ScriptDelegate>)
    });
    registry
}

fn scale_config() -> LayerConfig {
    LayerConfig::new(
        "scale",
        LayerParams::Script(ScriptParams {
            module: "ops".into(),
            layer: "Scale".into(),
            param_str: "3".into(),
            share_in_parallel: false,
        }),
    )
}

#[test]
fn test_script_layer_delegates() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", 3)?;
    let y = arena.create_empty("y");
    arena.set_values_f64(x, &[1.0, 2.0, 3.0])?;
    let mut layer = create_layer_with_scripts(&scale_config(), &ctx, &scripts())?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;
    assert_eq!(arena.to_f64_values(y)?, vec![3.0, 6.0, 9.0]);

    arena.fill_diff(y, 1.0)?;
    layer.backward(&mut arena, &[y], &[true], &[x])?;
    assert_eq!(arena.to_f64_diff(x)?, vec![3.0; 3]);
    Ok(())
}

#[test]
fn test_script_failure_leaves_tops_unchanged() -> Result<()> {
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let x = arena.create("x", 3)?;
    let y = arena.create_empty("y");
    arena.set_values_f64(x, &[1.0, 2.0, 3.0])?;
    let mut layer = create_layer_with_scripts(&scale_config(), &ctx, &scripts())?;
    layer.setup(&mut arena, &[x], &[y])?;
    layer.forward(&mut arena, &[x], &[y])?;

    arena.set_values_f64(x, &[1.0, -2.0, 3.0])?;
    match layer.forward(&mut arena, &[x], &[y]) {
        Err(Error::Delegate { layer, message }) => {
            assert_eq!(layer, "scale");
            assert_eq!(message, "negative input");
        }
        other => panic!("expected delegate error, got {other:?}"),
    }
    assert_eq!(arena.to_f64_values(y)?, vec![3.0, 6.0, 9.0]);
    Ok(())
}

#[test]
fn test_non_shareable_layer_refuses_replication() -> Result<()> {
    let train = Context::new().with_solver_count(2);
    let mut arena = BlobArena::new(train.precision);
    let x = arena.create("x", 3)?;
    let y = arena.create_empty("y");
    let mut layer = create_layer_with_scripts(&scale_config(), &train, &scripts())?;
    assert!(matches!(
        layer.setup(&mut arena, &[x], &[y]),
        Err(Error::Config { .. })
    ));
    assert!(ensure_replicable(&[layer], 2).is_err());

    // a single solver, or the test phase, is fine
    let test = Context::new().with_solver_count(2).with_phase(Phase::Test);
    let mut layer = create_layer_with_scripts(&scale_config(), &test, &scripts())?;
    layer.setup(&mut arena, &[x], &[y])?;
    assert!(ensure_replicable(&[layer], 1).is_ok());

    let relu = create_layer(
        &LayerConfig::new("relu", LayerParams::ReLU(ReluParams::default())),
        &train,
    )?;
    assert!(ensure_replicable(&[relu], 4).is_ok());
    Ok(())
}

// Configuration records

#[test]
fn test_layers_from_json_records() -> Result<()> {
    let configs = tessel::nn::configs_from_json(
        r#"[
            {"name": "ip1", "type": "InnerProduct", "bottom": ["data"], "top": ["ip1"],
             "num_output": 4, "weight_filler": {"type": "constant", "value": 0.25}},
            {"name": "relu1", "type": "ReLU", "bottom": ["ip1"], "top": ["ip1"]},
            {"name": "prob", "type": "Softmax", "bottom": ["ip1"], "top": ["prob"]}
        ]"#,
    )?;
    let ctx = Context::new();
    let mut arena = BlobArena::new(ctx.precision);
    let data = arena.create("data", (3, 8))?;
    arena.fill_values(data, 1.0)?;
    let blob = |name: &str, arena: &mut BlobArena| {
        arena.find(name).unwrap_or_else(|| arena.create_empty(name))
    };

    for cfg in &configs {
        let bottom: Vec<BlobId> = cfg.bottom.iter().map(|n| blob(n, &mut arena)).collect();
        let top: Vec<BlobId> = cfg.top.iter().map(|n| blob(n, &mut arena)).collect();
        let mut layer = create_layer(cfg, &ctx)?;
        layer.setup(&mut arena, &bottom, &top)?;
        layer.forward(&mut arena, &bottom, &top)?;
    }
    let last = arena.find("prob").ok_or_else(|| Error::msg("prob was never created"))?;
    assert_eq!(arena.shape(last)?.dims(), &[3, 4]);
    assert_vec_approx(&arena.to_f64_values(last)?, &[0.25; 12], 1e-6);
    Ok(())
}
