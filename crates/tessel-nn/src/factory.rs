// Layer factory - build a Layer from its configuration record
//
// ENGINE SELECTION:
//
//   Engine::Host         host operator only
//   Engine::Default      plus the accelerator strategy when the kind has one
//                        and the context holds a device
//   Engine::Accelerator  the strategy is required; a kind without a device
//                        path or a context without a device is a config error
//
// The strategy is composed in regardless of the context's Mode; the mode only
// decides which path forward/backward take, and may be switched later.

use tessel_core::{Error, Result};

use crate::accel::{AccelActivation, AccelPooling, AccelSoftmax};
use crate::activation::Activation;
use crate::config::{Engine, LayerConfig, LayerParams};
use crate::context::Context;
use crate::inner_product::InnerProduct;
use crate::layer::{AccelStrategy, Layer, Operator};
use crate::mask::Mask;
use crate::pooling::Pooling;
use crate::reshape::Reshape;
use crate::script::ScriptRegistry;
use crate::softmax::Softmax;
use crate::split::Split;

/// Build a layer in the `Constructed` state. Script layers need
/// [`create_layer_with_scripts`].
pub fn create_layer(config: &LayerConfig, ctx: &Context) -> Result<Layer> {
    build(config, ctx, None)
}

/// Like [`create_layer`], resolving Script delegates through `scripts`.
pub fn create_layer_with_scripts(
    config: &LayerConfig,
    ctx: &Context,
    scripts: &ScriptRegistry,
) -> Result<Layer> {
    build(config, ctx, Some(scripts))
}

fn build(config: &LayerConfig, ctx: &Context, scripts: Option<&ScriptRegistry>) -> Result<Layer> {
    let name = config.name.as_str();
    let op: Box<dyn Operator> = match &config.params {
        LayerParams::InnerProduct(p) => Box::new(InnerProduct::new(p.clone())),
        LayerParams::Mask(p) => Box::new(Mask::new(p.clone())),
        LayerParams::Softmax(p) => Box::new(Softmax::new(p.clone())),
        LayerParams::Reshape(p) => Box::new(Reshape::new(p.clone())),
        LayerParams::ReLU(p) => Box::new(Activation::relu(p.negative_slope)),
        LayerParams::Sigmoid => Box::new(Activation::sigmoid()),
        LayerParams::TanH => Box::new(Activation::tanh()),
        LayerParams::Pooling(p) => Box::new(Pooling::new(p.clone())),
        LayerParams::Split(p) => Box::new(Split::new(p.clone())),
        LayerParams::Script(p) => {
            let scripts = scripts.ok_or_else(|| {
                Error::config(name, "Script layers need a script registry")
            })?;
            Box::new(scripts.instantiate(name, p)?)
        }
    };

    let kind = config.kind();
    let accel = match config.engine {
        Engine::Host => None,
        Engine::Default => match &ctx.device {
            // the argmax top of max pooling only exists on the host
            Some(_) if kind.has_accelerator() && !is_multi_top_pooling(config) => {
                accel_strategy(config, ctx)
            }
            _ => None,
        },
        Engine::Accelerator => {
            if !kind.has_accelerator() {
                return Err(Error::config(
                    name,
                    format!("{kind} layers have no accelerator implementation"),
                ));
            }
            if ctx.device.is_none() {
                return Err(Error::config(
                    name,
                    "accelerator engine requested but the context has no device",
                ));
            }
            accel_strategy(config, ctx)
        }
    };

    tracing::debug!(
        layer = name,
        %kind,
        accelerator = accel.is_some(),
        "layer created"
    );
    Ok(Layer::from_parts(config.clone(), ctx, op, accel))
}

fn is_multi_top_pooling(config: &LayerConfig) -> bool {
    matches!(config.params, LayerParams::Pooling(_)) && config.top.len() > 1
}

fn accel_strategy(config: &LayerConfig, ctx: &Context) -> Option<Box<dyn AccelStrategy>> {
    let device = ctx.device.clone()?;
    let strategy: Box<dyn AccelStrategy> = match &config.params {
        LayerParams::Softmax(p) => Box::new(AccelSoftmax::new(device, p.axis)),
        LayerParams::ReLU(p) => Box::new(AccelActivation::new(
            device,
            tessel_accel::ActivationMode::Relu {
                negative_slope: p.negative_slope,
            },
        )),
        LayerParams::Sigmoid => Box::new(AccelActivation::new(
            device,
            tessel_accel::ActivationMode::Sigmoid,
        )),
        LayerParams::TanH => Box::new(AccelActivation::new(device, tessel_accel::ActivationMode::Tanh)),
        LayerParams::Pooling(p) => Box::new(AccelPooling::new(device, p.clone())),
        _ => return None,
    };
    Some(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolingParams, ScriptParams, SoftmaxParams};
    use tessel_accel::AccelDevice;

    #[test]
    fn test_engine_rules() -> Result<()> {
        let softmax = LayerConfig::new("prob", LayerParams::Softmax(SoftmaxParams::default()));
        let host_ctx = Context::new();
        assert!(!create_layer(&softmax, &host_ctx)?.has_accelerator());
        assert!(matches!(
            create_layer(&softmax.clone().with_engine(Engine::Accelerator), &host_ctx),
            Err(Error::Config { .. })
        ));

        let ctx = Context::new().with_device(AccelDevice::new(0)?);
        assert!(create_layer(&softmax, &ctx)?.has_accelerator());
        assert!(!create_layer(&softmax.clone().with_engine(Engine::Host), &ctx)?.has_accelerator());

        let split = LayerConfig::new("split", LayerParams::Split(Default::default()))
            .with_engine(Engine::Accelerator);
        assert!(matches!(create_layer(&split, &ctx), Err(Error::Config { .. })));
        Ok(())
    }

    #[test]
    fn test_pooling_with_mask_top_stays_on_host() -> Result<()> {
        let ctx = Context::new().with_device(AccelDevice::new(0)?);
        let pool = LayerConfig::new(
            "pool",
            LayerParams::Pooling(PoolingParams {
                kernel_size: Some(2),
                ..Default::default()
            }),
        )
        .with_top(["pooled", "mask"]);
        assert!(!create_layer(&pool, &ctx)?.has_accelerator());
        Ok(())
    }

    #[test]
    fn test_script_needs_registry() {
        let cfg = LayerConfig::new("py", LayerParams::Script(ScriptParams::default()));
        assert!(matches!(
            create_layer(&cfg, &Context::new()),
            Err(Error::Config { .. })
        ));
    }
}
