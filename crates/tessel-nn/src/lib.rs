//! # tessel-nn
//!
//! The layer execution contract and the operator kinds built on it.
//!
//! A graph builder turns each [`LayerConfig`] into a [`Layer`] with
//! [`create_layer`], then drives it through the lifecycle against a shared
//! [`BlobArena`](tessel_core::BlobArena):
//!
//! ```ignore
//! let ctx = Context::new().with_seed(7);
//! let mut arena = BlobArena::new(ctx.precision);
//! let data = arena.create("data", (2, 3, 4, 5))?;
//! let ip = arena.create_empty("ip1");
//!
//! let cfg = LayerConfig::from_json(r#"{"name": "ip1", "type": "InnerProduct", "num_output": 10}"#)?;
//! let mut layer = create_layer(&cfg, &ctx)?;
//! layer.setup(&mut arena, &[data], &[ip])?;   // params created, tops shaped
//! layer.forward(&mut arena, &[data], &[ip])?;
//! ```
//!
//! Kinds: InnerProduct, Mask, Softmax, Reshape, ReLU, Sigmoid, TanH, Pooling,
//! Split and Script. Softmax, the activations and Pooling also have an
//! accelerator path, composed in when the [`Context`] holds a device.

pub mod accel;
pub mod activation;
pub mod config;
pub mod context;
pub mod factory;
pub mod filler;
pub mod inner_product;
pub mod layer;
pub mod mask;
pub mod pooling;
pub mod replicate;
pub mod reshape;
pub mod script;
pub mod softmax;
pub mod split;

pub use accel::{AccelActivation, AccelPooling, AccelSoftmax};
pub use activation::Activation;
pub use config::{
    configs_from_json, Engine, FillerConfig, InnerProductParams, LayerConfig, LayerKind,
    LayerParams, MaskParams, Phase, PoolMethod, PoolingParams, ReluParams, ReshapeParams, ScriptParams,
    SoftmaxParams, SplitParams,
};
pub use context::{Context, Mode};
pub use factory::{create_layer, create_layer_with_scripts};
pub use inner_product::InnerProduct;
pub use layer::{AccelStrategy, Count, Layer, LayerEnv, LayerState, Operator};
pub use mask::Mask;
pub use pooling::{PoolGeometry, PoolSpec, Pooling};
pub use replicate::ensure_replicable;
pub use reshape::Reshape;
pub use script::{BoxError, DelegateResult, Script, ScriptBlob, ScriptDelegate, ScriptRegistry};
pub use softmax::Softmax;
pub use split::Split;
