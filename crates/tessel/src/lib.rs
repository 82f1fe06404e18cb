//! # tessel
//!
//! A layer execution engine with a mixed-precision numeric model.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessel::prelude::*;
//!
//! let ctx = Context::new().with_precision(Precision::HALF).with_seed(1);
//! let mut arena = BlobArena::new(ctx.precision);
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `tessel-core` | Shape, DType, Precision, blobs and the BlobArena |
//! | `tessel-accel` | Accelerator device: descriptor lifecycle and device kernels |
//! | `tessel-nn` | Layer contract, operator kinds, accelerator strategies, Script delegation |
//!
//! ## Modules
//!
//! - [`weights`]: save and load layer parameters

/// Re-export core types.
pub use tessel_core::{
    dispatch_precision, Accumulator, Blob, BlobArena, BlobId, DType, Element, Error, Precision,
    Result, Shape, Storage,
};

/// The half-precision element types used for `F16` and `BF16` storage.
pub use tessel_core::half;

/// Re-export the accelerator device.
pub mod accel {
    pub use tessel_accel::*;
}

/// Re-export layers.
pub mod nn {
    pub use tessel_nn::*;
}

/// Weights: binary parameter persistence.
pub mod weights;

/// Install a `tracing` subscriber printing to stderr, filtered by `RUST_LOG`
/// (default `info`). Calling it again is a no-op.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Prelude: import everything commonly needed.
pub mod prelude {
    pub use crate::accel::{AccelConfig, AccelDevice};
    pub use crate::nn::{
        create_layer, create_layer_with_scripts, ensure_replicable, Context, Engine, Layer,
        LayerConfig, LayerKind, LayerParams, LayerState, Mode, Phase, ScriptRegistry,
    };
    pub use crate::weights;
    pub use crate::{BlobArena, BlobId, DType, Error, Precision, Result, Shape};
}
