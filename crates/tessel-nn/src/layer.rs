// Layer - the execution contract every operator is run through
//
// A Layer is one operator instance bound to a configuration record. The graph
// scheduler drives it through a fixed lifecycle:
//
//   Constructed --setup--> SetUp --reshape--> Ready <--> ShapeStale
//                                               |
//                                  forward / backward (many times)
//
// and drops it with its graph.
//
// ARCHITECTURE:
//
//   Layer (one struct for every kind)
//     ├── op: Box<dyn Operator>            the kind: host math, params, shapes
//     └── accel: Option<Box<dyn AccelStrategy>>
//                                          device path, composed in by the
//                                          factory when a device is available
//
//   forward/backward dispatch on the layer's Mode: Accelerator with a
//   strategy present runs the device path, anything else runs the host path.
//   Both paths produce the same results within the compute type's tolerance.
//
// BLOBS:
//
//   Layers never own activation blobs; they receive BlobId handles into the
//   graph's BlobArena on every call. Parameter blobs are created in the same
//   arena by the operator at setup and are only reshaped afterwards.
//
// PRECISION:
//
//   The arena fixes the storage type; the layer's Precision fixes the compute
//   type. Operators turn the pair into concrete types with
//   dispatch_precision! and cross between them only via load/store.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tessel_core::{BlobArena, BlobId, Error, Precision, Result, Shape};

use crate::config::{LayerConfig, LayerKind, Phase};
use crate::context::{Context, Mode};

/// Allowed number of bottom or top blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive range.
    Range(usize, usize),
}

impl Count {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Count::Exact(k) => n == k,
            Count::AtLeast(k) => n >= k,
            Count::Range(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Count::Exact(k) => write!(f, "exactly {k}"),
            Count::AtLeast(k) => write!(f, "at least {k}"),
            Count::Range(lo, hi) => write!(f, "{lo} to {hi}"),
        }
    }
}

/// Lifecycle state of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Constructed,
    SetUp,
    Ready,
    ShapeStale,
}

impl LayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerState::Constructed => "Constructed",
            LayerState::SetUp => "SetUp",
            LayerState::Ready => "Ready",
            LayerState::ShapeStale => "ShapeStale",
        }
    }
}

/// What an operator sees of its layer during a call.
#[derive(Debug, Clone, Copy)]
pub struct LayerEnv<'a> {
    pub name: &'a str,
    pub phase: Phase,
    pub precision: Precision,
    /// One flag per parameter blob: accumulate its gradient in backward.
    pub param_propagate_down: &'a [bool],
}

/// The per-kind part of a layer: shapes, parameters and the host math.
pub trait Operator: Send {
    fn kind(&self) -> LayerKind;

    fn bottom_count(&self) -> Count;

    fn top_count(&self) -> Count;

    /// Whether a top may be the same blob as a bottom.
    fn allows_in_place(&self) -> bool {
        true
    }

    /// Whether the layer may run in replicated (data-parallel) graphs.
    fn share_in_parallel(&self) -> bool {
        true
    }

    /// One-time setup: validate parameters and create parameter blobs.
    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        rng: &mut StdRng,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    /// Shape inference: reshape tops from the current bottom shapes.
    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    fn forward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    fn backward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()>;

    /// Parameter blobs, in persistence order.
    fn params(&self) -> Vec<BlobId> {
        Vec::new()
    }
}

/// Device path of a layer, composed into it rather than derived from it.
///
/// A strategy owns its device descriptors. They are acquired in `setup`
/// (all or none), reconfigured in `reshape` and released when the strategy
/// is dropped.
pub trait AccelStrategy: Send {
    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    fn forward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()>;

    fn backward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()>;

    /// Whether setup completed and descriptors are held.
    fn is_set_up(&self) -> bool;
}

/// One operator instance in a graph.
pub struct Layer {
    config: LayerConfig,
    kind: LayerKind,
    phase: Phase,
    precision: Precision,
    mode: Mode,
    solver_count: usize,
    rng: StdRng,
    op: Box<dyn Operator>,
    accel: Option<Box<dyn AccelStrategy>>,
    state: LayerState,
    param_propagate_down: Vec<bool>,
    bottom_shapes: Vec<Shape>,
}

// FNV-1a, to give every layer its own filler stream from one seed.
fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

impl Layer {
    /// Assemble a layer from its parts. Most callers use
    /// [`create_layer`](crate::create_layer) instead.
    pub fn from_parts(
        config: LayerConfig,
        ctx: &Context,
        op: Box<dyn Operator>,
        accel: Option<Box<dyn AccelStrategy>>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(ctx.seed ^ name_hash(&config.name));
        Layer {
            kind: op.kind(),
            config,
            phase: ctx.phase,
            precision: ctx.precision,
            mode: ctx.mode,
            solver_count: ctx.solver_count,
            rng,
            op,
            accel,
            state: LayerState::Constructed,
            param_propagate_down: Vec::new(),
            bottom_shapes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Whether an accelerator strategy was composed into this layer.
    pub fn has_accelerator(&self) -> bool {
        self.accel.is_some()
    }

    pub fn share_in_parallel(&self) -> bool {
        self.op.share_in_parallel()
    }

    pub fn params(&self) -> Vec<BlobId> {
        self.op.params()
    }

    pub fn param_propagate_down(&self, i: usize) -> bool {
        self.param_propagate_down.get(i).copied().unwrap_or(false)
    }

    pub fn set_param_propagate_down(&mut self, i: usize, value: bool) {
        if let Some(flag) = self.param_propagate_down.get_mut(i) {
            *flag = value;
        }
    }

    /// Record that an input shape may have changed; forward refuses to run
    /// until `reshape` is called.
    pub fn mark_stale(&mut self) {
        if matches!(self.state, LayerState::Ready) {
            self.state = LayerState::ShapeStale;
        }
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            layer: self.config.name.clone(),
            op,
            state: self.state.as_str(),
        }
    }

    fn use_accelerator(&self) -> bool {
        self.mode == Mode::Accelerator && self.accel.is_some()
    }

    /// One-time setup followed by the first shape inference.
    pub fn setup(&mut self, arena: &mut BlobArena, bottom: &[BlobId], top: &[BlobId]) -> Result<()> {
        if self.state != LayerState::Constructed {
            return Err(self.invalid_state("setup"));
        }
        self.check_counts(bottom, top)?;
        self.check_in_place(bottom, top)?;
        self.check_replication()?;
        if arena.precision().storage() != self.precision.storage() {
            return Err(Error::config(
                &self.config.name,
                format!(
                    "layer precision {} does not match arena storage {}",
                    self.precision,
                    arena.precision().storage()
                ),
            ));
        }
        tracing::debug!(
            layer = %self.config.name,
            kind = %self.kind,
            precision = %self.precision,
            "setting up"
        );

        let env = LayerEnv {
            name: &self.config.name,
            phase: self.phase,
            precision: self.precision,
            param_propagate_down: &[],
        };
        self.op.setup(&env, &mut self.rng, arena, bottom, top)?;
        self.param_propagate_down = vec![true; self.op.params().len()];
        self.state = LayerState::SetUp;

        if let Some(accel) = self.accel.as_mut() {
            let env = LayerEnv {
                name: &self.config.name,
                phase: self.phase,
                precision: self.precision,
                param_propagate_down: &self.param_propagate_down,
            };
            accel.setup(&env, arena, bottom, top)?;
            if self.mode == Mode::Host {
                tracing::warn!(
                    layer = %self.config.name,
                    "accelerator path available but layer runs on host"
                );
            }
        }
        self.reshape(arena, bottom, top)
    }

    /// Shape inference: recompute top shapes from the current bottoms.
    pub fn reshape(&mut self, arena: &mut BlobArena, bottom: &[BlobId], top: &[BlobId]) -> Result<()> {
        if self.state == LayerState::Constructed {
            return Err(self.invalid_state("reshape"));
        }
        self.check_counts(bottom, top)?;
        let env = LayerEnv {
            name: &self.config.name,
            phase: self.phase,
            precision: self.precision,
            param_propagate_down: &self.param_propagate_down,
        };
        self.op.reshape(&env, arena, bottom, top)?;
        if let Some(accel) = self.accel.as_mut() {
            accel.reshape(&env, arena, bottom, top)?;
        }
        self.bottom_shapes = bottom
            .iter()
            .map(|&b| arena.shape(b).cloned())
            .collect::<Result<_>>()?;
        for &t in top {
            let (name, shape) = (arena.name(t)?, arena.shape(t)?);
            tracing::debug!(layer = %self.config.name, top = %name, %shape, "top shape");
        }
        self.state = LayerState::Ready;
        Ok(())
    }

    /// Compute tops from bottoms and parameters.
    pub fn forward(&mut self, arena: &mut BlobArena, bottom: &[BlobId], top: &[BlobId]) -> Result<()> {
        self.check_ready("forward", arena, bottom)?;
        self.check_counts(bottom, top)?;
        let accel = self.use_accelerator();
        tracing::trace!(layer = %self.config.name, accel, "forward");
        let env = LayerEnv {
            name: &self.config.name,
            phase: self.phase,
            precision: self.precision,
            param_propagate_down: &self.param_propagate_down,
        };
        match self.accel.as_mut() {
            Some(strategy) if accel => strategy.forward(&env, arena, bottom, top),
            _ => self.op.forward_host(&env, arena, bottom, top),
        }
    }

    /// Propagate top gradients into parameter gradients (accumulated) and,
    /// where `propagate_down[i]` is set, into bottom `i`'s gradient (written).
    pub fn backward(
        &mut self,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        self.check_ready("backward", arena, bottom)?;
        self.check_counts(bottom, top)?;
        if propagate_down.len() != bottom.len() {
            return Err(Error::config(
                &self.config.name,
                format!(
                    "backward got {} propagate flags for {} bottoms",
                    propagate_down.len(),
                    bottom.len()
                ),
            ));
        }
        let accel = self.use_accelerator();
        tracing::trace!(layer = %self.config.name, accel, ?propagate_down, "backward");
        let env = LayerEnv {
            name: &self.config.name,
            phase: self.phase,
            precision: self.precision,
            param_propagate_down: &self.param_propagate_down,
        };
        match self.accel.as_mut() {
            Some(strategy) if accel => strategy.backward(&env, arena, top, propagate_down, bottom),
            _ => self
                .op
                .backward_host(&env, arena, top, propagate_down, bottom),
        }
    }

    // Validation

    fn check_counts(&self, bottom: &[BlobId], top: &[BlobId]) -> Result<()> {
        for (side, count, got) in [
            ("bottom", self.op.bottom_count(), bottom.len()),
            ("top", self.op.top_count(), top.len()),
        ] {
            if !count.accepts(got) {
                return Err(Error::Cardinality {
                    layer: self.config.name.clone(),
                    kind: self.kind.as_str(),
                    side,
                    expected: count.to_string(),
                    got,
                });
            }
        }
        Ok(())
    }

    fn check_in_place(&self, bottom: &[BlobId], top: &[BlobId]) -> Result<()> {
        if self.op.allows_in_place() {
            return Ok(());
        }
        if let Some(t) = top.iter().find(|t| bottom.contains(t)) {
            return Err(Error::config(
                &self.config.name,
                format!("{} layers cannot run in place (blob {t})", self.kind),
            ));
        }
        Ok(())
    }

    fn check_replication(&self) -> Result<()> {
        if self.phase == Phase::Train && self.solver_count > 1 && !self.op.share_in_parallel() {
            return Err(Error::config(
                &self.config.name,
                format!(
                    "{} layer is not shareable across {} parallel solvers",
                    self.kind, self.solver_count
                ),
            ));
        }
        Ok(())
    }

    fn check_ready(&mut self, op: &'static str, arena: &BlobArena, bottom: &[BlobId]) -> Result<()> {
        match self.state {
            LayerState::Ready => {}
            LayerState::ShapeStale => {
                return Err(Error::StaleShape {
                    layer: self.config.name.clone(),
                })
            }
            _ => return Err(self.invalid_state(op)),
        }
        let unchanged = bottom.len() == self.bottom_shapes.len()
            && bottom
                .iter()
                .zip(&self.bottom_shapes)
                .all(|(&b, seen)| arena.shape(b).map_or(false, |s| s == seen));
        if !unchanged {
            self.state = LayerState::ShapeStale;
            return Err(Error::StaleShape {
                layer: self.config.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.config.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("precision", &self.precision)
            .field("accelerator", &self.accel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_accepts() {
        assert!(Count::Exact(1).accepts(1));
        assert!(!Count::Exact(1).accepts(2));
        assert!(Count::AtLeast(1).accepts(5));
        assert!(!Count::AtLeast(1).accepts(0));
        assert!(Count::Range(1, 2).accepts(2));
        assert!(!Count::Range(1, 2).accepts(3));
        assert_eq!(Count::Range(1, 2).to_string(), "1 to 2");
    }

    #[test]
    fn test_name_hash_differs() {
        assert_ne!(name_hash("ip1"), name_hash("ip2"));
    }
}
