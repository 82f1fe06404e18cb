// Descriptor registry - acquire/release lifecycle of device-side objects
//
// Every descriptor a layer creates (tensor layout, pooling mode, activation
// mode, and the device handle itself) is registered here on acquisition and
// unregistered when the owning value is dropped. Release therefore happens
// exactly once, on every exit path: a setup that fails half-way drops the
// descriptors it already holds and the registry sees them go.
//
// The registry keeps a live count (checked by tests for leaks) and cumulative
// acquire/release counters, plus an optional cap on live descriptors that
// makes acquisition fail with a resource error.
//
//   let t = device.create_tensor_descriptor()?;   // live += 1
//   t.set_4d(DType::F32, n, c, h, w)?;            // reconfigure, no acquire
//   drop(t);                                      // live -= 1

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tessel_core::{DType, Error, Result};

/// Kind of a registered device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Handle,
    Tensor,
    Pooling,
    Activation,
}

/// Snapshot of the registry's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorStats {
    /// Descriptors currently alive.
    pub live: usize,
    /// Cumulative successful acquisitions.
    pub acquired: u64,
    /// Cumulative releases.
    pub released: u64,
    /// Cumulative acquisitions refused by the cap.
    pub refused: u64,
}

#[derive(Debug)]
pub(crate) struct Registry {
    live: Mutex<usize>,
    max_live: Option<usize>,
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    refused: AtomicU64,
}

impl Registry {
    pub(crate) fn new(max_live: Option<usize>) -> Self {
        Registry {
            live: Mutex::new(0),
            max_live,
            next_id: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    // A panic while holding the count cannot leave it inconsistent (it is a
    // single integer), so a poisoned lock is recovered rather than reported.
    fn live_guard(&self) -> MutexGuard<'_, usize> {
        match self.live.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn acquire(self: &Arc<Self>, kind: DescriptorKind) -> Result<RawDescriptor> {
        let mut live = self.live_guard();
        if let Some(max) = self.max_live {
            if *live >= max {
                self.refused.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Resource(format!(
                    "cannot create {kind:?} descriptor: {max} descriptors already live"
                )));
            }
        }
        *live += 1;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, ?kind, live = *live, "descriptor acquired");
        Ok(RawDescriptor {
            id,
            kind,
            registry: Arc::clone(self),
        })
    }

    fn release(&self, id: u64, kind: DescriptorKind) {
        let mut live = self.live_guard();
        *live = live.saturating_sub(1);
        self.released.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, ?kind, live = *live, "descriptor released");
    }

    pub(crate) fn live(&self) -> usize {
        *self.live_guard()
    }

    pub(crate) fn stats(&self) -> DescriptorStats {
        DescriptorStats {
            live: self.live(),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

/// A registered device object. Dropping it releases the registration.
#[derive(Debug)]
pub struct RawDescriptor {
    id: u64,
    kind: DescriptorKind,
    registry: Arc<Registry>,
}

impl RawDescriptor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }
}

impl Drop for RawDescriptor {
    fn drop(&mut self) {
        self.registry.release(self.id, self.kind);
    }
}

// Typed descriptors

/// Device handle: the execution context kernels are launched on.
#[derive(Debug)]
pub struct Handle {
    raw: RawDescriptor,
}

impl Handle {
    pub(crate) fn new(raw: RawDescriptor) -> Self {
        Handle { raw }
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }
}

/// Layout of a 4-D tensor: dims (n, c, h, w), element strides and dtype.
#[derive(Debug)]
pub struct TensorDescriptor {
    raw: RawDescriptor,
    dtype: DType,
    dims: [usize; 4],
    strides: [usize; 4],
}

impl TensorDescriptor {
    pub(crate) fn new(raw: RawDescriptor) -> Self {
        TensorDescriptor {
            raw,
            dtype: DType::F32,
            dims: [0; 4],
            strides: [0; 4],
        }
    }

    /// Describe a packed NCHW tensor.
    pub fn set_4d(&mut self, dtype: DType, n: usize, c: usize, h: usize, w: usize) -> Result<()> {
        self.set_4d_strided(dtype, [n, c, h, w], [c * h * w, h * w, w, 1])
    }

    /// Describe a tensor with explicit element strides.
    pub fn set_4d_strided(&mut self, dtype: DType, dims: [usize; 4], strides: [usize; 4]) -> Result<()> {
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::Resource(format!(
                "tensor descriptor dims must be positive, got {dims:?}"
            )));
        }
        self.dtype = dtype;
        self.dims = dims;
        self.strides = strides;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }

    /// Number of elements described.
    pub fn count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Whether the strides describe a packed NCHW layout.
    pub fn is_packed(&self) -> bool {
        let [_, c, h, w] = self.dims;
        self.strides == [c * h * w, h * w, w, 1]
    }
}

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMode {
    Max,
    /// Average over the window including padded positions.
    AverageIncludePadding,
}

/// Pooling window geometry and mode.
#[derive(Debug)]
pub struct PoolingDescriptor {
    raw: RawDescriptor,
    mode: PoolingMode,
    window: (usize, usize),
    pad: (usize, usize),
    stride: (usize, usize),
}

impl PoolingDescriptor {
    pub(crate) fn new(raw: RawDescriptor) -> Self {
        PoolingDescriptor {
            raw,
            mode: PoolingMode::Max,
            window: (1, 1),
            pad: (0, 0),
            stride: (1, 1),
        }
    }

    pub fn set_2d(
        &mut self,
        mode: PoolingMode,
        window: (usize, usize),
        pad: (usize, usize),
        stride: (usize, usize),
    ) -> Result<()> {
        if window.0 == 0 || window.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(Error::Resource(format!(
                "pooling descriptor needs positive window and stride, got {window:?} / {stride:?}"
            )));
        }
        self.mode = mode;
        self.window = window;
        self.pad = pad;
        self.stride = stride;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn mode(&self) -> PoolingMode {
        self.mode
    }

    pub fn window(&self) -> (usize, usize) {
        self.window
    }

    pub fn pad(&self) -> (usize, usize) {
        self.pad
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }
}

/// Element-wise activation function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationMode {
    /// Rectifier; negative inputs are scaled by the slope.
    Relu { negative_slope: f64 },
    Sigmoid,
    Tanh,
}

/// Activation function descriptor.
#[derive(Debug)]
pub struct ActivationDescriptor {
    raw: RawDescriptor,
    mode: ActivationMode,
}

impl ActivationDescriptor {
    pub(crate) fn new(raw: RawDescriptor) -> Self {
        ActivationDescriptor {
            raw,
            mode: ActivationMode::Relu {
                negative_slope: 0.0,
            },
        }
    }

    pub fn set(&mut self, mode: ActivationMode) {
        self.mode = mode;
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }
}
