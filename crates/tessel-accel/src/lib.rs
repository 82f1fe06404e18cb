// Accelerator device - descriptor lifecycle plus data-parallel device kernels
//
// The accelerator is a device with its own execution resources (a dedicated
// rayon thread pool) and an explicit object lifecycle: layers that run on it
// acquire a handle and descriptors describing tensor layouts and operation
// modes, reconfigure them when shapes change, and release them by dropping.
//
// ARCHITECTURE:
// - AccelDevice wraps an Arc'd inner (thread pool + descriptor registry);
//   cloning a device is cheap and clones share the registry
// - Descriptors are RAII values registered on creation and unregistered on
//   drop (see descriptor.rs), so leaks are visible through live_descriptors()
// - Kernel entry points validate the descriptors against the slices they are
//   given, then run inside the pool; the pool joins before returning, so all
//   writes are complete when a call returns
//
// USAGE:
//   let device = AccelDevice::new(0)?;
//   let handle = device.create_handle()?;
//   let mut desc = device.create_tensor_descriptor()?;
//   desc.set_4d(DType::F32, n, c, h, w)?;
//   device.softmax_forward::<f32, f32>(&handle, &desc, &x, &desc, &mut y)?;

pub mod descriptor;
mod kernels;

use std::fmt;
use std::sync::Arc;

use tessel_core::{Accumulator, Element, Error, Result};

pub use descriptor::{
    ActivationDescriptor, ActivationMode, DescriptorKind, DescriptorStats, Handle,
    PoolingDescriptor, PoolingMode, RawDescriptor, TensorDescriptor,
};
use descriptor::Registry;
use kernels::PoolGeometry;

/// Construction options for an [`AccelDevice`].
#[derive(Debug, Clone, Default)]
pub struct AccelConfig {
    /// Device ordinal, used to name the worker threads.
    pub ordinal: usize,
    /// Worker threads; rayon's default when `None`.
    pub num_threads: Option<usize>,
    /// Cap on simultaneously live descriptors; unlimited when `None`.
    pub max_descriptors: Option<usize>,
}

struct DeviceInner {
    ordinal: usize,
    pool: rayon::ThreadPool,
    registry: Arc<Registry>,
}

/// An accelerator device. Clonable (uses Arc internally).
#[derive(Clone)]
pub struct AccelDevice {
    inner: Arc<DeviceInner>,
}

impl AccelDevice {
    /// Create a device with default options.
    pub fn new(ordinal: usize) -> Result<Self> {
        AccelDevice::with_config(AccelConfig {
            ordinal,
            ..Default::default()
        })
    }

    pub fn with_config(config: AccelConfig) -> Result<Self> {
        let ordinal = config.ordinal;
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(move |i| format!("tessel-accel-{ordinal}-{i}"));
        if let Some(n) = config.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::Resource(format!("device {ordinal} thread pool: {e}")))?;
        tracing::debug!(
            ordinal,
            threads = pool.current_num_threads(),
            max_descriptors = ?config.max_descriptors,
            "accelerator device created"
        );
        Ok(AccelDevice {
            inner: Arc::new(DeviceInner {
                ordinal,
                pool,
                registry: Arc::new(Registry::new(config.max_descriptors)),
            }),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub fn num_threads(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    // Descriptor lifecycle

    /// Descriptors (including handles) currently alive on this device.
    pub fn live_descriptors(&self) -> usize {
        self.inner.registry.live()
    }

    pub fn descriptor_stats(&self) -> DescriptorStats {
        self.inner.registry.stats()
    }

    pub fn create_handle(&self) -> Result<Handle> {
        Ok(Handle::new(self.inner.registry.acquire(DescriptorKind::Handle)?))
    }

    pub fn create_tensor_descriptor(&self) -> Result<TensorDescriptor> {
        Ok(TensorDescriptor::new(
            self.inner.registry.acquire(DescriptorKind::Tensor)?,
        ))
    }

    pub fn create_pooling_descriptor(&self) -> Result<PoolingDescriptor> {
        Ok(PoolingDescriptor::new(
            self.inner.registry.acquire(DescriptorKind::Pooling)?,
        ))
    }

    pub fn create_activation_descriptor(&self) -> Result<ActivationDescriptor> {
        Ok(ActivationDescriptor::new(
            self.inner.registry.acquire(DescriptorKind::Activation)?,
        ))
    }

    /// Run `f` on the device's thread pool and wait for it.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.inner.pool.install(f)
    }

    // Kernels

    /// Softmax over the channel axis of the described NCHW tensor.
    pub fn softmax_forward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        x_desc: &TensorDescriptor,
        x: &[S],
        y_desc: &TensorDescriptor,
        y: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("x", x_desc, x.len())?;
        check_tensor::<S>("y", y_desc, y.len())?;
        check_same_dims(x_desc, y_desc)?;
        let [_, c, h, w] = x_desc.dims();
        tracing::trace!(handle = handle.id(), dims = ?x_desc.dims(), "softmax forward");
        self.install(|| kernels::softmax_forward::<S, C>(x, y, c, h * w));
        Ok(())
    }

    /// Softmax gradient: `dx = (dy - sum_c(dy * y)) * y`.
    pub fn softmax_backward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        y_desc: &TensorDescriptor,
        y: &[S],
        dy: &[S],
        dx_desc: &TensorDescriptor,
        dx: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("y", y_desc, y.len())?;
        check_tensor::<S>("dy", y_desc, dy.len())?;
        check_tensor::<S>("dx", dx_desc, dx.len())?;
        check_same_dims(y_desc, dx_desc)?;
        let [_, c, h, w] = y_desc.dims();
        tracing::trace!(handle = handle.id(), dims = ?y_desc.dims(), "softmax backward");
        self.install(|| kernels::softmax_backward::<S, C>(y, dy, dx, c, h * w));
        Ok(())
    }

    pub fn activation_forward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        act: &ActivationDescriptor,
        x_desc: &TensorDescriptor,
        x: &[S],
        y_desc: &TensorDescriptor,
        y: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("x", x_desc, x.len())?;
        check_tensor::<S>("y", y_desc, y.len())?;
        check_same_dims(x_desc, y_desc)?;
        let mode = act.mode();
        tracing::trace!(handle = handle.id(), ?mode, "activation forward");
        self.install(|| kernels::activation_forward::<S, C>(mode, x, y));
        Ok(())
    }

    /// Activation gradient computed from the forward output `y`.
    pub fn activation_backward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        act: &ActivationDescriptor,
        y_desc: &TensorDescriptor,
        y: &[S],
        dy: &[S],
        dx_desc: &TensorDescriptor,
        dx: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("y", y_desc, y.len())?;
        check_tensor::<S>("dy", y_desc, dy.len())?;
        check_tensor::<S>("dx", dx_desc, dx.len())?;
        check_same_dims(y_desc, dx_desc)?;
        let mode = act.mode();
        tracing::trace!(handle = handle.id(), ?mode, "activation backward");
        self.install(|| kernels::activation_backward::<S, C>(mode, y, dy, dx));
        Ok(())
    }

    /// 2-D pooling of every (n, c) plane; the output spatial size is taken
    /// from `y_desc`.
    pub fn pooling_forward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        pool: &PoolingDescriptor,
        x_desc: &TensorDescriptor,
        x: &[S],
        y_desc: &TensorDescriptor,
        y: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("x", x_desc, x.len())?;
        check_tensor::<S>("y", y_desc, y.len())?;
        let geometry = pool_geometry(pool, x_desc, y_desc)?;
        let mode = pool.mode();
        tracing::trace!(handle = handle.id(), ?mode, "pooling forward");
        self.install(|| kernels::pooling_forward::<S, C>(mode, geometry, x, y));
        Ok(())
    }

    pub fn pooling_backward<S: Element, C: Accumulator>(
        &self,
        handle: &Handle,
        pool: &PoolingDescriptor,
        y_desc: &TensorDescriptor,
        dy: &[S],
        x_desc: &TensorDescriptor,
        x: &[S],
        dx: &mut [S],
    ) -> Result<()> {
        check_tensor::<S>("dy", y_desc, dy.len())?;
        check_tensor::<S>("x", x_desc, x.len())?;
        check_tensor::<S>("dx", x_desc, dx.len())?;
        let geometry = pool_geometry(pool, x_desc, y_desc)?;
        let mode = pool.mode();
        tracing::trace!(handle = handle.id(), ?mode, "pooling backward");
        self.install(|| kernels::pooling_backward::<S, C>(mode, geometry, x, dy, dx));
        Ok(())
    }
}

impl fmt::Debug for AccelDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccelDevice(ordinal={}, threads={})",
            self.inner.ordinal,
            self.num_threads()
        )
    }
}

// Helpers

fn check_tensor<S: Element>(what: &str, desc: &TensorDescriptor, len: usize) -> Result<()> {
    if desc.dtype() != S::DTYPE {
        return Err(Error::DTypeMismatch {
            expected: desc.dtype(),
            got: S::DTYPE,
        });
    }
    if !desc.is_packed() {
        return Err(Error::Resource(format!(
            "{what}: only packed NCHW layouts are supported, strides {:?}",
            desc.strides()
        )));
    }
    if desc.count() != len {
        return Err(Error::Resource(format!(
            "{what}: descriptor {:?} describes {} elements, buffer holds {len}",
            desc.dims(),
            desc.count()
        )));
    }
    Ok(())
}

fn check_same_dims(a: &TensorDescriptor, b: &TensorDescriptor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(Error::Resource(format!(
            "descriptor dims differ: {:?} vs {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

fn pool_geometry(
    pool: &PoolingDescriptor,
    x_desc: &TensorDescriptor,
    y_desc: &TensorDescriptor,
) -> Result<PoolGeometry> {
    let [n, c, height, width] = x_desc.dims();
    let [yn, yc, pooled_h, pooled_w] = y_desc.dims();
    if (n, c) != (yn, yc) {
        return Err(Error::Resource(format!(
            "pooling keeps (n, c): input {:?}, output {:?}",
            x_desc.dims(),
            y_desc.dims()
        )));
    }
    let (window, pad) = (pool.window(), pool.pad());
    if pad.0 >= window.0 || pad.1 >= window.1 {
        return Err(Error::Resource(format!(
            "pooling pad {pad:?} must be smaller than the window {window:?}"
        )));
    }
    Ok(PoolGeometry {
        height,
        width,
        pooled_h,
        pooled_w,
        window,
        stride: pool.stride(),
        pad,
    })
}
