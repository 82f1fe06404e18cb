// Accelerator strategies - device paths for Softmax, activations and Pooling
//
// A strategy is composed into a Layer by the factory when the context holds a
// device and the kind has a device implementation. It never touches the
// operator's state: shapes come from the arena, which the operator has
// already reshaped when the strategy's reshape runs.
//
// DESCRIPTOR LIFECYCLE:
//
//   setup    acquire handle + descriptors (all or none; a failure drops the
//            ones already acquired)
//   reshape  reconfigure every tensor descriptor for the new shapes
//   drop     descriptors release themselves
//
// Blobs with no elements leave the descriptors unconfigured and make
// forward/backward no-ops, since a device tensor needs positive dimensions.

use tessel_accel::{
    AccelDevice, ActivationDescriptor, ActivationMode, Handle, PoolingDescriptor, PoolingMode,
    TensorDescriptor,
};
use tessel_core::{dispatch_precision, BlobArena, BlobId, DType, Error, Result};

use crate::config::{PoolMethod, PoolingParams};
use crate::layer::{AccelStrategy, LayerEnv};
use crate::pooling::PoolSpec;

fn not_set_up(layer: &str) -> Error {
    Error::config(layer, "accelerator path used before setup")
}

fn set_4d(desc: &mut TensorDescriptor, dtype: DType, [n, c, h, w]: [usize; 4]) -> Result<()> {
    desc.set_4d(dtype, n, c, h, w)
}

//  SOFTMAX

struct SoftmaxHandles {
    handle: Handle,
    bottom: TensorDescriptor,
    top: TensorDescriptor,
}

/// Softmax over one axis, described to the device as (outer, channels, inner, 1).
pub struct AccelSoftmax {
    device: AccelDevice,
    axis: i64,
    handles: Option<SoftmaxHandles>,
    empty: bool,
}

impl AccelSoftmax {
    pub fn new(device: AccelDevice, axis: i64) -> Self {
        AccelSoftmax {
            device,
            axis,
            handles: None,
            empty: true,
        }
    }
}

impl AccelStrategy for AccelSoftmax {
    fn setup(
        &mut self,
        _env: &LayerEnv<'_>,
        _arena: &BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let handle = self.device.create_handle()?;
        let bottom = self.device.create_tensor_descriptor()?;
        let top = self.device.create_tensor_descriptor()?;
        self.handles = Some(SoftmaxHandles {
            handle,
            bottom,
            top,
        });
        Ok(())
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &BlobArena,
        bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_mut().ok_or_else(|| not_set_up(env.name))?;
        let shape = arena.shape(bottom[0])?;
        self.empty = shape.elem_count() == 0;
        if self.empty {
            return Ok(());
        }
        let axis = shape.canonical_axis(self.axis)?;
        let dims = [
            shape.count_range(0, axis)?,
            shape.dims()[axis],
            shape.count_from(axis + 1)?,
            1,
        ];
        let dtype = env.precision.storage();
        set_4d(&mut h.bottom, dtype, dims)?;
        set_4d(&mut h.top, dtype, dims)
    }

    fn forward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let x = arena.values::<S>(bottom[0])?.to_vec();
            let y = arena.values_mut::<S>(top[0])?;
            device.softmax_forward::<S, C>(&h.handle, &h.bottom, &x, &h.top, y)
        })
    }

    fn backward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty || !propagate_down[0] {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let y = arena.values::<S>(top[0])?.to_vec();
            let dy = arena.diff::<S>(top[0])?.to_vec();
            let dx = arena.diff_mut::<S>(bottom[0])?;
            device.softmax_backward::<S, C>(&h.handle, &h.top, &y, &dy, &h.bottom, dx)
        })
    }

    fn is_set_up(&self) -> bool {
        self.handles.is_some()
    }
}

//  ACTIVATION

struct ActivationHandles {
    handle: Handle,
    activation: ActivationDescriptor,
    bottom: TensorDescriptor,
    top: TensorDescriptor,
}

/// Element-wise activation, described to the device as (count, 1, 1, 1).
pub struct AccelActivation {
    device: AccelDevice,
    mode: ActivationMode,
    handles: Option<ActivationHandles>,
    empty: bool,
}

impl AccelActivation {
    pub fn new(device: AccelDevice, mode: ActivationMode) -> Self {
        AccelActivation {
            device,
            mode,
            handles: None,
            empty: true,
        }
    }
}

impl AccelStrategy for AccelActivation {
    fn setup(
        &mut self,
        _env: &LayerEnv<'_>,
        _arena: &BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let handle = self.device.create_handle()?;
        let mut activation = self.device.create_activation_descriptor()?;
        let bottom = self.device.create_tensor_descriptor()?;
        let top = self.device.create_tensor_descriptor()?;
        activation.set(self.mode);
        self.handles = Some(ActivationHandles {
            handle,
            activation,
            bottom,
            top,
        });
        Ok(())
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &BlobArena,
        bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_mut().ok_or_else(|| not_set_up(env.name))?;
        let count = arena.count(bottom[0])?;
        self.empty = count == 0;
        if self.empty {
            return Ok(());
        }
        let dtype = env.precision.storage();
        set_4d(&mut h.bottom, dtype, [count, 1, 1, 1])?;
        set_4d(&mut h.top, dtype, [count, 1, 1, 1])
    }

    fn forward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let x = arena.values::<S>(bottom[0])?.to_vec();
            let y = arena.values_mut::<S>(top[0])?;
            device.activation_forward::<S, C>(&h.handle, &h.activation, &h.bottom, &x, &h.top, y)
        })
    }

    fn backward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty || !propagate_down[0] {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let y = arena.values::<S>(top[0])?.to_vec();
            let dy = arena.diff::<S>(top[0])?.to_vec();
            let dx = arena.diff_mut::<S>(bottom[0])?;
            device.activation_backward::<S, C>(
                &h.handle,
                &h.activation,
                &h.top,
                &y,
                &dy,
                &h.bottom,
                dx,
            )
        })
    }

    fn is_set_up(&self) -> bool {
        self.handles.is_some()
    }
}

//  POOLING

struct PoolingHandles {
    handle: Handle,
    pooling: PoolingDescriptor,
    bottom: TensorDescriptor,
    top: TensorDescriptor,
}

/// 2-D pooling. Only the single-top form runs on the device; the argmax
/// top of max pooling is a host feature.
pub struct AccelPooling {
    device: AccelDevice,
    params: PoolingParams,
    spec: Option<PoolSpec>,
    handles: Option<PoolingHandles>,
    empty: bool,
}

impl AccelPooling {
    pub fn new(device: AccelDevice, params: PoolingParams) -> Self {
        AccelPooling {
            device,
            params,
            spec: None,
            handles: None,
            empty: true,
        }
    }
}

impl AccelStrategy for AccelPooling {
    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        _arena: &BlobArena,
        _bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        if top.len() != 1 {
            return Err(Error::config(
                env.name,
                format!("accelerated pooling produces exactly one top, got {}", top.len()),
            ));
        }
        let spec = PoolSpec::from_params(env.name, &self.params)?;
        let handle = self.device.create_handle()?;
        let pooling = self.device.create_pooling_descriptor()?;
        let bottom = self.device.create_tensor_descriptor()?;
        let top = self.device.create_tensor_descriptor()?;
        self.spec = Some(spec);
        self.handles = Some(PoolingHandles {
            handle,
            pooling,
            bottom,
            top,
        });
        Ok(())
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &BlobArena,
        bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        let (spec, h) = match (self.spec, self.handles.as_mut()) {
            (Some(spec), Some(h)) => (spec, h),
            _ => return Err(not_set_up(env.name)),
        };
        let [n, c, height, width] = arena.shape(bottom[0])?.legacy_dims()?;
        let g = spec.geometry(env.name, height, width)?;
        self.empty = n * c * height * width == 0;
        if self.empty {
            return Ok(());
        }
        let mode = match spec.method {
            PoolMethod::Max => PoolingMode::Max,
            PoolMethod::Ave => PoolingMode::AverageIncludePadding,
        };
        let dtype = env.precision.storage();
        h.pooling.set_2d(mode, g.kernel, g.pad, g.stride)?;
        set_4d(&mut h.bottom, dtype, [n, c, height, width])?;
        set_4d(&mut h.top, dtype, [n, c, g.pooled_h, g.pooled_w])
    }

    fn forward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let x = arena.values::<S>(bottom[0])?.to_vec();
            let y = arena.values_mut::<S>(top[0])?;
            device.pooling_forward::<S, C>(&h.handle, &h.pooling, &h.bottom, &x, &h.top, y)
        })
    }

    fn backward(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        let h = self.handles.as_ref().ok_or_else(|| not_set_up(env.name))?;
        if self.empty || !propagate_down[0] {
            return Ok(());
        }
        let device = &self.device;
        dispatch_precision!(env.precision, S, C => {
            let dy = arena.diff::<S>(top[0])?.to_vec();
            let x = arena.values::<S>(bottom[0])?.to_vec();
            let dx = arena.diff_mut::<S>(bottom[0])?;
            device.pooling_backward::<S, C>(&h.handle, &h.pooling, &h.top, &dy, &h.bottom, &x, dx)
        })
    }

    fn is_set_up(&self) -> bool {
        self.handles.is_some()
    }
}
