// Script - layers whose math is delegated to an external implementation
//
// A Script layer owns a ScriptDelegate created from a ScriptRegistry by the
// key in its config ("module" or "module.layer"). Every lifecycle call is
// forwarded to the delegate with blobs copied across the boundary:
//
//   arena --(export: storage -> f32)--> ScriptBlob --delegate--> ScriptBlob
//         <--(commit: f32 -> storage)--
//
// COMMIT RULES:
//
//   setup     nothing is written back
//   reshape   top shapes
//   forward   top values
//   backward  bottom diffs whose propagate flag is set
//
// The delegate's output is validated in full before anything is committed,
// so a failing call (delegate error or malformed output) leaves every blob in
// the arena exactly as it was.
//
// INTERPRETER LOCK:
//
//   Delegates created from one registry share a single non-reentrant lock;
//   every call holds it. A poisoned lock (a delegate panicked) is reported as
//   a delegate error on every later call instead of blocking.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use tessel_core::{BlobArena, BlobId, Error, Result, Shape};

use crate::config::{LayerKind, ScriptParams};
use crate::layer::{Count, LayerEnv, Operator};

/// Error type delegates report failures with.
pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type DelegateResult = std::result::Result<(), BoxError>;

/// A blob as seen by a delegate: f32 copies of the values and gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptBlob {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub diff: Vec<f32>,
}

impl ScriptBlob {
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Change the shape; values and gradients become zeros of the new count.
    pub fn reshape(&mut self, shape: impl Into<Vec<usize>>) {
        self.shape = shape.into();
        let n = self.count();
        self.data = vec![0.0; n];
        self.diff = vec![0.0; n];
    }
}

/// External implementation of a layer.
pub trait ScriptDelegate: Send {
    fn setup(&mut self, param_str: &str, bottom: &[ScriptBlob], top: &[ScriptBlob]) -> DelegateResult;

    /// Set the shapes of `top` from `bottom`.
    fn reshape(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult;

    /// Write the values of `top`.
    fn forward(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult;

    /// Write the gradients of the bottoms whose flag is set.
    fn backward(
        &mut self,
        top: &[ScriptBlob],
        propagate_down: &[bool],
        bottom: &mut [ScriptBlob],
    ) -> DelegateResult;
}

type Factory =
    Arc<dyn Fn(&ScriptParams) -> std::result::Result<Box<dyn ScriptDelegate>, BoxError> + Send + Sync>;

/// Delegate factories keyed by script name, plus the lock their delegates share.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    factories: HashMap<String, Factory>,
    interpreter: Arc<Mutex<()>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&ScriptParams) -> std::result::Result<Box<dyn ScriptDelegate>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the Script operator for `params`.
    pub fn instantiate(&self, layer: &str, params: &ScriptParams) -> Result<Script> {
        let key = params.key();
        let factory = self.factories.get(&key).ok_or_else(|| {
            Error::config(layer, format!("no script delegate registered as '{key}'"))
        })?;
        let delegate = factory(params).map_err(|e| Error::Delegate {
            layer: layer.to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(layer, script = %key, "script delegate created");
        Ok(Script {
            params: params.clone(),
            delegate,
            interpreter: Arc::clone(&self.interpreter),
        })
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("ScriptRegistry").field("keys", &keys).finish()
    }
}

pub struct Script {
    params: ScriptParams,
    delegate: Box<dyn ScriptDelegate>,
    interpreter: Arc<Mutex<()>>,
}

fn export(arena: &BlobArena, ids: &[BlobId], values: bool, diff: bool) -> Result<Vec<ScriptBlob>> {
    ids.iter()
        .map(|&id| {
            let n = arena.count(id)?;
            let narrow = |v: Vec<f64>| v.into_iter().map(|x| x as f32).collect::<Vec<_>>();
            Ok(ScriptBlob {
                name: arena.name(id)?.to_string(),
                shape: arena.shape(id)?.dims().to_vec(),
                data: if values { narrow(arena.to_f64_values(id)?) } else { vec![0.0; n] },
                diff: if diff { narrow(arena.to_f64_diff(id)?) } else { vec![0.0; n] },
            })
        })
        .collect()
}

fn widen(v: &[f32]) -> Vec<f64> {
    v.iter().map(|&x| x as f64).collect()
}

impl Script {
    fn call(
        &mut self,
        layer: &str,
        op: &'static str,
        f: impl FnOnce(&mut dyn ScriptDelegate) -> DelegateResult,
    ) -> Result<()> {
        let _guard = self.interpreter.lock().map_err(|_| Error::Delegate {
            layer: layer.to_string(),
            message: "interpreter lock poisoned by an earlier delegate panic".to_string(),
        })?;
        f(self.delegate.as_mut()).map_err(|e| {
            tracing::warn!(layer, op, error = %e, "script delegate failed");
            Error::Delegate {
                layer: layer.to_string(),
                message: e.to_string(),
            }
        })
    }

    fn malformed(layer: &str, msg: String) -> Error {
        Error::Delegate {
            layer: layer.to_string(),
            message: msg,
        }
    }
}

impl Operator for Script {
    fn kind(&self) -> LayerKind {
        LayerKind::Script
    }

    fn bottom_count(&self) -> Count {
        Count::AtLeast(0)
    }

    fn top_count(&self) -> Count {
        Count::AtLeast(0)
    }

    fn share_in_parallel(&self) -> bool {
        self.params.share_in_parallel
    }

    fn setup(
        &mut self,
        env: &LayerEnv<'_>,
        _rng: &mut StdRng,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let b = export(arena, bottom, true, false)?;
        let t = export(arena, top, false, false)?;
        let param_str = self.params.param_str.clone();
        self.call(env.name, "setup", |d| d.setup(&param_str, &b, &t))
    }

    fn reshape(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let b = export(arena, bottom, false, false)?;
        let mut t = export(arena, top, false, false)?;
        self.call(env.name, "reshape", |d| d.reshape(&b, &mut t))?;
        if t.len() != top.len() {
            return Err(Self::malformed(
                env.name,
                format!("reshape returned {} tops, expected {}", t.len(), top.len()),
            ));
        }
        for (&id, blob) in top.iter().zip(&t) {
            arena.reshape(id, Shape::new(blob.shape.clone()))?;
        }
        Ok(())
    }

    fn forward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        let b = export(arena, bottom, true, false)?;
        let mut t = export(arena, top, true, false)?;
        self.call(env.name, "forward", |d| d.forward(&b, &mut t))?;
        for (i, (&id, blob)) in top.iter().zip(&t).enumerate() {
            let n = arena.count(id)?;
            if blob.data.len() != n {
                return Err(Self::malformed(
                    env.name,
                    format!("forward wrote {} values to top {i}, expected {n}", blob.data.len()),
                ));
            }
        }
        for (&id, blob) in top.iter().zip(&t) {
            arena.set_values_f64(id, &widen(&blob.data))?;
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        top: &[BlobId],
        propagate_down: &[bool],
        bottom: &[BlobId],
    ) -> Result<()> {
        let t = export(arena, top, true, true)?;
        let mut b = export(arena, bottom, true, true)?;
        self.call(env.name, "backward", |d| d.backward(&t, propagate_down, &mut b))?;
        for (i, (&id, blob)) in bottom.iter().zip(&b).enumerate() {
            let n = arena.count(id)?;
            if propagate_down[i] && blob.diff.len() != n {
                return Err(Self::malformed(
                    env.name,
                    format!("backward wrote {} gradients to bottom {i}, expected {n}", blob.diff.len()),
                ));
            }
        }
        for ((&id, blob), &flag) in bottom.iter().zip(&b).zip(propagate_down) {
            if flag {
                arena.set_diff_f64(id, &widen(&blob.diff))?;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "python")]
pub mod python {
    //! Delegates hosted by a Python interpreter.
    //!
    //! The configured `module` is imported and its `layer` attribute called
    //! with no arguments; the resulting object gets a `param_str` attribute
    //! and receives `setup(bottom, top)`, `reshape(bottom, top)`,
    //! `forward(bottom, top)` and `backward(top, propagate_down, bottom)`.
    //! Blobs are dicts with `name`, `shape` (list) and `data`/`diff` (numpy
    //! float32 arrays). The object reports results by storing into those
    //! dicts: `shape` in reshape, `data` in forward, `diff` in backward.

    use numpy::PyArray1;
    use pyo3::exceptions::PyKeyError;
    use pyo3::prelude::*;
    use pyo3::types::{PyDict, PyList};

    use super::{BoxError, DelegateResult, ScriptBlob, ScriptDelegate, ScriptRegistry};
    use crate::config::ScriptParams;

    pub struct PyDelegate {
        object: Py<PyAny>,
    }

    impl PyDelegate {
        pub fn new(params: &ScriptParams) -> PyResult<Self> {
            Python::with_gil(|py| {
                let module = py.import_bound(params.module.as_str())?;
                let object = module.getattr(params.layer.as_str())?.call0()?;
                object.setattr("param_str", params.param_str.as_str())?;
                Ok(PyDelegate {
                    object: object.unbind(),
                })
            })
        }
    }

    fn to_list<'py>(py: Python<'py>, blobs: &[ScriptBlob]) -> PyResult<Bound<'py, PyList>> {
        let list = PyList::empty_bound(py);
        for b in blobs {
            let d = PyDict::new_bound(py);
            d.set_item("name", b.name.as_str())?;
            d.set_item("shape", b.shape.clone())?;
            d.set_item("data", PyArray1::from_slice_bound(py, &b.data))?;
            d.set_item("diff", PyArray1::from_slice_bound(py, &b.diff))?;
            list.append(d)?;
        }
        Ok(list)
    }

    fn field<'py>(item: &Bound<'py, PyAny>, key: &str) -> PyResult<Bound<'py, PyAny>> {
        item.downcast::<PyDict>()?
            .get_item(key)?
            .ok_or_else(|| PyKeyError::new_err(key.to_string()))
    }

    fn read_shapes(list: &Bound<'_, PyList>, blobs: &mut [ScriptBlob]) -> PyResult<()> {
        for (item, blob) in list.iter().zip(blobs.iter_mut()) {
            let shape: Vec<usize> = field(&item, "shape")?.extract()?;
            if shape != blob.shape {
                blob.reshape(shape);
            }
        }
        Ok(())
    }

    fn read_vectors(list: &Bound<'_, PyList>, key: &str, out: &mut [Vec<f32>]) -> PyResult<()> {
        for (item, v) in list.iter().zip(out.iter_mut()) {
            *v = field(&item, key)?.extract()?;
        }
        Ok(())
    }

    impl ScriptDelegate for PyDelegate {
        fn setup(&mut self, _param_str: &str, bottom: &[ScriptBlob], top: &[ScriptBlob]) -> DelegateResult {
            Python::with_gil(|py| -> PyResult<()> {
                let (b, t) = (to_list(py, bottom)?, to_list(py, top)?);
                self.object.bind(py).call_method1("setup", (b, t))?;
                Ok(())
            })?;
            Ok(())
        }

        fn reshape(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult {
            Python::with_gil(|py| -> PyResult<()> {
                let (b, t) = (to_list(py, bottom)?, to_list(py, top)?);
                self.object.bind(py).call_method1("reshape", (b, &t))?;
                read_shapes(&t, top)
            })?;
            Ok(())
        }

        fn forward(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult {
            Python::with_gil(|py| -> PyResult<()> {
                let (b, t) = (to_list(py, bottom)?, to_list(py, top)?);
                self.object.bind(py).call_method1("forward", (b, &t))?;
                let mut data: Vec<Vec<f32>> = top.iter().map(|b| b.data.clone()).collect();
                read_vectors(&t, "data", &mut data)?;
                for (blob, d) in top.iter_mut().zip(data) {
                    blob.data = d;
                }
                Ok(())
            })?;
            Ok(())
        }

        fn backward(
            &mut self,
            top: &[ScriptBlob],
            propagate_down: &[bool],
            bottom: &mut [ScriptBlob],
        ) -> DelegateResult {
            Python::with_gil(|py| -> PyResult<()> {
                let (t, b) = (to_list(py, top)?, to_list(py, bottom)?);
                let flags = propagate_down.to_vec();
                self.object.bind(py).call_method1("backward", (t, flags, &b))?;
                let mut diff: Vec<Vec<f32>> = bottom.iter().map(|b| b.diff.clone()).collect();
                read_vectors(&b, "diff", &mut diff)?;
                for (blob, d) in bottom.iter_mut().zip(diff) {
                    blob.diff = d;
                }
                Ok(())
            })?;
            Ok(())
        }
    }

    impl ScriptRegistry {
        /// Register a Python-hosted delegate under `key`.
        pub fn register_python(&mut self, key: impl Into<String>) {
            self.register(key, |params: &ScriptParams| {
                let delegate = PyDelegate::new(params).map_err(BoxError::from)?;
                Ok(Box::new(delegate) as Box<dyn ScriptDelegate>)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Phase;
    use rand::SeedableRng;
    use tessel_core::Precision;

    // Doubles its input; fails in forward when asked to.
    struct Double {
        fail: bool,
    }

    impl ScriptDelegate for Double {
        fn setup(&mut self, param_str: &str, _: &[ScriptBlob], _: &[ScriptBlob]) -> DelegateResult {
            self.fail = param_str == "fail";
            Ok(())
        }

        fn reshape(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult {
            top[0].reshape(bottom[0].shape.clone());
            Ok(())
        }

        fn forward(&mut self, bottom: &[ScriptBlob], top: &mut [ScriptBlob]) -> DelegateResult {
            if self.fail {
                return Err("forward refused".into());
            }
            top[0].data = bottom[0].data.iter().map(|v| v * 2.0).collect();
            Ok(())
        }

        fn backward(&mut self, top: &[ScriptBlob], _: &[bool], bottom: &mut [ScriptBlob]) -> DelegateResult {
            bottom[0].diff = top[0].diff.iter().map(|v| v * 2.0).collect();
            Ok(())
        }
    }

    fn registry() -> ScriptRegistry {
        let mut r = ScriptRegistry::new();
        r.register("ops.Double", |_: &ScriptParams| {
            Ok(Box::new(Double { fail: false }) as Box<dyn ScriptDelegate>)
        });
        r
    }

    fn params(param_str: &str) -> ScriptParams {
        ScriptParams {
            module: "ops".into(),
            layer: "Double".into(),
            param_str: param_str.into(),
            share_in_parallel: false,
        }
    }

    fn env() -> LayerEnv<'static> {
        LayerEnv {
            name: "script",
            phase: Phase::Train,
            precision: Precision::F32,
            param_propagate_down: &[],
        }
    }

    #[test]
    fn test_forward_and_backward_round_trip() -> Result<()> {
        let mut op = registry().instantiate("script", &params(""))?;
        let mut arena = BlobArena::new(Precision::F32);
        let x = arena.create("x", 3)?;
        let y = arena.create_empty("y");
        arena.set_values_f64(x, &[1.0, 2.0, 3.0])?;
        op.setup(&env(), &mut StdRng::seed_from_u64(0), &mut arena, &[x], &[y])?;
        op.reshape(&env(), &mut arena, &[x], &[y])?;
        assert_eq!(arena.shape(y)?.dims(), &[3]);
        op.forward_host(&env(), &mut arena, &[x], &[y])?;
        assert_eq!(arena.to_f64_values(y)?, vec![2.0, 4.0, 6.0]);
        arena.fill_diff(y, 1.0)?;
        op.backward_host(&env(), &mut arena, &[y], &[true], &[x])?;
        assert_eq!(arena.to_f64_diff(x)?, vec![2.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_failure_leaves_top_unchanged() -> Result<()> {
        let mut op = registry().instantiate("script", &params("fail"))?;
        let mut arena = BlobArena::new(Precision::F32);
        let x = arena.create("x", 2)?;
        let y = arena.create("y", 2)?;
        arena.set_values_f64(y, &[7.0, 8.0])?;
        op.setup(&env(), &mut StdRng::seed_from_u64(0), &mut arena, &[x], &[y])?;
        op.reshape(&env(), &mut arena, &[x], &[y])?;
        let err = op.forward_host(&env(), &mut arena, &[x], &[y]);
        match err {
            Err(Error::Delegate { layer, message }) => {
                assert_eq!(layer, "script");
                assert!(message.contains("forward refused"));
            }
            other => panic!("expected delegate error, got {other:?}"),
        }
        assert_eq!(arena.to_f64_values(y)?, vec![7.0, 8.0]);
        Ok(())
    }

    #[test]
    fn test_unknown_script_is_config_error() {
        let p = ScriptParams {
            module: "missing".into(),
            ..Default::default()
        };
        assert!(matches!(
            registry().instantiate("s", &p),
            Err(Error::Config { .. })
        ));
    }
}
