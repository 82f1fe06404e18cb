use tessel_core::{Error, Result};

use crate::layer::Layer;

/// Refuse to replicate `layers` over `replicas` parallel solvers when one of
/// them cannot be shared between replicas.
///
/// Layers check the same condition for themselves at setup from their
/// context's solver count; this lets a graph builder fail before creating any
/// replica.
pub fn ensure_replicable(layers: &[Layer], replicas: usize) -> Result<()> {
    if replicas <= 1 {
        return Ok(());
    }
    match layers.iter().find(|l| !l.share_in_parallel()) {
        Some(layer) => Err(Error::config(
            layer.name(),
            format!(
                "{} layer is not shareable; refusing to replicate the graph {replicas} times",
                layer.kind()
            ),
        )),
        None => Ok(()),
    }
}
