// Split - fan one blob out to several consumers
//
// Every top has the bottom's shape. By default the tops alias the bottom's
// values, so forward does no work; with `copy` set each top keeps its own
// values, filled in forward. Gradients are never shared: each consumer
// writes its own top diff and backward sums them into the bottom diff.

use rand::rngs::StdRng;
use tessel_core::{dispatch_precision, Accumulator, BlobArena, BlobId, Element, Result};

use crate::config::{LayerKind, SplitParams};
use crate::layer::{Count, LayerEnv, Operator};

pub struct Split {
    params: SplitParams,
}

impl Split {
    pub fn new(params: SplitParams) -> Self {
        Split { params }
    }

    fn backward_typed<S: Element, C: Accumulator>(
        &self,
        arena: &mut BlobArena,
        top: &[BlobId],
        bottom: BlobId,
    ) -> Result<()> {
        let mut sum = arena.load_diff::<S, C>(top[0])?;
        for &t in &top[1..] {
            for (acc, d) in sum.iter_mut().zip(arena.load_diff::<S, C>(t)?) {
                *acc += d;
            }
        }
        arena.store_diff::<S, C>(bottom, &sum)
    }
}

impl Operator for Split {
    fn kind(&self) -> LayerKind {
        LayerKind::Split
    }

    fn bottom_count(&self) -> Count {
        Count::Exact(1)
    }

    fn top_count(&self) -> Count {
        Count::AtLeast(1)
    }

    fn allows_in_place(&self) -> bool {
        false
    }

    fn setup(
        &mut self,
        _env: &LayerEnv<'_>,
        _rng: &mut StdRng,
        _arena: &mut BlobArena,
        _bottom: &[BlobId],
        _top: &[BlobId],
    ) -> Result<()> {
        Ok(())
    }

    fn reshape(
        &mut self,
        _env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        for &t in top {
            arena.reshape_like(t, bottom[0])?;
            if !self.params.copy {
                arena.share_values(t, bottom[0])?;
            }
        }
        Ok(())
    }

    fn forward_host(
        &mut self,
        _env: &LayerEnv<'_>,
        arena: &mut BlobArena,
        bottom: &[BlobId],
        top: &[BlobId],
    ) -> Result<()> {
        if self.params.copy {
            for &t in top {
                arena.copy_values(bottom[0], t)?;
            }
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
        if !propagate_down[0] {
            return Ok(());
        }
        dispatch_precision!(env.precision, S, C => {
            self.backward_typed::<S, C>(arena, top, bottom[0])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Phase;
    use rand::SeedableRng;
    use tessel_core::Precision;

    #[test]
    fn test_copy_mode_keeps_tops_independent() -> Result<()> {
        let env = LayerEnv {
            name: "split",
            phase: Phase::Train,
            precision: Precision::F32,
            param_propagate_down: &[],
        };
        let mut arena = BlobArena::new(Precision::F32);
        let x = arena.create("x", (2, 2))?;
        let a = arena.create_empty("a");
        let b = arena.create_empty("b");
        arena.set_values_f64(x, &[1.0, 2.0, 3.0, 4.0])?;

        let mut op = Split::new(SplitParams { copy: true });
        op.setup(&env, &mut StdRng::seed_from_u64(0), &mut arena, &[x], &[a, b])?;
        op.reshape(&env, &mut arena, &[x], &[a, b])?;
        op.forward_host(&env, &mut arena, &[x], &[a, b])?;
        assert!(!arena.is_alias(a, x)?);
        assert_eq!(arena.to_f64_values(b)?, vec![1.0, 2.0, 3.0, 4.0]);

        arena.fill_values(a, 0.0)?;
        assert_eq!(arena.to_f64_values(x)?, vec![1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }
}
