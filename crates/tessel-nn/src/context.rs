use tessel_accel::AccelDevice;
use tessel_core::Precision;

use crate::config::Phase;

/// Where layers with both implementations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Host,
    Accelerator,
}

/// Construction context shared by the layers of one graph replica.
///
/// ```ignore
/// let ctx = Context::new()
///     .with_precision(Precision::HALF)
///     .with_mode(Mode::Accelerator)
///     .with_device(AccelDevice::new(0)?)
///     .with_seed(1701);
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    pub mode: Mode,
    pub precision: Precision,
    pub phase: Phase,
    /// Seed for parameter fillers.
    pub seed: u64,
    /// Number of graph replicas training in parallel.
    pub solver_count: usize,
    pub device: Option<AccelDevice>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            mode: Mode::Host,
            precision: Precision::F32,
            phase: Phase::Train,
            seed: 0,
            solver_count: 1,
            device: None,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_solver_count(mut self, solver_count: usize) -> Self {
        self.solver_count = solver_count;
        self
    }

    pub fn with_device(mut self, device: AccelDevice) -> Self {
        self.device = Some(device);
        self
    }
}
