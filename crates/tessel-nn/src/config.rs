// Layer configuration records
//
// A LayerConfig is the declarative description a graph builder hands to the
// layer factory: a name, the bottom/top blob bindings, an optional phase
// restriction, an engine preference and the kind-specific parameters. The
// kind tag is the `"type"` field of the per-kind parameter record, flattened
// into the layer record:
//
//   {
//     "name": "ip1", "type": "InnerProduct",
//     "bottom": ["data"], "top": ["ip1"],
//     "num_output": 10,
//     "weight_filler": { "type": "xavier" }
//   }
//
// Every parameter has the default shown in its struct's Default impl, so a
// record only spells out what it changes. Records are immutable once a
// layer is built from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tessel_core::{Error, Result};

/// Execution phase of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Which implementation a layer should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Accelerator when the kind has a device path and a device is present.
    #[default]
    Default,
    /// Host only; no accelerator strategy is composed.
    Host,
    /// Require the accelerator strategy.
    Accelerator,
}

/// Tag identifying a layer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    InnerProduct,
    Mask,
    Softmax,
    Reshape,
    ReLU,
    Sigmoid,
    TanH,
    Pooling,
    Split,
    Script,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::InnerProduct => "InnerProduct",
            LayerKind::Mask => "Mask",
            LayerKind::Softmax => "Softmax",
            LayerKind::Reshape => "Reshape",
            LayerKind::ReLU => "ReLU",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::TanH => "TanH",
            LayerKind::Pooling => "Pooling",
            LayerKind::Split => "Split",
            LayerKind::Script => "Script",
        }
    }

    /// Whether the accelerator has a device path for this kind.
    pub fn has_accelerator(&self) -> bool {
        matches!(
            self,
            LayerKind::Softmax
                | LayerKind::ReLU
                | LayerKind::Sigmoid
                | LayerKind::TanH
                | LayerKind::Pooling
        )
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a parameter blob is initialized at setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FillerConfig {
    Constant {
        #[serde(default)]
        value: f64,
    },
    Uniform {
        #[serde(default)]
        min: f64,
        #[serde(default = "one")]
        max: f64,
    },
    Gaussian {
        #[serde(default)]
        mean: f64,
        #[serde(default = "one")]
        std: f64,
    },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in)]`.
    Xavier,
    /// Gaussian with std `sqrt(2 / fan_in)`.
    Msra,
}

fn one() -> f64 {
    1.0
}

impl Default for FillerConfig {
    fn default() -> Self {
        FillerConfig::Constant { value: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerProductParams {
    pub num_output: usize,
    pub bias_term: bool,
    /// First axis to flatten into the inner dimension.
    pub axis: i64,
    /// Store the weight as `[K, N]` instead of `[N, K]`.
    pub transpose: bool,
    pub weight_filler: FillerConfig,
    pub bias_filler: FillerConfig,
}

impl Default for InnerProductParams {
    fn default() -> Self {
        InnerProductParams {
            num_output: 0,
            bias_term: true,
            axis: 1,
            transpose: false,
            weight_filler: FillerConfig::default(),
            bias_filler: FillerConfig::default(),
        }
    }
}

/// A learned element-wise mask over everything past `axis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskParams {
    pub axis: i64,
    pub weight_filler: FillerConfig,
}

impl Default for MaskParams {
    fn default() -> Self {
        MaskParams {
            axis: 1,
            weight_filler: FillerConfig::Constant { value: 1.0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxParams {
    pub axis: i64,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        SoftmaxParams { axis: 1 }
    }
}

/// Target shape: `0` copies the bottom axis, `-1` is inferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshapeParams {
    pub shape: Vec<i64>,
    pub axis: i64,
    /// Number of bottom axes replaced; `-1` means all from `axis` on.
    pub num_axes: i64,
}

impl Default for ReshapeParams {
    fn default() -> Self {
        ReshapeParams {
            shape: Vec::new(),
            axis: 0,
            num_axes: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReluParams {
    pub negative_slope: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PoolMethod {
    #[default]
    #[serde(alias = "max")]
    Max,
    #[serde(alias = "ave", alias = "avg")]
    Ave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingParams {
    pub pool: PoolMethod,
    pub kernel_size: Option<usize>,
    pub kernel_h: Option<usize>,
    pub kernel_w: Option<usize>,
    pub stride: usize,
    pub stride_h: Option<usize>,
    pub stride_w: Option<usize>,
    pub pad: usize,
    pub pad_h: Option<usize>,
    pub pad_w: Option<usize>,
    /// Pool over the whole spatial extent.
    pub global_pooling: bool,
}

impl Default for PoolingParams {
    fn default() -> Self {
        PoolingParams {
            pool: PoolMethod::Max,
            kernel_size: None,
            kernel_h: None,
            kernel_w: None,
            stride: 1,
            stride_h: None,
            stride_w: None,
            pad: 0,
            pad_h: None,
            pad_w: None,
            global_pooling: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SplitParams {
    /// Give every top its own copy instead of aliasing the bottom.
    pub copy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScriptParams {
    pub module: String,
    /// Class (or factory) name inside the module.
    pub layer: String,
    /// Free-form string handed to the delegate.
    pub param_str: String,
    /// Whether the delegate may run in replicated graphs.
    pub share_in_parallel: bool,
}

impl ScriptParams {
    /// Key the delegate is registered under.
    pub fn key(&self) -> String {
        if self.layer.is_empty() {
            self.module.clone()
        } else {
            format!("{}.{}", self.module, self.layer)
        }
    }
}

/// Kind tag plus kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerParams {
    InnerProduct(InnerProductParams),
    Mask(MaskParams),
    Softmax(SoftmaxParams),
    Reshape(ReshapeParams),
    ReLU(ReluParams),
    Sigmoid,
    TanH,
    Pooling(PoolingParams),
    Split(SplitParams),
    Script(ScriptParams),
}

impl LayerParams {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerParams::InnerProduct(_) => LayerKind::InnerProduct,
            LayerParams::Mask(_) => LayerKind::Mask,
            LayerParams::Softmax(_) => LayerKind::Softmax,
            LayerParams::Reshape(_) => LayerKind::Reshape,
            LayerParams::ReLU(_) => LayerKind::ReLU,
            LayerParams::Sigmoid => LayerKind::Sigmoid,
            LayerParams::TanH => LayerKind::TanH,
            LayerParams::Pooling(_) => LayerKind::Pooling,
            LayerParams::Split(_) => LayerKind::Split,
            LayerParams::Script(_) => LayerKind::Script,
        }
    }
}

/// Declarative description of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    /// Restrict the layer to one phase; `None` means every phase.
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub engine: Engine,
    #[serde(flatten)]
    pub params: LayerParams,
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, params: LayerParams) -> Self {
        LayerConfig {
            name: name.into(),
            bottom: Vec::new(),
            top: Vec::new(),
            phase: None,
            engine: Engine::Default,
            params,
        }
    }

    pub fn with_bottom<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bottom = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_top<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.top = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn kind(&self) -> LayerKind {
        self.params.kind()
    }

    /// Whether the layer takes part in graphs running in `phase`.
    pub fn applies_to(&self, phase: Phase) -> bool {
        self.phase.map_or(true, |p| p == phase)
    }

    /// Parse one layer record from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config("<json>", e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::config(&self.name, e.to_string()))
    }
}

/// Parse a JSON array of layer records.
pub fn configs_from_json(json: &str) -> Result<Vec<LayerConfig>> {
    serde_json::from_str(json).map_err(|e| Error::config("<json>", e.to_string()))
}
