use crate::shape::Shape;

/// All errors that can occur within tessel.
///
/// Configuration, shape and resource errors are fatal to the caller: the
/// graph cannot make progress by retrying the same call. Delegation errors
/// carry the message produced by the external implementation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed layer parameters or an invalid layer/graph arrangement.
    #[error("config error in layer '{layer}': {msg}")]
    Config { layer: String, msg: String },

    /// Wrong number of bottom or top blobs for the layer kind.
    #[error("layer '{layer}' ({kind}) takes {expected} {side} blob(s), got {got}")]
    Cardinality {
        layer: String,
        kind: &'static str,
        side: &'static str,
        expected: String,
        got: usize,
    },

    /// Axis index outside `[-rank, rank)`.
    #[error("axis {axis} out of range for shape with {rank} axes")]
    AxisOutOfRange { axis: i64, rank: usize },

    /// Two shapes that must agree do not.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// An operator received input shapes it cannot work with.
    #[error("shape error in layer '{layer}': {msg}")]
    Shape { layer: String, msg: String },

    /// Legacy (num, channels, height, width) access on a shape with more than 4 axes.
    #[error("legacy 4-D accessor used on shape {shape} with more than 4 axes")]
    LegacyShape { shape: Shape },

    /// Reshape or share between element counts that differ.
    #[error("cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Storage for the requested shape could not be provided.
    #[error("allocation of {requested_bytes} bytes failed: {reason}")]
    Allocation {
        requested_bytes: usize,
        reason: String,
    },

    /// The blob's shared storage was resized by another holder and this
    /// blob's shape has not been re-inferred yet.
    #[error("blob '{blob}' has shape {shape} but its shared storage holds {storage_len} elements")]
    StaleAlias {
        blob: String,
        shape: Shape,
        storage_len: usize,
    },

    /// Forward was called after a bottom shape changed without shape inference.
    #[error("layer '{layer}' input shapes changed since the last shape inference")]
    StaleShape { layer: String },

    /// A lifecycle call made in the wrong state (e.g. forward before setup).
    #[error("layer '{layer}': cannot {op} in state {state}")]
    InvalidState {
        layer: String,
        op: &'static str,
        state: &'static str,
    },

    /// The (storage, compute) pair is not a supported precision.
    #[error("unsupported precision: storage {storage}, compute {compute}")]
    UnsupportedPrecision {
        storage: crate::DType,
        compute: crate::DType,
    },

    /// Storage accessed with an element type that does not match its dtype.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Accelerator resource (handle, descriptor) could not be acquired.
    #[error("accelerator resource error: {0}")]
    Resource(String),

    /// The scripting delegate of a layer failed.
    #[error("delegate of layer '{layer}' failed: {message}")]
    Delegate { layer: String, message: String },

    /// Unknown blob handle.
    #[error("unknown blob handle {0}")]
    UnknownBlob(usize),

    /// I/O error while reading or writing parameter files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed parameter file.
    #[error("format error: {0}")]
    Format(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn config(layer: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Config {
            layer: layer.into(),
            msg: msg.into(),
        }
    }

    pub fn shape(layer: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Shape {
            layer: layer.into(),
            msg: msg.into(),
        }
    }
}

/// Convenience Result type used throughout tessel.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
