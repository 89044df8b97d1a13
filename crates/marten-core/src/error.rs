use crate::backend::BackendKind;
use crate::shape::Shape;

/// All errors that can occur within marten.
///
/// Loading, scheduling and kernel execution share this one type so a failure
/// deep inside a backend propagates to `Model::forward` with `?` unchanged,
/// only gaining the node context on the way out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Load-time errors

    /// The graph names an operator type nobody registered.
    #[error("unknown operator type '{op_type}'")]
    UnknownOperator { op_type: String },

    /// The operator exists but not for the opset the model was exported with.
    #[error("operator '{op_type}' does not support opset {version}")]
    UnsupportedOpset { op_type: String, version: i64 },

    /// An initializer carries a negative dimension or its data does not fill its shape.
    #[error("malformed shape for '{name}': {reason}")]
    MalformedShape { name: String, reason: String },

    /// A port is consumed (or declared as output) but nothing produces it.
    #[error("port '{port}' is never produced")]
    UnknownPort { port: String },

    /// Two producers claim the same port.
    #[error("port '{port}' is produced more than once")]
    DuplicatePort { port: String },

    /// A produced port has no consumer and is not a graph output.
    #[error("port '{port}' is produced but never consumed")]
    DanglingPort { port: String },

    /// The protobuf payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A required attribute is missing or has the wrong type.
    #[error("attribute '{name}': {reason}")]
    Attribute { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // Schedule-time errors

    /// A declared output was not produced by the end of the pass.
    #[error("output '{port}' was not produced")]
    UnresolvedOutput { port: String },

    /// A node was dequeued before one of its inputs existed.
    #[error("node {node} dequeued before input '{port}' was available")]
    InputNotReady { node: usize, port: String },

    /// `forward` was called with the wrong number of inputs.
    #[error("graph expects {expected} inputs, got {got}")]
    InputCountMismatch { expected: usize, got: usize },

    /// A kernel returned a different number of tensors than the node declares.
    #[error("operator '{op_type}' returned {got} outputs, node declares {expected}")]
    OutputArity {
        op_type: String,
        expected: usize,
        got: usize,
    },

    /// A kernel failed; carries the node context.
    #[error("node {node} ({op_type}) failed on inputs {}: {source}", fmt_shapes(.shapes))]
    Node {
        node: usize,
        op_type: String,
        shapes: Vec<Shape>,
        source: Box<Error>,
    },

    // Operator-level errors

    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastIncompatible { lhs: Shape, rhs: Shape },

    /// The operands of a binary operation live on different backends.
    #[error("backend mismatch: {lhs} vs {rhs}")]
    BackendMismatch { lhs: BackendKind, rhs: BackendKind },

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Axis out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: i64, rank: usize },

    /// Element index outside the tensor.
    #[error("index {index:?} out of bounds for shape {shape}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// More than one `-1` in a reshape target.
    #[error("reshape target {spec:?} has more than one inferred axis")]
    MultipleInferredAxes { spec: Vec<i64> },

    /// The inferred reshape axis does not divide the element count.
    #[error("reshape target {spec:?} cannot hold {elem_count} elements")]
    InferredAxisNotDivisible { spec: Vec<i64>, elem_count: usize },

    /// A required operator input was absent.
    #[error("missing required input {index}")]
    MissingInput { index: usize },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

fn fmt_shapes(shapes: &[Shape]) -> String {
    let parts: Vec<String> = shapes.iter().map(|s| s.to_string()).collect();
    format!("({})", parts.join(", "))
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn attribute(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Attribute {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a kernel error with the node that raised it.
    pub fn in_node(self, node: usize, op_type: &str, shapes: Vec<Shape>) -> Self {
        Error::Node {
            node,
            op_type: op_type.to_string(),
            shapes,
            source: Box::new(self),
        }
    }

    /// Strip any `Node` wrappers and return the kernel's own error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Node { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convenience Result type used throughout marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
