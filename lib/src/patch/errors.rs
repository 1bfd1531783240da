use crate::jvm::Error;

/// Reasons a strategy refuses to patch a method
///
/// These are contained per rule: the pipeline logs them and keeps the method as it was.
#[derive(Debug)]
pub enum PatchError {
    /// The method descriptor is not the one the strategy was written against
    DescriptorMismatch { expected: String, found: String },

    /// The strategy needs a body but the method is abstract or native
    MissingBody,

    /// Script refers to an argument the method does not have
    ArgumentOutOfRange(usize),

    /// A call site has the wrong number of arguments for its descriptor
    ArityMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    /// Value returned (or fallen back to) does not match the method's return type
    ReturnTypeMismatch { expected: String, found: String },

    Unsupported(String),

    /// Bytecode would exceed the maximum code length
    TooLarge(usize),

    /// Declared envelope does not cover the code
    EnvelopeUnderflow(EnvelopeViolation),

    /// Generated code can fall off the end of the method
    FallsOffEnd,

    UnknownVariable(String),

    /// Error from the class file layer (including verification of generated code)
    Class(Error),
}

/// Ways in which a body can escape its declared envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeViolation {
    /// Stack height at some point exceeds `max_stack`
    StackExceeded {
        instruction: usize,
        height: usize,
        max_stack: u16,
    },

    /// A local slot at or beyond `max_locals` is accessed
    LocalOutOfRange {
        instruction: usize,
        slot: u16,
        max_locals: u16,
    },

    /// A local access runs past the last addressable slot
    LocalsOverflow { instruction: usize, slot: u16 },

    /// An instruction pops more than is on the stack
    StackUnderflow { instruction: usize, height: usize },

    /// Two paths reach the same point with different stack heights
    InconsistentHeight {
        instruction: usize,
        first: usize,
        second: usize,
    },

    /// Parameters alone need more locals than are declared
    ParametersExceedLocals { parameters: u16, max_locals: u16 },
}

impl From<Error> for PatchError {
    fn from(err: Error) -> PatchError {
        match err {
            Error::MethodCodeOverflow(length) => PatchError::TooLarge(length),
            other => PatchError::Class(other),
        }
    }
}
