use super::class_file::{Constant, ConstantIndex};
use super::code::Label;
use super::verifier::{Frame, FrameType};

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// Class file does not start with `0xCAFEBABE`
    BadMagic(u32),

    /// Bytes left over after the last class attribute
    TrailingBytes(usize),

    ConstantPoolOverflow {
        constant: Constant,
        offset: usize,
    },
    MissingConstant(ConstantIndex),
    UnexpectedConstant {
        index: ConstantIndex,
        expected: &'static str,
    },
    BadDescriptor(String),
    BadName(String),
    MissingAttribute(&'static str),

    /// Bytecode that cannot be decoded (bad opcode operands, jumps into the middle of an
    /// instruction, exception ranges out of bounds, etc.)
    MalformedCode {
        offset: usize,
        message: String,
    },

    /// `jsr`, `ret`, and reserved opcodes
    UnsupportedInstruction {
        opcode: u8,
        offset: usize,
    },

    MethodCodeOverflow(usize),
    MethodCodeMaxStackOverflow(usize),
    MethodCodeMaxLocalsOverflow(usize),

    /// A conditional branch needs a jump of more than 32767 bytes
    BranchOutOfRange {
        label: Label,
        distance: isize,
    },

    /// A label is referred to but never placed
    UnboundLabel(Label),

    /// A label is placed twice
    DuplicateLabel(Label),

    /// A jump target or exception handler has no recorded frame
    MissingFrame(Label),

    /// A particular offset has two conflicting frames
    ConflictingFrames(usize),

    /// A label is placed at a point that no code jumps to and that execution cannot fall into
    PlacingUnreachableLabel(Label),

    /// An instruction is pushed where execution cannot reach
    UnreachableCode,

    /// Error trying to verify
    VerifierError {
        instruction: String,
        kind: VerifierErrorKind,
    },

    /// A label needs to have incompatible frames
    IncompatibleFrames(Label, Frame<String, Label>, Frame<String, Label>),

    InvalidExceptionRange {
        start: Label,
        end: Label,
    },
}

#[derive(Debug, PartialEq)]
pub enum VerifierErrorKind {
    EmptyStack,
    InvalidWidth(usize),
    NotArrayType,
    InvalidIndex,
    InvalidType,
    IncompatibleTypes(FrameType, FrameType),
    BadDescriptor(String),
    NotLoadableConstant(ConstantIndex),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
