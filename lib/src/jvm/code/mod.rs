//! Method bodies as labelled instruction sequences
//!
//! ### Structure
//!
//! The bytecode in a [`Code`](crate::jvm::class_file::Code) attribute addresses everything by
//! byte offset: jumps, exception ranges, stack map frames, and debug tables. That makes inserting
//! even a single instruction painful. A [`MethodBody`] instead holds an ordered sequence of
//! [`Node`]s in which positions are marked with [`Label`]s, and all of the side tables refer to
//! those labels. Instructions are split into two groups:
//!
//!   - [`Instruction`] for straight-line instructions
//!   - [`BranchInstruction`] for instructions that may transfer control (jumps, switches, returns)
//!
//! Bodies are decoded with [`MethodBody::decode`] and encoded back with [`MethodBody::encode`].
//! Offsets only exist during encoding, when each label gets bound exactly once.
//!
//! ### Code generation
//!
//! New code needs stack map frames at every jump target. [`CodeBuilder`] generates code from top
//! to bottom while tracking the verifier state, so that the frames come out of the construction
//! process directly.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-6.html#jvms-6.5

mod body;
mod builder;
mod decode;
mod encode;
mod instructions;
mod label;

pub use body::*;
pub use builder::*;
pub use encode::{MAX_CODE_LENGTH, SIGNED_16BIT_JUMP_RANGE};
pub use instructions::*;
pub use label::*;
