//! Read, inspect, and rewrite JVM classes
//!
//! ### Simple example
//!
//! Building a class with a single static method and reading it back:
//!
//! ```
//! use classpatch::jvm::class_file::{ClassFile, Version};
//! use classpatch::jvm::code::{BranchInstruction, Instruction, MethodBody, MethodShape};
//! use classpatch::jvm::*;
//!
//! # fn main() -> Result<(), Error> {
//! let mut class = ClassFile::new(
//!     "me/alec/Answer",
//!     Some("java/lang/Object"),
//!     ClassAccessFlags::PUBLIC,
//!     Version::JAVA8,
//! )?;
//! let method = class.add_method(
//!     MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
//!     "answer",
//!     "()I",
//!     None,
//! )?;
//!
//! let shape = MethodShape::parse("me/alec/Answer", "answer", MethodAccessFlags::STATIC, "()I")?;
//! let mut body = MethodBody::new(shape);
//! body.push_insn(Instruction::BiPush(42));
//! body.push_branch(BranchInstruction::IReturn);
//! body.envelope.max_stack = 1;
//! let code = body.encode(&mut class.constants, class.version)?;
//! class.set_method_code(method, &code)?;
//!
//! let bytes = class.to_bytes()?;
//! let parsed = ClassFile::parse(&bytes)?;
//! assert_eq!(parsed.name()?, "me/alec/Answer");
//! assert_eq!(parsed.method_code(method)?, Some(code));
//! # Ok(())
//! # }
//! ```
//!
//! ### Layers
//!
//!   - [`class_file`] is the raw class file: constant pool, members, attributes
//!   - [`code`] decodes `Code` attributes into labelled instructions and back again
//!   - [`verifier`] has the verification types and frames used to keep the `StackMapTable` valid

mod access_flags;
mod binary_format;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;
mod names;
pub mod verifier;

pub use access_flags::*;
pub use binary_format::*;
pub use descriptors::*;
pub use errors::*;
pub use names::*;
