//! Targeted, verifier-preserving edits to JVM method bodies
//!
//! The crate is layered from the bottom up:
//!
//!   - [`jvm`] reads and writes class files, and converts method `Code` attributes to and from a
//!     label-based instruction model
//!   - [`patch`] locates methods by exact signature and rewrites their bodies using one of a few
//!     patch strategies, validating the stack/locals envelope of every body it emits
//!   - [`pipeline`] applies a priority-ordered table of patch rules to a class image, falling back
//!     to the unmodified bytes whenever something goes wrong

pub mod jvm;
pub mod patch;
pub mod pipeline;
mod util;
