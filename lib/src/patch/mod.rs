//! Targeted rewrites of individual methods
//!
//! A patch is a [`MethodSignature`] naming the method plus a [`PatchStrategy`] describing the
//! rewrite. Strategies work on decoded [`MethodBody`] values and never see byte offsets:
//!
//!   - [`WrapGuard`] wraps the whole body in an exception handler returning a fallback value
//!   - [`PrologueGuard`] runs a chain of guards before the original body
//!   - [`Replacement`] compiles a brand new body from a [`script`]
//!
//! Every patched body goes through the [`envelope`] check before it is encoded, so a body whose
//! declared `max_stack` or `max_locals` is too small is never written out.

mod errors;
pub mod envelope;
mod prologue;
mod replace;
pub mod script;
mod signature;
mod strategy;
mod wrap;

pub use errors::*;
pub use prologue::*;
pub use replace::*;
pub use signature::*;
pub use strategy::{PatchOutcome, PatchStrategy};
pub use wrap::*;

use crate::jvm::class_file::ClassFile;
use crate::jvm::code::{MethodBody, StackDepthEnvelope};

/// What patching a class did to the target method
#[derive(Debug, PartialEq, Eq)]
pub enum MethodPatch {
    /// The class does not declare the method
    NotFound,

    /// The strategy had nothing to do, or produced the code already there
    Unchanged,

    Applied {
        /// Index in `ClassFile::methods`
        index: usize,
        envelope: StackDepthEnvelope,
    },
}

/// Apply a strategy to one method of a class, in place
///
/// On error, the class may have gained unused constants but its methods are untouched.
pub fn patch_class(
    class: &mut ClassFile,
    target: &MethodSignature,
    strategy: &PatchStrategy,
    max_code_length: usize,
) -> Result<MethodPatch, PatchError> {
    let located = match locate(class, target)? {
        None => return Ok(MethodPatch::NotFound),
        Some(located) => located,
    };

    let body: MethodBody = match strategy.apply(located.body.as_ref(), &mut class.constants)? {
        PatchOutcome::Unchanged => return Ok(MethodPatch::Unchanged),
        PatchOutcome::Patched(body) => body,
    };
    let observed = envelope::check(&body, &class.constants)?;
    log::debug!(
        "{} patched by {}: declared {:?}, observed {:?}",
        target,
        strategy.kind(),
        body.envelope,
        observed
    );

    let code = body.encode_with_limit(&mut class.constants, class.version, max_code_length)?;
    if class.method_code(located.index)?.as_ref() == Some(&code) {
        return Ok(MethodPatch::Unchanged);
    }
    class.set_method_code(located.index, &code)?;
    Ok(MethodPatch::Applied {
        index: located.index,
        envelope: body.envelope,
    })
}
