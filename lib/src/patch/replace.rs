use super::envelope;
use super::script::{ScriptCompiler, Stmt};
use super::{PatchError, PatchOutcome};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::{CodeBuilder, MethodBody, StackDepthEnvelope};
use crate::jvm::{BinaryName, Error, MethodDescriptor, ParseDescriptor, RenderDescriptor};

/// Throw away the original code and compile a new body from scratch
///
/// The new body only depends on the method descriptor, which must be the one the script was
/// written against. Debug tables of the original body (line numbers, local variables) are
/// dropped along with it.
#[derive(Clone, Debug)]
pub struct Replacement {
    /// Method descriptor the script expects
    pub descriptor: String,
    pub body: Vec<Stmt>,
}

impl Replacement {
    pub fn apply(
        &self,
        original: Option<&MethodBody>,
        pool: &mut ConstantPool,
    ) -> Result<PatchOutcome, PatchError> {
        let original = original.ok_or(PatchError::MissingBody)?;
        let shape = original.shape.clone();

        let expected: MethodDescriptor<BinaryName> = MethodDescriptor::parse(&self.descriptor)
            .map_err(|_| Error::BadDescriptor(self.descriptor.clone()))?;
        if expected != shape.descriptor {
            return Err(PatchError::DescriptorMismatch {
                expected: self.descriptor.clone(),
                found: shape.descriptor.render(),
            });
        }
        if shape.is_constructor {
            return Err(PatchError::Unsupported(
                "replacing a constructor body".to_owned(),
            ));
        }

        let mut body = MethodBody::new(shape.clone());
        let fragment = {
            let mut builder =
                CodeBuilder::new(pool, &mut body.labels, &shape, shape.entry_frame());
            let mut compiler = ScriptCompiler::new(&mut builder, &shape, shape.parameter_slots());
            compiler.block(&self.body)?;
            builder.finish()
        };
        if fragment.exit_frame.is_some() {
            return Err(PatchError::FallsOffEnd);
        }

        body.nodes = fragment.nodes;
        body.frames = fragment.frames;
        body.handlers = fragment.handlers;
        let observed = envelope::observe(&body, pool)?;
        body.envelope = observed.envelope.dominate(StackDepthEnvelope {
            max_stack: fragment.max_stack,
            max_locals: fragment.max_locals,
        });
        Ok(PatchOutcome::Patched(body))
    }
}
