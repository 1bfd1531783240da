use super::script::{Cond, ScriptCompiler, Stmt};
use super::strategy::{canonical, run_matches};
use super::{PatchError, PatchOutcome};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::{
    BranchInstruction, CodeBuilder, Fragment, LabelAllocator, MethodBody, Node,
    StackDepthEnvelope,
};
use crate::jvm::verifier::EditFrame;

/// Checks run before the original body, each of which may take over the method
///
/// Guards are tested in order. The first guard whose condition holds runs its tail and no later
/// guard is evaluated: the tail either returns or falls through into the original body. When no
/// condition holds, the original body runs as if nothing had been inserted.
#[derive(Clone, Debug)]
pub struct PrologueGuard {
    pub guards: Vec<Guard>,
}

#[derive(Clone, Debug)]
pub struct Guard {
    pub condition: Cond,
    pub tail: Vec<Stmt>,
}

impl PrologueGuard {
    pub fn apply(
        &self,
        original: Option<&MethodBody>,
        pool: &mut ConstantPool,
    ) -> Result<PatchOutcome, PatchError> {
        let original = match original {
            None => return Ok(PatchOutcome::Unchanged),
            Some(original) => original,
        };
        if original.shape.is_constructor {
            return Err(PatchError::Unsupported(
                "guarding a constructor before its super call".to_owned(),
            ));
        }
        if self.guards.is_empty() {
            return Ok(PatchOutcome::Unchanged);
        }

        let mut scratch_pool = pool.clone();
        let mut scratch_labels = original.labels.clone();
        let block = self.guard_block(&mut scratch_pool, &mut scratch_labels, original)?;
        if contains_block(original, &block) {
            log::debug!("guards already present, leaving body as is");
            return Ok(PatchOutcome::Unchanged);
        }

        let mut body = original.clone();
        let block = self.guard_block(pool, &mut body.labels, original)?;
        let mut nodes = block.nodes;
        nodes.append(&mut body.nodes);
        body.nodes = nodes;
        body.frames.extend(block.frames);
        let mut handlers = block.handlers;
        handlers.append(&mut body.handlers);
        body.handlers = handlers;
        body.envelope = original.envelope.dominate(StackDepthEnvelope {
            max_stack: block.max_stack,
            max_locals: block.max_locals,
        });
        Ok(PatchOutcome::Patched(body))
    }

    /// Compile the guards, ending with the label the original body resumes from
    fn guard_block(
        &self,
        pool: &mut ConstantPool,
        labels: &mut LabelAllocator,
        original: &MethodBody,
    ) -> Result<Fragment, PatchError> {
        let shape = &original.shape;
        let entry = shape.entry_frame();

        // If the original code starts with a jump target, its frame must be kept
        let first = original.first_instruction();
        let resume_frame: EditFrame = original.nodes[..first]
            .iter()
            .find_map(|node| match node {
                Node::Label(label) => original.frames.get(label).cloned(),
                _ => None,
            })
            .unwrap_or_else(|| entry.clone());

        // Guard locals may reuse slots of the original body: nothing is live across `resume`
        let mut builder = CodeBuilder::new(pool, labels, shape, entry.clone());
        let resume = builder.fresh_label();
        let mut compiler = ScriptCompiler::new(&mut builder, shape, shape.parameter_slots());
        for (index, guard) in self.guards.iter().enumerate() {
            let is_last = index + 1 == self.guards.len();
            let next = if is_last {
                resume
            } else {
                compiler.builder().fresh_label()
            };

            compiler.jump_unless(&guard.condition, next)?;
            compiler.block(&guard.tail)?;
            if compiler.is_reachable() {
                compiler
                    .builder()
                    .push_branch(BranchInstruction::Goto(resume))?;
            }

            if !is_last {
                if !compiler.builder().is_jumped_to(next) {
                    log::debug!("guard {} always applies, later guards are dead", index);
                    break;
                }
                compiler.builder().place_label_with_frame(next, entry.clone())?;
            }
        }
        builder.place_label_with_frame(resume, resume_frame)?;
        Ok(builder.finish())
    }
}

/// Whether the body contains the given block of guards as one contiguous run
///
/// The block is usually first, but prologues added later by other rules end up in front of it.
fn contains_block(body: &MethodBody, block: &Fragment) -> bool {
    let expected = canonical(&block.nodes);
    (0..body.nodes.len()).any(|start| run_matches(&body.nodes, start, &expected))
}
