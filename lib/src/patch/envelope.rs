//! Stack and local accounting for finished method bodies
//!
//! Patched bodies are replayed over their control flow graph, tracking only the height of the
//! operand stack (in slots) and the local slots touched. This is much weaker than verification,
//! but it is exactly what is needed to check that a declared `max_stack`/`max_locals` covers
//! every reachable point of the code.

use super::{EnvelopeViolation, PatchError};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::{Label, MethodBody, Node, StackDepthEnvelope};
use crate::jvm::Error;
use std::collections::HashMap;

/// Result of replaying a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Smallest envelope covering the body
    pub envelope: StackDepthEnvelope,

    /// Node after which the stack first reached its peak
    pub peak_at: usize,
}

/// Compute the smallest envelope covering a body
///
/// Stack heights must agree wherever control flow merges. Exception handlers are entered with
/// just the exception on the stack.
pub fn observe(body: &MethodBody, pool: &ConstantPool) -> Result<Observation, PatchError> {
    let label_positions: HashMap<Label, usize> = body
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(position, node)| match node {
            Node::Label(label) => Some((*label, position)),
            _ => None,
        })
        .collect();

    let mut walk = Walk {
        label_positions: &label_positions,
        heights: vec![None; body.nodes.len()],
        worklist: vec![],
    };
    walk.reach(0, 0)?;
    for handler in &body.handlers {
        let position = walk.position_of(handler.handler)?;
        walk.reach(position, 1)?;
    }

    let mut max_stack = 0;
    let mut peak_at = 0;
    let mut max_locals = body.shape.parameter_slots();
    while let Some(position) = walk.worklist.pop() {
        let height = walk.heights[position].unwrap_or(0);
        let after = match &body.nodes[position] {
            Node::Label(_) => {
                walk.reach(position + 1, height)?;
                height
            }
            Node::Insn(insn) => {
                let effect = insn.stack_effect(pool)?;
                let after = popped(height, effect.pops, position)? + effect.pushes;
                if let Some((slot, width)) = insn.local_access() {
                    max_locals = max_locals.max(locals_needed(slot, width, position)?);
                }
                walk.reach(position + 1, after)?;
                after
            }
            Node::Branch(branch) => {
                let after = popped(height, branch.stack_pops(), position)?;
                for target in branch.jump_targets() {
                    let target_position = walk.position_of(target)?;
                    walk.reach(target_position, after)?;
                }
                if branch.falls_through() {
                    walk.reach(position + 1, after)?;
                }
                after
            }
        };
        let peak = height.max(after);
        if peak > max_stack || (peak == max_stack && position < peak_at) {
            max_stack = peak;
            peak_at = position;
        }
    }

    let max_stack = u16::try_from(max_stack).map_err(|_| {
        PatchError::EnvelopeUnderflow(EnvelopeViolation::StackExceeded {
            instruction: peak_at,
            height: max_stack,
            max_stack: u16::MAX,
        })
    })?;
    Ok(Observation {
        envelope: StackDepthEnvelope {
            max_stack,
            max_locals,
        },
        peak_at,
    })
}

/// Check that the declared envelope of a body covers what the code actually uses
///
/// Returns the observed envelope. Nothing is clamped: an envelope that is too small is an error.
pub fn check(body: &MethodBody, pool: &ConstantPool) -> Result<StackDepthEnvelope, PatchError> {
    let declared = body.envelope;
    let parameters = body.shape.parameter_slots();
    if parameters > declared.max_locals {
        return Err(PatchError::EnvelopeUnderflow(
            EnvelopeViolation::ParametersExceedLocals {
                parameters,
                max_locals: declared.max_locals,
            },
        ));
    }

    let observed = observe(body, pool)?;
    if observed.envelope.max_stack > declared.max_stack {
        return Err(PatchError::EnvelopeUnderflow(
            EnvelopeViolation::StackExceeded {
                instruction: observed.peak_at,
                height: observed.envelope.max_stack as usize,
                max_stack: declared.max_stack,
            },
        ));
    }
    for (position, node) in body.nodes.iter().enumerate() {
        if let Node::Insn(insn) = node {
            if let Some((slot, width)) = insn.local_access() {
                if locals_needed(slot, width, position)? > declared.max_locals {
                    return Err(PatchError::EnvelopeUnderflow(
                        EnvelopeViolation::LocalOutOfRange {
                            instruction: position,
                            slot,
                            max_locals: declared.max_locals,
                        },
                    ));
                }
            }
        }
    }
    Ok(observed.envelope)
}

/// Number of locals needed for an access of `width` slots starting at `slot`
fn locals_needed(slot: u16, width: usize, position: usize) -> Result<u16, PatchError> {
    u16::try_from(width)
        .ok()
        .and_then(|width| slot.checked_add(width))
        .ok_or(PatchError::EnvelopeUnderflow(
            EnvelopeViolation::LocalsOverflow {
                instruction: position,
                slot,
            },
        ))
}

fn popped(height: usize, pops: usize, position: usize) -> Result<usize, PatchError> {
    height.checked_sub(pops).ok_or(PatchError::EnvelopeUnderflow(
        EnvelopeViolation::StackUnderflow {
            instruction: position,
            height,
        },
    ))
}

struct Walk<'a> {
    label_positions: &'a HashMap<Label, usize>,

    /// Stack height before each node (`None` if not yet reached)
    heights: Vec<Option<usize>>,
    worklist: Vec<usize>,
}

impl<'a> Walk<'a> {
    fn position_of(&self, label: Label) -> Result<usize, PatchError> {
        match self.label_positions.get(&label) {
            Some(position) => Ok(*position),
            None => Err(PatchError::Class(Error::UnboundLabel(label))),
        }
    }

    fn reach(&mut self, position: usize, height: usize) -> Result<(), PatchError> {
        // Falling off the end is not an envelope concern
        let slot = match self.heights.get_mut(position) {
            None => return Ok(()),
            Some(slot) => slot,
        };
        match *slot {
            None => {
                *slot = Some(height);
                self.worklist.push(position);
                Ok(())
            }
            Some(existing) if existing == height => Ok(()),
            Some(existing) => Err(PatchError::EnvelopeUnderflow(
                EnvelopeViolation::InconsistentHeight {
                    instruction: position,
                    first: existing,
                    second: height,
                },
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{
        BranchInstruction, ExceptionHandler, Instruction, MethodShape, OrdComparison,
    };
    use crate::jvm::MethodAccessFlags;

    fn body(descriptor: &str) -> MethodBody {
        let shape =
            MethodShape::parse("Test", "run", MethodAccessFlags::STATIC, descriptor).unwrap();
        MethodBody::new(shape)
    }

    #[test]
    fn straight_line_peak() {
        let pool = ConstantPool::new();
        let mut body = body("(J)J");
        body.push_insn(Instruction::LLoad(0));
        body.push_insn(Instruction::LConst1);
        body.push_insn(Instruction::LAdd);
        body.push_branch(BranchInstruction::LReturn);

        let observed = observe(&body, &pool).unwrap();
        assert_eq!(observed.envelope.max_stack, 4);
        assert_eq!(observed.envelope.max_locals, 2);
        assert_eq!(observed.peak_at, 1);

        body.envelope.max_stack = 4;
        assert_eq!(check(&body, &pool).unwrap(), observed.envelope);

        body.envelope.max_stack = 3;
        match check(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(EnvelopeViolation::StackExceeded {
                instruction: 1,
                height: 4,
                max_stack: 3,
            })) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn locals_beyond_declared() {
        let pool = ConstantPool::new();
        let mut body = body("()V");
        body.push_insn(Instruction::IConst0);
        body.push_insn(Instruction::IStore(3));
        body.push_branch(BranchInstruction::Return);
        body.envelope.max_stack = 1;
        body.envelope.max_locals = 3;

        match check(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(EnvelopeViolation::LocalOutOfRange {
                instruction: 1,
                slot: 3,
                max_locals: 3,
            })) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn handlers_start_with_one_slot() {
        let pool = ConstantPool::new();
        let mut body = body("()I");
        let start = body.fresh_label();
        let end = body.fresh_label();
        let handler = body.fresh_label();
        body.place_label(start);
        body.push_insn(Instruction::IConst1);
        body.push_branch(BranchInstruction::IReturn);
        body.place_label(end);
        body.place_label(handler);
        body.push_insn(Instruction::Pop);
        body.push_insn(Instruction::IConst0);
        body.push_branch(BranchInstruction::IReturn);
        body.handlers.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type: None,
        });

        let observed = observe(&body, &pool).unwrap();
        assert_eq!(observed.envelope.max_stack, 1);
    }

    #[test]
    fn mismatched_heights_at_merge() {
        let pool = ConstantPool::new();
        let mut body = body("(I)V");
        let join = body.fresh_label();
        body.push_insn(Instruction::ILoad(0));
        body.push_branch(BranchInstruction::If(OrdComparison::EQ, join));
        body.push_insn(Instruction::IConst1);
        body.place_label(join);
        body.push_branch(BranchInstruction::Return);

        match observe(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(EnvelopeViolation::InconsistentHeight {
                ..
            })) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn underflow() {
        let pool = ConstantPool::new();
        let mut body = body("()V");
        body.push_insn(Instruction::Pop);
        body.push_branch(BranchInstruction::Return);

        match observe(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(EnvelopeViolation::StackUnderflow {
                instruction: 0,
                height: 0,
            })) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wide_access_past_last_slot() {
        let pool = ConstantPool::new();
        let mut body = body("()I");
        body.push_insn(Instruction::ILoad(65534));
        body.push_insn(Instruction::Pop);
        body.push_insn(Instruction::LLoad(65535));
        body.push_insn(Instruction::L2I);
        body.push_branch(BranchInstruction::IReturn);
        body.envelope.max_stack = 2;
        body.envelope.max_locals = u16::MAX;

        let overflow = EnvelopeViolation::LocalsOverflow {
            instruction: 2,
            slot: 65535,
        };
        match observe(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(violation)) if violation == overflow => (),
            other => panic!("unexpected {:?}", other),
        }
        match check(&body, &pool) {
            Err(PatchError::EnvelopeUnderflow(violation)) if violation == overflow => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn too_few_locals_for_parameters() {
        let pool = ConstantPool::new();
        let mut body = body("(JI)V");
        body.push_branch(BranchInstruction::Return);
        body.envelope.max_locals = 2;
        assert!(matches!(
            check(&body, &pool),
            Err(PatchError::EnvelopeUnderflow(
                EnvelopeViolation::ParametersExceedLocals {
                    parameters: 3,
                    max_locals: 2
                }
            ))
        ));
    }
}
