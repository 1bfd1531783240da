use super::{PatchError, PrologueGuard, Replacement, WrapGuard};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::{BranchInstruction, Instruction, Label, MethodBody, Node};
use std::collections::HashMap;

/// How a method gets rewritten
///
/// Strategies are pure: they read the original body and produce a new one, interning whatever
/// constants the new code needs into the pool of the enclosing class.
#[derive(Clone, Debug)]
pub enum PatchStrategy {
    WrapGuard(WrapGuard),
    PrologueGuard(PrologueGuard),
    Replacement(Replacement),
}

/// What a strategy did to a method
#[derive(Debug)]
pub enum PatchOutcome {
    Patched(MethodBody),

    /// Nothing to do (no body to wrap, or the patch is already there)
    Unchanged,
}

impl PatchStrategy {
    /// Produce the patched body
    ///
    /// `original` is `None` for abstract and native methods.
    pub fn apply(
        &self,
        original: Option<&MethodBody>,
        pool: &mut ConstantPool,
    ) -> Result<PatchOutcome, PatchError> {
        match self {
            PatchStrategy::WrapGuard(wrap) => wrap.apply(original, pool),
            PatchStrategy::PrologueGuard(prologue) => prologue.apply(original, pool),
            PatchStrategy::Replacement(replacement) => replacement.apply(original, pool),
        }
    }

    /// Short name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PatchStrategy::WrapGuard(_) => "wrap-with-guard",
            PatchStrategy::PrologueGuard(_) => "prologue-guard",
            PatchStrategy::Replacement(_) => "full-replace",
        }
    }
}

impl From<WrapGuard> for PatchStrategy {
    fn from(wrap: WrapGuard) -> PatchStrategy {
        PatchStrategy::WrapGuard(wrap)
    }
}

impl From<PrologueGuard> for PatchStrategy {
    fn from(prologue: PrologueGuard) -> PatchStrategy {
        PatchStrategy::PrologueGuard(prologue)
    }
}

impl From<Replacement> for PatchStrategy {
    fn from(replacement: Replacement) -> PatchStrategy {
        PatchStrategy::Replacement(replacement)
    }
}

/// Instruction with its labels replaced by positions relative to a run of nodes
///
/// Two runs of nodes with the same canonical form do the same thing, even if they were built
/// with different labels. Targets outside of the run are `None`.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum CanonicalNode {
    Insn(Instruction),
    Branch(BranchInstruction<Option<usize>>),
}

pub(super) fn canonical(nodes: &[Node]) -> Vec<CanonicalNode> {
    let mut positions: HashMap<Label, usize> = HashMap::new();
    let mut instructions = 0;
    for node in nodes {
        match node {
            Node::Label(label) => {
                positions.insert(*label, instructions);
            }
            _ => instructions += 1,
        }
    }

    nodes
        .iter()
        .filter_map(|node| match node {
            Node::Label(_) => None,
            Node::Insn(insn) => Some(CanonicalNode::Insn(insn.clone())),
            Node::Branch(branch) => {
                let mapped = branch.map_labels(|label| -> Result<Option<usize>, ()> {
                    Ok(positions.get(label).copied())
                });
                mapped.ok().map(CanonicalNode::Branch)
            }
        })
        .collect()
}

/// Whether the nodes from `start` on begin with a run canonically equal to `expected`
///
/// Labels right after the last instruction of the run are part of it, so that jumps to the end
/// of the run resolve the same way they do in `expected`.
pub(super) fn run_matches(nodes: &[Node], start: usize, expected: &[CanonicalNode]) -> bool {
    let mut end = start;
    let mut instructions = 0;
    while instructions < expected.len() {
        match nodes.get(end) {
            None => return false,
            Some(Node::Label(_)) => (),
            Some(_) => instructions += 1,
        }
        end += 1;
    }
    while let Some(Node::Label(_)) = nodes.get(end) {
        end += 1;
    }
    canonical(&nodes[start..end]) == expected
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{LabelAllocator, OrdComparison};

    #[test]
    fn canonical_ignores_label_identity() {
        let mut labels = LabelAllocator::new();
        let mut build = |skip_first: bool| {
            if skip_first {
                labels.fresh();
            }
            let target = labels.fresh();
            let outside = labels.fresh();
            vec![
                Node::Insn(Instruction::ILoad(0)),
                Node::Branch(BranchInstruction::If(OrdComparison::EQ, target)),
                Node::Branch(BranchInstruction::Goto(outside)),
                Node::Label(target),
                Node::Branch(BranchInstruction::Return),
            ]
        };
        let first = build(false);
        let second = build(true);
        assert_ne!(first, second);
        assert_eq!(canonical(&first), canonical(&second));
        assert_eq!(
            canonical(&first)[1],
            CanonicalNode::Branch(BranchInstruction::If(OrdComparison::EQ, Some(3)))
        );
        assert_eq!(
            canonical(&first)[2],
            CanonicalNode::Branch(BranchInstruction::Goto(None))
        );
    }

    #[test]
    fn runs_match_away_from_the_start() {
        let mut labels = LabelAllocator::new();
        let end = labels.fresh();
        let run = vec![
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::If(OrdComparison::EQ, end)),
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::IReturn),
            Node::Label(end),
        ];
        let expected = canonical(&run);

        let moved = labels.fresh();
        let mut nodes = vec![
            Node::Insn(Instruction::Nop),
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::If(OrdComparison::EQ, moved)),
            Node::Insn(Instruction::IConst0),
            Node::Branch(BranchInstruction::IReturn),
            Node::Label(moved),
            Node::Insn(Instruction::ILoad(0)),
            Node::Branch(BranchInstruction::IReturn),
        ];
        assert!(!run_matches(&nodes, 0, &expected));
        assert!(run_matches(&nodes, 1, &expected));

        // The jump target has to be the end of the run
        nodes.swap(5, 6);
        assert!(!run_matches(&nodes, 1, &expected));
        assert!(!run_matches(&nodes, 7, &expected));
    }
}
