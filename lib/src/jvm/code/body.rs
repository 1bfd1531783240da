use super::{BranchInstruction, Instruction, Label, LabelAllocator};
use crate::jvm::verifier::{EditFrame, Frame};
use crate::jvm::{
    BinaryName, Error, FieldType, MethodAccessFlags, MethodDescriptor, Name, ParseDescriptor,
    UnqualifiedName,
};
use crate::util::Width;
use std::collections::BTreeMap;

/// Element of a method body
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Node {
    /// Position marker (takes no space in the encoded bytecode)
    Label(Label),

    /// Straight-line instruction
    Insn(Instruction),

    /// Control transfer
    Branch(BranchInstruction<Label>),
}

/// Entry in the exception table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of the protected range (inclusive)
    pub start: Label,

    /// End of the protected range (exclusive)
    pub end: Label,

    /// Where control goes when an exception is caught
    pub handler: Label,

    /// Class of exceptions caught (`None` catches everything)
    pub catch_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start: Label,
    pub line: u16,
}

/// Entry in a `LocalVariableTable` or `LocalVariableTypeTable`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start: Label,
    pub end: Label,
    pub name: String,
    pub descriptor: String,
    pub index: u16,
}

/// Declared bounds on the operand stack height and on the local variable slots
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StackDepthEnvelope {
    pub max_stack: u16,
    pub max_locals: u16,
}

impl StackDepthEnvelope {
    /// Smallest envelope containing both envelopes
    pub fn dominate(self, other: StackDepthEnvelope) -> StackDepthEnvelope {
        StackDepthEnvelope {
            max_stack: self.max_stack.max(other.max_stack),
            max_locals: self.max_locals.max(other.max_locals),
        }
    }
}

/// Everything about the enclosing method that matters for its body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodShape {
    /// Binary name of the class declaring the method
    pub this_class: String,
    pub is_static: bool,
    pub is_constructor: bool,
    pub descriptor: MethodDescriptor<BinaryName>,
}

impl MethodShape {
    pub fn parse(
        this_class: &str,
        name: &str,
        access_flags: MethodAccessFlags,
        descriptor: &str,
    ) -> Result<MethodShape, Error> {
        let descriptor = MethodDescriptor::parse(descriptor)
            .map_err(|_| Error::BadDescriptor(descriptor.to_owned()))?;
        Ok(MethodShape {
            this_class: this_class.to_owned(),
            is_static: access_flags.contains(MethodAccessFlags::STATIC),
            is_constructor: name == UnqualifiedName::INIT.as_str(),
            descriptor,
        })
    }

    /// Implicit frame at the start of the method
    pub fn entry_frame(&self) -> EditFrame {
        Frame::method_entry(
            &self.this_class,
            self.is_static,
            self.is_constructor,
            &self.descriptor,
        )
    }

    /// Local slots taken by the parameters (including `this`)
    pub fn parameter_slots(&self) -> u16 {
        self.descriptor.parameter_slots(!self.is_static) as u16
    }

    /// Local slot of a parameter (0-indexed, not counting `this`)
    pub fn parameter_slot(&self, parameter: usize) -> Option<(u16, &FieldType<BinaryName>)> {
        let field_type = self.descriptor.parameters.get(parameter)?;
        let mut slot = if self.is_static { 0 } else { 1 };
        for previous in &self.descriptor.parameters[..parameter] {
            slot += previous.width() as u16;
        }
        Some((slot, field_type))
    }

    pub fn return_type(&self) -> &Option<FieldType<BinaryName>> {
        &self.descriptor.return_type
    }
}

/// Method body in which all positions are labels instead of byte offsets
///
/// Side tables (handlers, frames, debug information) refer to positions through labels placed in
/// `nodes`, so instructions can be inserted or removed without any offset fix-ups. Offsets only
/// come back when the body is encoded.
#[derive(Clone, Debug)]
pub struct MethodBody {
    pub shape: MethodShape,
    pub envelope: StackDepthEnvelope,
    pub nodes: Vec<Node>,

    /// Exception handlers, in priority order
    pub handlers: Vec<ExceptionHandler>,

    /// Stack map frames (in uncompressed form) at labels
    pub frames: BTreeMap<Label, EditFrame>,

    pub line_numbers: Vec<LineNumberEntry>,
    pub local_variables: Vec<LocalVariableEntry>,
    pub local_variable_types: Vec<LocalVariableEntry>,

    /// Source of fresh labels for this body
    pub labels: LabelAllocator,
}

impl MethodBody {
    /// Empty body whose envelope just fits the parameters
    pub fn new(shape: MethodShape) -> MethodBody {
        let envelope = StackDepthEnvelope {
            max_stack: 0,
            max_locals: shape.parameter_slots(),
        };
        MethodBody {
            shape,
            envelope,
            nodes: vec![],
            handlers: vec![],
            frames: BTreeMap::new(),
            line_numbers: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            labels: LabelAllocator::new(),
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    pub fn push_insn(&mut self, insn: Instruction) {
        self.nodes.push(Node::Insn(insn));
    }

    pub fn push_branch(&mut self, branch: BranchInstruction<Label>) {
        self.nodes.push(Node::Branch(branch));
    }

    pub fn place_label(&mut self, label: Label) {
        self.nodes.push(Node::Label(label));
    }

    /// Number of instructions (labels excluded)
    pub fn instruction_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| !matches!(node, Node::Label(_)))
            .count()
    }

    /// Index in `nodes` of the first instruction, skipping any leading labels
    pub fn first_instruction(&self) -> usize {
        self.nodes
            .iter()
            .position(|node| !matches!(node, Node::Label(_)))
            .unwrap_or(self.nodes.len())
    }

    /// Position of a label in `nodes`
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node == &Node::Label(label))
    }

    /// Label placed right before the instruction at `index` (placing one if there isn't one)
    pub fn label_at(&mut self, index: usize) -> Label {
        if index > 0 {
            if let Node::Label(label) = self.nodes[index - 1] {
                return label;
            }
        }
        let label = self.labels.fresh();
        self.nodes.insert(index, Node::Label(label));
        label
    }

    /// Labels that something jumps to (branches or exception handlers)
    pub fn jump_targets(&self) -> Vec<Label> {
        let mut targets = vec![];
        for node in &self.nodes {
            if let Node::Branch(branch) = node {
                targets.extend(branch.jump_targets());
            }
        }
        targets.extend(self.handlers.iter().map(|handler| handler.handler));
        targets
    }

    /// Whether execution can run past the last node
    pub fn falls_off_end(&self) -> bool {
        match self.nodes.iter().rev().find(|node| !matches!(node, Node::Label(_))) {
            None => true,
            Some(Node::Branch(branch)) => branch.falls_through(),
            Some(_) => true,
        }
    }
}
