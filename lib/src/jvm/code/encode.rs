//! Lay out a [`MethodBody`] back into a `Code` attribute
//!
//! Layout is iterative: offsets are computed assuming every `goto` is short, then any `goto` whose
//! jump does not fit in a signed 16-bit offset is switched to `goto_w` and the layout is redone.
//! This terminates since a `goto` never switches back. Conditional branches have no wide form, so
//! one that is out of range is an error.

use super::*;
use crate::jvm::binary_format::Serialize;
use crate::jvm::class_file::{
    BytecodeArray, BytecodeIndex, Code, ConstantPool, ExceptionTableEntry, LineNumber,
    LineNumberTable, LocalVariable, LocalVariableTable, LocalVariableTypeTable, StackMapTable,
    Version,
};
use crate::jvm::verifier::{ClassFileFrame, EditFrame, Frame};
use crate::jvm::Error;
use crate::util::Width;
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;

/// Largest `Code` the class file format allows
pub const MAX_CODE_LENGTH: usize = 65535;

/// Range of relative jump offsets supported by `goto` and `if*` branch instructions
pub const SIGNED_16BIT_JUMP_RANGE: RangeInclusive<isize> =
    RangeInclusive::new(i16::MIN as isize, i16::MAX as isize);

impl MethodBody {
    /// Encode the body into a `Code` attribute, interning any constants it needs
    pub fn encode(&self, pool: &mut ConstantPool, version: Version) -> Result<Code, Error> {
        self.encode_with_limit(pool, version, MAX_CODE_LENGTH)
    }

    /// Same as [`MethodBody::encode`], but with a custom bound on the length of the bytecode
    pub fn encode_with_limit(
        &self,
        pool: &mut ConstantPool,
        version: Version,
        max_code_length: usize,
    ) -> Result<Code, Error> {
        let layout = Layout::compute(&self.nodes)?;
        if layout.code_length > max_code_length.min(MAX_CODE_LENGTH) {
            return Err(Error::MethodCodeOverflow(layout.code_length));
        }

        let mut bytes: Vec<u8> = Vec::with_capacity(layout.code_length);
        for (index, node) in self.nodes.iter().enumerate() {
            let offset = layout.offsets[index];
            match node {
                Node::Label(_) => (),
                Node::Insn(insn) => insn.serialize(&mut bytes)?,
                Node::Branch(branch) => {
                    let wide = layout.wide_gotos.contains(&index);
                    encode_branch(branch, offset, wide, &layout.labels, &mut bytes)?;
                }
            }
            debug_assert_eq!(bytes.len(), layout.offsets[index + 1]);
        }

        let labels = &layout.labels;
        let bytecode_index = |label: Label| -> Result<BytecodeIndex, Error> {
            labels.offset_of(label).map(|offset| BytecodeIndex(offset as u16))
        };

        let mut exception_table = vec![];
        for handler in &self.handlers {
            let start_pc = bytecode_index(handler.start)?;
            let end_pc = bytecode_index(handler.end)?;
            if start_pc >= end_pc {
                return Err(Error::InvalidExceptionRange {
                    start: handler.start,
                    end: handler.end,
                });
            }
            let catch_type = match &handler.catch_type {
                None => None,
                Some(class) => Some(pool.get_class(class)?),
            };
            exception_table.push(ExceptionTableEntry {
                start_pc,
                end_pc,
                handler_pc: bytecode_index(handler.handler)?,
                catch_type,
            });
        }

        let mut attributes = vec![];
        if version.supports_stack_map_table() {
            let table = self.stack_map_table(pool, &layout)?;
            if !table.0.is_empty() {
                attributes.push(pool.get_attribute(&table)?);
            }
        }
        if !self.line_numbers.is_empty() {
            let lines = self
                .line_numbers
                .iter()
                .map(|line| {
                    Ok(LineNumber {
                        start_pc: bytecode_index(line.start)?,
                        line_number: line.line,
                    })
                })
                .collect::<Result<_, Error>>()?;
            attributes.push(pool.get_attribute(&LineNumberTable(lines))?);
        }
        if !self.local_variables.is_empty() {
            let locals = encode_locals(&self.local_variables, pool, labels)?;
            attributes.push(pool.get_attribute(&LocalVariableTable(locals))?);
        }
        if !self.local_variable_types.is_empty() {
            let locals = encode_locals(&self.local_variable_types, pool, labels)?;
            attributes.push(pool.get_attribute(&LocalVariableTypeTable(locals))?);
        }

        Ok(Code {
            max_stack: self.envelope.max_stack,
            max_locals: self.envelope.max_locals,
            code_array: BytecodeArray(bytes),
            exception_table,
            attributes,
        })
    }

    /// Compressed stack map frames, sorted by offset
    fn stack_map_table(
        &self,
        pool: &mut ConstantPool,
        layout: &Layout,
    ) -> Result<StackMapTable, Error> {
        // Frames at the same offset must agree
        let mut by_offset: BTreeMap<usize, &EditFrame> = BTreeMap::new();
        for (label, frame) in &self.frames {
            let offset = match layout.labels.offset_of(*label) {
                Ok(offset) => offset,
                Err(_) => continue,
            };
            if offset == layout.code_length {
                continue;
            }
            if let Some(existing) = by_offset.insert(offset, frame) {
                if !existing.same_as(frame) {
                    return Err(Error::ConflictingFrames(offset));
                }
            }
        }

        // Every jump target and every instruction after an unconditional jump needs a frame
        for label in self.jump_targets() {
            let offset = layout.labels.offset_of(label)?;
            if !by_offset.contains_key(&offset) {
                return Err(Error::MissingFrame(label));
            }
        }
        let mut after_jump = false;
        let mut last_label = None;
        for (index, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Label(label) => last_label = Some(*label),
                Node::Insn(_) | Node::Branch(_) => {
                    if after_jump && !by_offset.contains_key(&layout.offsets[index]) {
                        return Err(last_label.map_or(Error::UnreachableCode, Error::MissingFrame));
                    }
                    after_jump = matches!(node, Node::Branch(branch) if !branch.falls_through());
                    last_label = None;
                }
            }
        }

        let to_class_file = |frame: &EditFrame, pool: &mut ConstantPool| -> Result<ClassFileFrame, Error> {
            let classes = frame.try_map(
                |class: &String| Ok::<String, Error>(class.clone()),
                |label: &Label| layout.labels.offset_of(*label).map(|offset| offset as u16),
            )?;
            let mut locals = vec![];
            let mut stack = vec![];
            for (from, to) in [(&classes.locals, &mut locals), (&classes.stack, &mut stack)] {
                for typ in from {
                    to.push(typ.try_map(|class| pool.get_class(class), |offset| Ok(*offset))?);
                }
            }
            Ok(Frame { locals, stack })
        };

        let mut previous = to_class_file(&self.shape.entry_frame(), pool)?;
        let mut previous_offset: Option<usize> = None;
        let mut frames = vec![];
        for (offset, frame) in by_offset {
            let frame = to_class_file(frame, pool)?;
            let offset_delta = match previous_offset {
                None => offset,
                Some(previous_offset) => offset - previous_offset - 1,
            };
            frames.push(frame.stack_map_frame(offset_delta as u16, &previous));
            previous = frame;
            previous_offset = Some(offset);
        }
        Ok(StackMapTable(frames))
    }
}

fn encode_locals(
    locals: &[LocalVariableEntry],
    pool: &mut ConstantPool,
    labels: &LabelTable,
) -> Result<Vec<LocalVariable>, Error> {
    locals
        .iter()
        .map(|local| {
            let start = labels.offset_of(local.start)?;
            let end = labels.offset_of(local.end)?;
            Ok(LocalVariable {
                start_pc: BytecodeIndex(start as u16),
                length: end.saturating_sub(start) as u16,
                name: pool.get_utf8(&local.name)?,
                descriptor: pool.get_utf8(&local.descriptor)?,
                index: local.index,
            })
        })
        .collect()
}

/// Offsets of every node, along with which `goto`s need to be wide
struct Layout {
    /// Offset of each node (plus one extra entry for the end of the code)
    offsets: Vec<usize>,
    labels: LabelTable,
    wide_gotos: HashSet<usize>,
    code_length: usize,
}

impl Layout {
    fn compute(nodes: &[Node]) -> Result<Layout, Error> {
        let mut wide_gotos: HashSet<usize> = HashSet::new();
        loop {
            let mut offsets = Vec::with_capacity(nodes.len() + 1);
            let mut labels = LabelTable::new();
            let mut offset = 0;
            for (index, node) in nodes.iter().enumerate() {
                offsets.push(offset);
                offset += match node {
                    Node::Label(label) => {
                        labels.bind(*label, offset)?;
                        0
                    }
                    Node::Insn(insn) => insn.width(),
                    Node::Branch(branch) => branch_width(branch, offset, wide_gotos.contains(&index)),
                };
            }
            offsets.push(offset);

            // Look for `goto`s that are out of range
            let mut changed = false;
            for (index, node) in nodes.iter().enumerate() {
                if let Node::Branch(BranchInstruction::Goto(target)) = node {
                    let distance = labels.offset_of(*target)? as isize - offsets[index] as isize;
                    if !SIGNED_16BIT_JUMP_RANGE.contains(&distance) && wide_gotos.insert(index) {
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(Layout {
                    offsets,
                    labels,
                    wide_gotos,
                    code_length: offset,
                });
            }
        }
    }
}

/// Bytes taken up by a branch instruction at a given offset
fn branch_width(branch: &BranchInstruction<Label>, offset: usize, wide: bool) -> usize {
    match branch {
        BranchInstruction::If(_, _)
        | BranchInstruction::IfICmp(_, _)
        | BranchInstruction::IfACmp(_, _)
        | BranchInstruction::IfNull(_, _) => 3,
        BranchInstruction::Goto(_) if wide => 5,
        BranchInstruction::Goto(_) => 3,
        BranchInstruction::TableSwitch { targets, .. } => {
            1 + super::decode::padding(offset) + 12 + 4 * targets.len()
        }
        BranchInstruction::LookupSwitch { targets, .. } => {
            1 + super::decode::padding(offset) + 8 + 8 * targets.len()
        }
        BranchInstruction::IReturn
        | BranchInstruction::LReturn
        | BranchInstruction::FReturn
        | BranchInstruction::DReturn
        | BranchInstruction::AReturn
        | BranchInstruction::Return
        | BranchInstruction::AThrow => 1,
    }
}

fn encode_branch(
    branch: &BranchInstruction<Label>,
    offset: usize,
    wide: bool,
    labels: &LabelTable,
    bytes: &mut Vec<u8>,
) -> Result<(), Error> {
    let relative = |label: &Label| -> Result<isize, Error> {
        Ok(labels.offset_of(*label)? as isize - offset as isize)
    };
    let short_jump = |opcode: u8, label: &Label, bytes: &mut Vec<u8>| -> Result<(), Error> {
        let distance = relative(label)?;
        if !SIGNED_16BIT_JUMP_RANGE.contains(&distance) {
            return Err(Error::BranchOutOfRange {
                label: *label,
                distance,
            });
        }
        opcode.serialize(bytes)?;
        (distance as i16).serialize(bytes)?;
        Ok(())
    };

    match branch {
        BranchInstruction::If(comparison, label) => {
            short_jump(0x99 + ord_comparison_offset(*comparison), label, bytes)?
        }
        BranchInstruction::IfICmp(comparison, label) => {
            short_jump(0x9F + ord_comparison_offset(*comparison), label, bytes)?
        }
        BranchInstruction::IfACmp(EqComparison::EQ, label) => short_jump(0xA5, label, bytes)?,
        BranchInstruction::IfACmp(EqComparison::NE, label) => short_jump(0xA6, label, bytes)?,
        BranchInstruction::IfNull(EqComparison::EQ, label) => short_jump(0xC6, label, bytes)?,
        BranchInstruction::IfNull(EqComparison::NE, label) => short_jump(0xC7, label, bytes)?,
        BranchInstruction::Goto(label) if wide => {
            0xC8u8.serialize(bytes)?;
            (relative(label)? as i32).serialize(bytes)?;
        }
        BranchInstruction::Goto(label) => short_jump(0xA7, label, bytes)?,
        BranchInstruction::TableSwitch {
            default,
            low,
            targets,
        } => {
            0xAAu8.serialize(bytes)?;
            bytes.resize(bytes.len() + super::decode::padding(offset), 0);
            (relative(default)? as i32).serialize(bytes)?;
            low.serialize(bytes)?;
            (low + targets.len() as i32 - 1).serialize(bytes)?;
            for target in targets {
                (relative(target)? as i32).serialize(bytes)?;
            }
        }
        BranchInstruction::LookupSwitch { default, targets } => {
            0xABu8.serialize(bytes)?;
            bytes.resize(bytes.len() + super::decode::padding(offset), 0);
            (relative(default)? as i32).serialize(bytes)?;
            (targets.len() as i32).serialize(bytes)?;
            for (key, target) in targets {
                key.serialize(bytes)?;
                (relative(target)? as i32).serialize(bytes)?;
            }
        }
        BranchInstruction::IReturn => 0xACu8.serialize(bytes)?,
        BranchInstruction::LReturn => 0xADu8.serialize(bytes)?,
        BranchInstruction::FReturn => 0xAEu8.serialize(bytes)?,
        BranchInstruction::DReturn => 0xAFu8.serialize(bytes)?,
        BranchInstruction::AReturn => 0xB0u8.serialize(bytes)?,
        BranchInstruction::Return => 0xB1u8.serialize(bytes)?,
        BranchInstruction::AThrow => 0xBFu8.serialize(bytes)?,
    }
    Ok(())
}

/// Opcode offset from `ifeq`/`if_icmpeq`
fn ord_comparison_offset(comparison: OrdComparison) -> u8 {
    match comparison {
        OrdComparison::EQ => 0,
        OrdComparison::NE => 1,
        OrdComparison::LT => 2,
        OrdComparison::GE => 3,
        OrdComparison::GT => 4,
        OrdComparison::LE => 5,
    }
}
