use super::*;
use crate::jvm::class_file::ConstantPool;
use crate::jvm::verifier::{EditFrame, FrameType};
use crate::jvm::{BaseType, BinaryName, Error, FieldType, MethodDescriptor, Name, ParseDescriptor};
use crate::util::Width;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Incrementally builds a run of instructions, checking them as they are added
///
/// The builder tracks the verifier's view of the locals and stack after every instruction, which
/// is what makes it possible to attach correct stack map frames to every label that needs one
/// without a separate dataflow pass over the finished code.
///
/// ### Frames at labels
///
/// A label that is jumped to before being placed gets the merge of all the frames that jump to
/// it: locals that disagree are weakened to `Top` while the stacks must match up (up to `null`
/// flowing into a reference type). Once a label is placed, its frame is fixed and further jumps
/// to it (eg. loop back edges) must be assignable to that frame.
///
/// ### Reachability
///
/// Following the JVM verifier, code after an unconditional jump is only valid if there is a label
/// there that is jumped to from somewhere (or has an explicit frame). Instructions pushed where
/// execution cannot reach are rejected with [`Error::UnreachableCode`].
pub struct CodeBuilder<'a> {
    pool: &'a mut ConstantPool,
    labels: &'a mut LabelAllocator,

    this_class: String,
    return_type: Option<FieldType<BinaryName>>,

    nodes: Vec<Node>,

    /// Frame after the last node (`None` if execution can't get there)
    frame: Option<EditFrame>,

    /// Frames of labels that have been placed or jumped to
    label_frames: HashMap<Label, EditFrame>,
    placed: HashSet<Label>,

    /// Labels whose frames must end up in the stack map table
    needs_frame: HashSet<Label>,

    /// Label placed right before the next instruction, if any
    pending_label: Option<Label>,

    /// Meet of the locals seen in each try region that is still open (innermost last)
    open_try_locals: Vec<EditFrame>,

    handlers: Vec<ExceptionHandler>,

    max_stack: u16,
    max_locals: u16,
}

/// Output of a [`CodeBuilder`], ready to be spliced into a [`MethodBody`]
#[derive(Clone, Debug)]
pub struct Fragment {
    pub nodes: Vec<Node>,

    /// Frames for labels that are jump targets, handler entries, or follow unconditional jumps
    /// (including labels referenced here but placed elsewhere)
    pub frames: BTreeMap<Label, EditFrame>,

    pub handlers: Vec<ExceptionHandler>,

    /// Frame at the end of the fragment, if execution can fall off the end
    pub exit_frame: Option<EditFrame>,

    pub max_stack: u16,
    pub max_locals: u16,
}

impl<'a> CodeBuilder<'a> {
    /// Start building code from a given frame
    pub fn new(
        pool: &'a mut ConstantPool,
        labels: &'a mut LabelAllocator,
        shape: &MethodShape,
        entry_frame: EditFrame,
    ) -> CodeBuilder<'a> {
        let max_stack = entry_frame.stack_slots() as u16;
        let max_locals = entry_frame.locals.len() as u16;
        CodeBuilder {
            pool,
            labels,
            this_class: shape.this_class.clone(),
            return_type: shape.descriptor.return_type.clone(),
            nodes: vec![],
            frame: Some(entry_frame),
            label_frames: HashMap::new(),
            placed: HashSet::new(),
            needs_frame: HashSet::new(),
            pending_label: None,
            open_try_locals: vec![],
            handlers: vec![],
            max_stack,
            max_locals,
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    pub fn constants(&mut self) -> &mut ConstantPool {
        &mut *self.pool
    }

    /// Frame at the current position (`None` if the position is unreachable)
    pub fn current_frame(&self) -> Option<&EditFrame> {
        self.frame.as_ref()
    }

    /// Whether some branch or handler already targets a label
    pub fn is_jumped_to(&self, label: Label) -> bool {
        self.label_frames.contains_key(&label)
    }

    /// Push a straight-line instruction
    pub fn push(&mut self, insn: Instruction) -> Result<(), Error> {
        // `new` needs a label for its uninitialized type
        let new_label = match (&insn, self.pending_label) {
            (Instruction::New(_), None) => {
                let label = self.fresh_label();
                self.place_label(label)?;
                Some(label)
            }
            (_, pending) => pending,
        };

        let frame = self.frame.as_mut().ok_or(Error::UnreachableCode)?;
        frame
            .verify_instruction(&insn, &*self.pool, &self.this_class, new_label)
            .map_err(|kind| Error::VerifierError {
                instruction: format!("{:?}", insn),
                kind,
            })?;
        self.nodes.push(Node::Insn(insn));
        self.pending_label = None;
        self.observe_frame();
        Ok(())
    }

    /// Push a branch instruction
    ///
    /// Every jump target gets the frame after the branch pops its operands.
    pub fn push_branch(&mut self, branch: BranchInstruction<Label>) -> Result<(), Error> {
        let mut frame = self.frame.take().ok_or(Error::UnreachableCode)?;
        frame
            .verify_branch_instruction(&branch, &self.return_type)
            .map_err(|kind| Error::VerifierError {
                instruction: format!("{:?}", branch),
                kind,
            })?;
        for target in branch.jump_targets() {
            self.jump_to(target, &frame)?;
        }
        if branch.falls_through() {
            self.frame = Some(frame);
        }
        self.nodes.push(Node::Branch(branch));
        self.pending_label = None;
        self.observe_frame();
        Ok(())
    }

    /// Record an edge to a label
    fn jump_to(&mut self, target: Label, frame: &EditFrame) -> Result<(), Error> {
        self.needs_frame.insert(target);
        if self.placed.contains(&target) {
            let expected = &self.label_frames[&target];
            if !frame.is_assignable_to(expected) {
                return Err(Error::IncompatibleFrames(
                    target,
                    frame.clone(),
                    expected.clone(),
                ));
            }
            return Ok(());
        }

        let merged = match self.label_frames.get(&target) {
            None => frame.clone(),
            Some(existing) => existing.merge(frame).ok_or_else(|| {
                Error::IncompatibleFrames(target, frame.clone(), existing.clone())
            })?,
        };
        self.label_frames.insert(target, merged);
        Ok(())
    }

    /// Place a label at the current position
    ///
    /// This fails if the label was already placed, or if the position is unreachable and nothing
    /// jumps to the label.
    pub fn place_label(&mut self, label: Label) -> Result<(), Error> {
        if !self.placed.insert(label) {
            return Err(Error::DuplicateLabel(label));
        }

        let frame = match (self.frame.take(), self.label_frames.get(&label)) {
            (Some(current), None) => current,
            (Some(current), Some(jumped)) => jumped.merge(&current).ok_or_else(|| {
                Error::IncompatibleFrames(label, current.clone(), jumped.clone())
            })?,
            (None, Some(jumped)) => {
                self.needs_frame.insert(label);
                jumped.clone()
            }
            (None, None) => return Err(Error::PlacingUnreachableLabel(label)),
        };
        self.label_frames.insert(label, frame.clone());
        self.frame = Some(frame);
        self.nodes.push(Node::Label(label));
        self.pending_label = Some(label);
        self.observe_frame();
        Ok(())
    }

    /// Place a label with an explicit frame (eg. for an exception handler entry)
    ///
    /// Both the fall-through state (if any) and all earlier jumps must be assignable to the frame.
    pub fn place_label_with_frame(&mut self, label: Label, frame: EditFrame) -> Result<(), Error> {
        if let Some(current) = &self.frame {
            if !current.is_assignable_to(&frame) {
                return Err(Error::IncompatibleFrames(label, current.clone(), frame));
            }
        }
        if let Some(jumped) = self.label_frames.get(&label) {
            if !jumped.is_assignable_to(&frame) {
                return Err(Error::IncompatibleFrames(label, jumped.clone(), frame));
            }
        }
        self.needs_frame.insert(label);
        self.label_frames.insert(label, frame.clone());
        self.frame = Some(frame);
        self.place_label_known_frame(label)
    }

    fn place_label_known_frame(&mut self, label: Label) -> Result<(), Error> {
        if !self.placed.insert(label) {
            return Err(Error::DuplicateLabel(label));
        }
        self.nodes.push(Node::Label(label));
        self.pending_label = Some(label);
        self.observe_frame();
        Ok(())
    }

    /// Start a protected region at the current position
    pub fn begin_try(&mut self) -> Result<Label, Error> {
        let frame = self.frame.clone().ok_or(Error::UnreachableCode)?;
        let start = self.fresh_label();
        self.place_label(start)?;
        self.open_try_locals.push(EditFrame {
            locals: frame.locals,
            stack: vec![],
        });
        Ok(start)
    }

    /// Close the innermost protected region, registering a handler for it
    ///
    /// Returns the label of the handler (not yet placed) and the frame at the handler entry. The
    /// handler frame has the meet of all locals seen inside the region and the exception as the
    /// only value on the stack.
    pub fn end_try(
        &mut self,
        start: Label,
        catch_type: Option<&str>,
    ) -> Result<(Label, EditFrame), Error> {
        let end = self.fresh_label();
        if self.frame.is_some() {
            self.place_label(end)?;
        } else {
            self.place_label_known_frame(end)?;
        }
        let mut handler_frame = self.open_try_locals.pop().ok_or(Error::UnreachableCode)?;
        let exception = match catch_type {
            Some(class) => FrameType::object(class),
            None => FrameType::object(BinaryName::THROWABLE.as_str()),
        };
        handler_frame.stack = vec![exception];

        let handler = self.fresh_label();
        self.add_handler(ExceptionHandler {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_owned),
        });
        self.label_frames.insert(handler, handler_frame.clone());
        Ok((handler, handler_frame))
    }

    /// Register an exception handler (its label still needs to be placed)
    pub fn add_handler(&mut self, handler: ExceptionHandler) {
        self.needs_frame.insert(handler.handler);
        self.handlers.push(handler);
    }

    /// Update the running maximums and the open try regions with the current frame
    fn observe_frame(&mut self) {
        if let Some(frame) = &self.frame {
            self.max_stack = self.max_stack.max(frame.stack_slots() as u16);
            self.max_locals = self.max_locals.max(frame.locals.len() as u16);
            for try_locals in &mut self.open_try_locals {
                let seen = EditFrame {
                    locals: frame.locals.clone(),
                    stack: vec![],
                };
                if let Some(merged) = try_locals.merge(&seen) {
                    *try_locals = merged;
                }
            }
        }
    }

    /// Finish building
    pub fn finish(self) -> Fragment {
        let frames = self
            .needs_frame
            .iter()
            .filter_map(|label| Some((*label, self.label_frames.get(label)?.clone())))
            .collect();
        Fragment {
            nodes: self.nodes,
            frames,
            handlers: self.handlers,
            exit_frame: self.frame,
            max_stack: self.max_stack,
            max_locals: self.max_locals,
        }
    }
}

/// Conveniences for common instruction sequences
impl<'a> CodeBuilder<'a> {
    /// Push an integer constant, using the shortest encoding
    pub fn const_int(&mut self, integer: i32) -> Result<(), Error> {
        let insn = match integer {
            -1 => Instruction::IConstM1,
            0 => Instruction::IConst0,
            1 => Instruction::IConst1,
            2 => Instruction::IConst2,
            3 => Instruction::IConst3,
            4 => Instruction::IConst4,
            5 => Instruction::IConst5,
            -128..=127 => Instruction::BiPush(integer as i8),
            -32768..=32767 => Instruction::SiPush(integer as i16),
            _ => Instruction::Ldc(self.pool.get_integer(integer)?),
        };
        self.push(insn)
    }

    /// Push a long constant
    pub fn const_long(&mut self, long: i64) -> Result<(), Error> {
        match long {
            0 => self.push(Instruction::LConst0),
            1 => self.push(Instruction::LConst1),
            _ => {
                let index = self.pool.get_long(long)?;
                self.push(Instruction::Ldc2(index))
            }
        }
    }

    /// Push a constant string
    pub fn const_string(&mut self, string: &str) -> Result<(), Error> {
        let index = self.pool.get_string(string)?;
        self.push(Instruction::Ldc(index.into()))
    }

    /// Read a field
    pub fn get_field(
        &mut self,
        is_static: bool,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error> {
        let field = self.pool.get_field_ref(class, name, descriptor)?;
        self.push(if is_static {
            Instruction::GetStatic(field)
        } else {
            Instruction::GetField(field)
        })
    }

    /// Write a field
    pub fn put_field(
        &mut self,
        is_static: bool,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error> {
        let field = self.pool.get_field_ref(class, name, descriptor)?;
        self.push(if is_static {
            Instruction::PutStatic(field)
        } else {
            Instruction::PutField(field)
        })
    }

    /// Call a method
    ///
    /// The `count` operand of `invokeinterface` is computed from the descriptor.
    pub fn invoke(
        &mut self,
        invoke_type: InvokeType,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error> {
        let is_interface = matches!(invoke_type, InvokeType::Interface(_));
        let method = self
            .pool
            .get_method_ref(class, name, descriptor, is_interface)?;
        let invoke_type = match invoke_type {
            InvokeType::Interface(_) => {
                let parsed: MethodDescriptor<BinaryName> = MethodDescriptor::parse(descriptor)
                    .map_err(|_| Error::BadDescriptor(descriptor.to_owned()))?;
                InvokeType::Interface(parsed.parameter_slots(true) as u8)
            }
            other => other,
        };
        self.push(Instruction::Invoke(invoke_type, method))
    }

    pub fn check_cast(&mut self, class: &str) -> Result<(), Error> {
        let class = self.pool.get_class(class)?;
        self.push(Instruction::CheckCast(class))
    }

    /// Allocate an array of references (length is on the stack)
    pub fn new_ref_array(&mut self, element_class: &str) -> Result<(), Error> {
        let class = self.pool.get_class(element_class)?;
        self.push(Instruction::ANewArray(class))
    }

    /// Allocate an array of primitives (length is on the stack)
    pub fn new_base_array(&mut self, element: BaseType) -> Result<(), Error> {
        self.push(Instruction::NewArray(element))
    }

    /// Load a local of a given type
    pub fn load(&mut self, slot: u16, field_type: &FieldType<BinaryName>) -> Result<(), Error> {
        self.push(match field_type {
            FieldType::Ref(_) => Instruction::ALoad(slot),
            FieldType::Base(BaseType::Long) => Instruction::LLoad(slot),
            FieldType::Base(BaseType::Float) => Instruction::FLoad(slot),
            FieldType::Base(BaseType::Double) => Instruction::DLoad(slot),
            FieldType::Base(_) => Instruction::ILoad(slot),
        })
    }

    /// Store a local of a given type
    pub fn store(&mut self, slot: u16, field_type: &FieldType<BinaryName>) -> Result<(), Error> {
        self.push(match field_type {
            FieldType::Ref(_) => Instruction::AStore(slot),
            FieldType::Base(BaseType::Long) => Instruction::LStore(slot),
            FieldType::Base(BaseType::Float) => Instruction::FStore(slot),
            FieldType::Base(BaseType::Double) => Instruction::DStore(slot),
            FieldType::Base(_) => Instruction::IStore(slot),
        })
    }

    /// Pop the top of the stack, whatever its width
    pub fn pop(&mut self) -> Result<(), Error> {
        let top_width = self
            .frame
            .as_ref()
            .and_then(|frame| frame.stack.last())
            .map(|typ| typ.width());
        match top_width {
            Some(2) => self.push(Instruction::Pop2),
            _ => self.push(Instruction::Pop),
        }
    }

    /// Return from the method with the value on top of the stack (if any)
    pub fn return_(&mut self) -> Result<(), Error> {
        let branch = BranchInstruction::return_for(&self.return_type);
        self.push_branch(branch)
    }

    /// Push the default value of a type (`null`, `0`, `false`, ...)
    pub fn zero_value(&mut self, field_type: &FieldType<BinaryName>) -> Result<(), Error> {
        self.push(match field_type {
            FieldType::Ref(_) => Instruction::AConstNull,
            FieldType::Base(BaseType::Long) => Instruction::LConst0,
            FieldType::Base(BaseType::Float) => Instruction::FConst0,
            FieldType::Base(BaseType::Double) => Instruction::DConst0,
            FieldType::Base(_) => Instruction::IConst0,
        })
    }
}
