use super::*;
use crate::jvm::class_file::{
    ClassConstantIndex, ClassFileVerificationType, ConstantPool, StackMapFrame,
};
use crate::jvm::code::{BranchInstruction, Instruction, InvokeType, Label};
use crate::jvm::{
    BinaryName, FieldType, MethodDescriptor, ParseDescriptor, RefType, UnqualifiedName,
    VerifierErrorKind,
};
use crate::jvm::Name;
use crate::util::Width;

/// Snapshot of the stack and local variables at a point in the bytecode
///
/// Locals are stored one entry per slot: a `long` or `double` in slot `n` is followed by `Top` in
/// slot `n + 1`. The class file uses a compact form where the second slot is implicit (see
/// [`Frame::compact_locals`] and [`Frame::from_compact`]).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame<Cls, U> {
    /// Local variables in scope
    pub locals: Vec<VerificationType<Cls, U>>,

    /// Types of values on the stack
    pub stack: Vec<VerificationType<Cls, U>>,
}

/// Frame type used while editing method bodies
pub type EditFrame = Frame<String, Label>;

/// Frame type as it appears in the class file
pub type ClassFileFrame = Frame<ClassConstantIndex, u16>;

impl<Cls: Clone + PartialEq, U: Clone + PartialEq> Frame<Cls, U> {
    pub fn empty() -> Frame<Cls, U> {
        Frame {
            locals: vec![],
            stack: vec![],
        }
    }

    /// Locals in the class file layout (wide types take one entry, trailing `Top`s dropped)
    pub fn compact_locals(&self) -> Vec<VerificationType<Cls, U>> {
        let mut compact = vec![];
        let mut slot = 0;
        while slot < self.locals.len() {
            let local = &self.locals[slot];
            compact.push(local.clone());
            slot += local.width();
        }
        while compact.last() == Some(&VerificationType::Top) {
            compact.pop();
        }
        compact
    }

    /// Inverse of [`Frame::compact_locals`]
    pub fn from_compact(
        locals: &[VerificationType<Cls, U>],
        stack: Vec<VerificationType<Cls, U>>,
    ) -> Frame<Cls, U> {
        let mut expanded = vec![];
        for local in locals {
            expanded.push(local.clone());
            if local.width() == 2 {
                expanded.push(VerificationType::Top);
            }
        }
        Frame {
            locals: expanded,
            stack,
        }
    }

    /// Compare frames, ignoring unused trailing local slots
    pub fn same_as(&self, other: &Self) -> bool {
        self.stack == other.stack && self.compact_locals() == other.compact_locals()
    }

    /// Height of the stack, in slots
    pub fn stack_slots(&self) -> usize {
        self.stack.iter().map(|typ| typ.width()).sum()
    }

    pub fn try_map<C2, U2, E>(
        &self,
        map_class: impl Fn(&Cls) -> Result<C2, E>,
        map_uninitialized: impl Fn(&U) -> Result<U2, E>,
    ) -> Result<Frame<C2, U2>, E> {
        let map = |typ: &VerificationType<Cls, U>| typ.try_map(&map_class, &map_uninitialized);
        Ok(Frame {
            locals: self.locals.iter().map(map).collect::<Result<_, E>>()?,
            stack: self.stack.iter().map(map).collect::<Result<_, E>>()?,
        })
    }

    /// Apply a stack map frame to the previous frame
    ///
    /// Verification types in the stack map frame get translated with `convert` first, so that the
    /// result can be in any frame representation.
    pub fn apply_stack_map_frame(
        &self,
        frame: &StackMapFrame,
        convert: impl Fn(&ClassFileVerificationType) -> Result<VerificationType<Cls, U>, String>,
    ) -> Result<Self, String> {
        let mut locals = self.compact_locals();
        let stack = match frame {
            StackMapFrame::SameLocalsNoStack { .. } => vec![],
            StackMapFrame::SameLocalsOneStack { stack, .. } => vec![convert(stack)?],
            StackMapFrame::ChopLocalsNoStack { chopped_k, .. } => {
                let chopped_k = *chopped_k as usize;
                if chopped_k > locals.len() {
                    return Err(format!(
                        "Cannot chop {} locals from a frame with {}",
                        chopped_k,
                        locals.len()
                    ));
                }
                locals.truncate(locals.len() - chopped_k);
                vec![]
            }
            StackMapFrame::AppendLocalsNoStack {
                locals: appended, ..
            } => {
                for local in appended {
                    locals.push(convert(local)?);
                }
                vec![]
            }
            StackMapFrame::Full {
                locals: full_locals,
                stack,
                ..
            } => {
                locals = full_locals.iter().map(&convert).collect::<Result<_, _>>()?;
                stack.iter().map(&convert).collect::<Result<_, _>>()?
            }
        };
        Ok(Frame::from_compact(&locals, stack))
    }
}

impl ClassFileFrame {
    /// Compute the most compact stack map frame to get from the previous frame to this one
    ///
    /// This will fall back to the `Full` option only if none of the other stack map frame
    /// variants are enough to encode the transition.
    pub fn stack_map_frame(&self, offset_delta: u16, previous_frame: &Self) -> StackMapFrame {
        let this_locals = self.compact_locals();
        let prev_locals = previous_frame.compact_locals();

        match self.stack.len() {
            0 => {
                if this_locals.len() <= prev_locals.len() {
                    let len_difference = prev_locals.len() - this_locals.len();
                    if len_difference < 4 && prev_locals.starts_with(&this_locals) {
                        if len_difference == 0 {
                            return StackMapFrame::SameLocalsNoStack { offset_delta };
                        } else {
                            return StackMapFrame::ChopLocalsNoStack {
                                offset_delta,
                                chopped_k: len_difference as u8,
                            };
                        }
                    }
                } else if this_locals.len() - prev_locals.len() < 4
                    && this_locals.starts_with(&prev_locals)
                {
                    return StackMapFrame::AppendLocalsNoStack {
                        offset_delta,
                        locals: this_locals[prev_locals.len()..].to_vec(),
                    };
                }
            }
            1 if this_locals == prev_locals => {
                return StackMapFrame::SameLocalsOneStack {
                    offset_delta,
                    stack: self.stack[0].clone(),
                }
            }
            _ => (),
        }

        StackMapFrame::Full {
            offset_delta,
            locals: this_locals,
            stack: self.stack.clone(),
        }
    }
}

impl EditFrame {
    /// Frame on entry to a method: just the parameters (including maybe "this")
    pub fn method_entry(
        this_class: &str,
        is_static: bool,
        is_constructor: bool,
        descriptor: &MethodDescriptor<BinaryName>,
    ) -> EditFrame {
        let mut locals = vec![];
        if is_constructor {
            locals.push(VerificationType::UninitializedThis);
        } else if !is_static {
            locals.push(FrameType::object(this_class));
        }
        for parameter in &descriptor.parameters {
            locals.push(FrameType::from(parameter));
        }
        Frame::from_compact(&locals, vec![])
    }

    pub fn get_local(&self, index: u16) -> Result<&FrameType, VerifierErrorKind> {
        self.locals
            .get(index as usize)
            .ok_or(VerifierErrorKind::InvalidIndex)
    }

    /// Update the type in a local slot, invalidating any wide value that gets partially
    /// overwritten
    pub fn set_local(&mut self, index: u16, typ: FrameType) {
        let index = index as usize;
        let width = typ.width();
        if self.locals.len() < index + width {
            self.locals.resize(index + width, VerificationType::Top);
        }
        if index > 0 && self.locals[index - 1].width() == 2 {
            self.locals[index - 1] = VerificationType::Top;
        }
        if width == 2 && self.locals[index + 1].width() == 2 {
            if let Some(dangling) = self.locals.get_mut(index + 2) {
                *dangling = VerificationType::Top;
            }
        }
        if self.locals[index].width() == 2 && width == 1 {
            if let Some(dangling) = self.locals.get_mut(index + 1) {
                *dangling = VerificationType::Top;
            }
        }
        self.locals[index] = typ;
        if width == 2 {
            self.locals[index + 1] = VerificationType::Top;
        }
    }

    /// Merge two frames reaching the same point
    ///
    /// Stacks must agree (up to `null` flowing into a reference type). Locals that disagree are
    /// weakened to `Top`.
    pub fn merge(&self, other: &EditFrame) -> Option<EditFrame> {
        if self.stack.len() != other.stack.len() {
            return None;
        }
        let mut stack = vec![];
        for (t1, t2) in self.stack.iter().zip(&other.stack) {
            let merged = FrameType::meet(t1, t2);
            if merged == VerificationType::Top {
                return None;
            }
            stack.push(merged);
        }

        let len = self.locals.len().max(other.locals.len());
        let top = VerificationType::Top;
        let locals = (0..len)
            .map(|slot| {
                let t1 = self.locals.get(slot).unwrap_or(&top);
                let t2 = other.locals.get(slot).unwrap_or(&top);
                FrameType::meet(t1, t2)
            })
            .collect();
        let mut merged = Frame { locals, stack };
        merged.fix_wide_locals();
        Some(merged)
    }

    /// Can a state described by `self` flow into a point whose frame is `target`?
    pub fn is_assignable_to(&self, target: &EditFrame) -> bool {
        if self.stack.len() != target.stack.len() {
            return false;
        }
        let stack_ok = self
            .stack
            .iter()
            .zip(&target.stack)
            .all(|(t1, t2)| FrameType::is_assignable(t1, t2));
        let top = VerificationType::Top;
        let locals_ok = target.locals.iter().enumerate().all(|(slot, t2)| {
            let t1 = self.locals.get(slot).unwrap_or(&top);
            FrameType::is_assignable(t1, t2)
        });
        stack_ok && locals_ok
    }

    /// A wide local is only usable if its second slot is `Top`
    fn fix_wide_locals(&mut self) {
        for slot in 0..self.locals.len() {
            if self.locals[slot].width() == 2
                && self.locals.get(slot + 1) != Some(&VerificationType::Top)
            {
                self.locals[slot] = VerificationType::Top;
            }
        }
    }

    /// Update the frame to reflect the effect of a straight-line instruction
    ///
    /// `new_label` is the label placed right before the instruction and only matters for `new`
    /// (the uninitialized object is identified by the position of its `new`).
    pub fn verify_instruction(
        &mut self,
        insn: &Instruction,
        pool: &ConstantPool,
        this_class: &str,
        new_label: Option<Label>,
    ) -> Result<(), VerifierErrorKind> {
        verify_instruction(self, insn, pool, this_class, new_label)
    }

    /// Update the frame to reflect the effect of a branch instruction
    ///
    /// For instructions that don't fall through, the resulting frame is the one at the targets
    /// (and is meaningless after the instruction).
    pub fn verify_branch_instruction<Lbl>(
        &mut self,
        insn: &BranchInstruction<Lbl>,
        return_type: &Option<FieldType<BinaryName>>,
    ) -> Result<(), VerifierErrorKind> {
        verify_branch_instruction(self, insn, return_type)
    }
}

fn verify_instruction(
    frame: &mut EditFrame,
    insn: &Instruction,
    pool: &ConstantPool,
    this_class: &str,
    new_label: Option<Label>,
) -> Result<(), VerifierErrorKind> {
    use Instruction::*;
    use VerificationType::*;

    match insn {
        Nop => (),
        AConstNull => frame.stack.push(Null),
        IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5 | BiPush(_)
        | SiPush(_) => frame.stack.push(Integer),
        LConst0 | LConst1 => frame.stack.push(Long),
        FConst0 | FConst1 | FConst2 => frame.stack.push(Float),
        DConst0 | DConst1 => frame.stack.push(Double),
        Ldc(index) | Ldc2(index) => {
            let typ = pool
                .loadable_type(*index)
                .map_err(|_| VerifierErrorKind::NotLoadableConstant(*index))?;
            let expected_width = if matches!(insn, Ldc(_)) { 1 } else { 2 };
            if typ.width() != expected_width {
                return Err(VerifierErrorKind::InvalidWidth(typ.width()));
            }
            frame.stack.push(FrameType::from(&typ));
        }

        ILoad(index) => load(frame, *index, Integer)?,
        LLoad(index) => load(frame, *index, Long)?,
        FLoad(index) => load(frame, *index, Float)?,
        DLoad(index) => load(frame, *index, Double)?,
        ALoad(index) => {
            let typ = frame.get_local(*index)?.clone();
            if !typ.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
            frame.stack.push(typ);
        }

        IALoad => array_load(frame, &["[I"], Integer)?,
        LALoad => array_load(frame, &["[J"], Long)?,
        FALoad => array_load(frame, &["[F"], Float)?,
        DALoad => array_load(frame, &["[D"], Double)?,
        BALoad => array_load(frame, &["[B", "[Z"], Integer)?,
        CALoad => array_load(frame, &["[C"], Integer)?,
        SALoad => array_load(frame, &["[S"], Integer)?,
        AALoad => {
            pop_expecting_type(frame, &Integer)?;
            let element = match pop(frame)? {
                Null => Null,
                array => match array.array_element() {
                    Some(element) if element.is_reference() => element,
                    _ => return Err(VerifierErrorKind::NotArrayType),
                },
            };
            frame.stack.push(element);
        }

        IStore(index) => store(frame, *index, Integer)?,
        LStore(index) => store(frame, *index, Long)?,
        FStore(index) => store(frame, *index, Float)?,
        DStore(index) => store(frame, *index, Double)?,
        AStore(index) => {
            let typ = pop(frame)?;
            if !typ.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
            frame.set_local(*index, typ);
        }

        IAStore => array_store(frame, &["[I"], Integer)?,
        LAStore => array_store(frame, &["[J"], Long)?,
        FAStore => array_store(frame, &["[F"], Float)?,
        DAStore => array_store(frame, &["[D"], Double)?,
        BAStore => array_store(frame, &["[B", "[Z"], Integer)?,
        CAStore => array_store(frame, &["[C"], Integer)?,
        SAStore => array_store(frame, &["[S"], Integer)?,
        AAStore => {
            let element = pop(frame)?;
            pop_expecting_type(frame, &Integer)?;
            let array = pop(frame)?;
            if !element.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
            if array != Null {
                match array.array_element() {
                    Some(expected) if expected.is_reference() => {
                        if !FrameType::is_assignable(&element, &expected) {
                            return Err(VerifierErrorKind::IncompatibleTypes(element, expected));
                        }
                    }
                    _ => return Err(VerifierErrorKind::NotArrayType),
                }
            }
        }

        Pop => {
            pop_expecting_width(frame, 1)?;
        }
        Pop2 => match pop(frame)?.width() {
            1 => {
                pop_expecting_width(frame, 1)?;
            }
            _ => (),
        },
        Dup => {
            let arg1 = pop_expecting_width(frame, 1)?;
            push_all(frame, [&arg1, &arg1]);
        }
        DupX1 => {
            let arg1 = pop_expecting_width(frame, 1)?;
            let arg2 = pop_expecting_width(frame, 1)?;
            push_all(frame, [&arg1, &arg2, &arg1]);
        }
        DupX2 => {
            let arg1 = pop_expecting_width(frame, 1)?;
            let arg2 = pop(frame)?;
            if arg2.width() == 1 {
                let arg3 = pop_expecting_width(frame, 1)?;
                push_all(frame, [&arg1, &arg3, &arg2, &arg1]);
            } else {
                push_all(frame, [&arg1, &arg2, &arg1]);
            }
        }
        Dup2 => {
            let arg1 = pop(frame)?;
            if arg1.width() == 1 {
                let arg2 = pop_expecting_width(frame, 1)?;
                push_all(frame, [&arg2, &arg1, &arg2, &arg1]);
            } else {
                push_all(frame, [&arg1, &arg1]);
            }
        }
        Dup2X1 => {
            let arg1 = pop(frame)?;
            if arg1.width() == 1 {
                let arg2 = pop_expecting_width(frame, 1)?;
                let arg3 = pop_expecting_width(frame, 1)?;
                push_all(frame, [&arg2, &arg1, &arg3, &arg2, &arg1]);
            } else {
                let arg2 = pop_expecting_width(frame, 1)?;
                push_all(frame, [&arg1, &arg2, &arg1]);
            }
        }
        Dup2X2 => {
            let arg1 = pop(frame)?;
            if arg1.width() == 1 {
                let arg2 = pop_expecting_width(frame, 1)?;
                let arg3 = pop(frame)?;
                if arg3.width() == 1 {
                    let arg4 = pop_expecting_width(frame, 1)?;
                    push_all(frame, [&arg2, &arg1, &arg4, &arg3, &arg2, &arg1]);
                } else {
                    push_all(frame, [&arg2, &arg1, &arg3, &arg2, &arg1]);
                }
            } else {
                let arg2 = pop(frame)?;
                if arg2.width() == 1 {
                    let arg3 = pop_expecting_width(frame, 1)?;
                    push_all(frame, [&arg1, &arg3, &arg2, &arg1]);
                } else {
                    push_all(frame, [&arg1, &arg2, &arg1]);
                }
            }
        }
        Swap => {
            let arg1 = pop_expecting_width(frame, 1)?;
            let arg2 = pop_expecting_width(frame, 1)?;
            push_all(frame, [&arg1, &arg2]);
        }

        IAdd | ISub | IDiv | IMul | IRem | IAnd | IOr | IXor | ISh(_) => {
            unary_or_binary(frame, &[Integer, Integer], Integer)?
        }
        LAdd | LSub | LDiv | LMul | LRem | LAnd | LOr | LXor => {
            unary_or_binary(frame, &[Long, Long], Long)?
        }
        FAdd | FSub | FDiv | FMul | FRem => unary_or_binary(frame, &[Float, Float], Float)?,
        DAdd | DSub | DDiv | DMul | DRem => unary_or_binary(frame, &[Double, Double], Double)?,
        INeg | I2B | I2C | I2S => unary_or_binary(frame, &[Integer], Integer)?,
        LNeg => unary_or_binary(frame, &[Long], Long)?,
        FNeg => unary_or_binary(frame, &[Float], Float)?,
        DNeg => unary_or_binary(frame, &[Double], Double)?,
        LSh(_) => unary_or_binary(frame, &[Long, Integer], Long)?,
        IInc(index, _) => {
            if frame.get_local(*index)? != &Integer {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        I2L => unary_or_binary(frame, &[Integer], Long)?,
        I2F => unary_or_binary(frame, &[Integer], Float)?,
        I2D => unary_or_binary(frame, &[Integer], Double)?,
        L2I => unary_or_binary(frame, &[Long], Integer)?,
        L2F => unary_or_binary(frame, &[Long], Float)?,
        L2D => unary_or_binary(frame, &[Long], Double)?,
        F2I => unary_or_binary(frame, &[Float], Integer)?,
        F2L => unary_or_binary(frame, &[Float], Long)?,
        F2D => unary_or_binary(frame, &[Float], Double)?,
        D2I => unary_or_binary(frame, &[Double], Integer)?,
        D2L => unary_or_binary(frame, &[Double], Long)?,
        D2F => unary_or_binary(frame, &[Double], Float)?,
        LCmp => unary_or_binary(frame, &[Long, Long], Integer)?,
        FCmp(_) => unary_or_binary(frame, &[Float, Float], Integer)?,
        DCmp(_) => unary_or_binary(frame, &[Double, Double], Integer)?,

        GetStatic(field) | PutStatic(field) | GetField(field) | PutField(field) => {
            let field = pool
                .field_ref(*field)
                .map_err(|_| VerifierErrorKind::BadDescriptor(format!("{:?}", field)))?;
            let field_type: FieldType<BinaryName> = FieldType::parse(field.descriptor)
                .map_err(|_| VerifierErrorKind::BadDescriptor(field.descriptor.to_owned()))?;
            let field_type = FrameType::from(&field_type);
            let owner = FrameType::object(field.class);
            match insn {
                GetStatic(_) => frame.stack.push(field_type),
                PutStatic(_) => pop_assignable_to(frame, &field_type)?,
                GetField(_) => {
                    pop_receiver(frame, &owner)?;
                    frame.stack.push(field_type);
                }
                _ => {
                    pop_assignable_to(frame, &field_type)?;
                    pop_receiver(frame, &owner)?;
                }
            }
        }

        Invoke(invoke_type, method) => {
            let method = pool
                .method_ref(*method)
                .map_err(|_| VerifierErrorKind::BadDescriptor(format!("{:?}", method)))?;
            let descriptor: MethodDescriptor<BinaryName> = MethodDescriptor::parse(
                method.descriptor,
            )
            .map_err(|_| VerifierErrorKind::BadDescriptor(method.descriptor.to_owned()))?;
            if let InvokeType::Interface(count) = invoke_type {
                if *count as usize != descriptor.parameter_slots(true) {
                    return Err(VerifierErrorKind::InvalidIndex);
                }
            }

            // Check that all the arguments match
            for parameter in descriptor.parameters.iter().rev() {
                pop_assignable_to(frame, &FrameType::from(parameter))?;
            }

            let is_init = method.name == UnqualifiedName::INIT.as_str();
            match invoke_type {
                InvokeType::Special if is_init => {
                    let receiver = pop(frame)?;
                    let initialized = match &receiver {
                        UninitializedThis => FrameType::object(this_class),
                        Uninitialized(_) => FrameType::object(method.class),
                        _ => return Err(VerifierErrorKind::InvalidType),
                    };
                    replace_all(frame, &receiver, &initialized);
                    if descriptor.return_type.is_some() {
                        return Err(VerifierErrorKind::InvalidType);
                    }
                }
                InvokeType::Static => (),
                _ => pop_receiver(frame, &FrameType::object(method.class))?,
            }

            // Push the return type
            if let Some(return_type) = &descriptor.return_type {
                frame.stack.push(FrameType::from(return_type));
            }
        }
        InvokeDynamic(call_site) => {
            let (_, descriptor) = pool
                .invoke_dynamic(*call_site)
                .map_err(|_| VerifierErrorKind::BadDescriptor(format!("{:?}", call_site)))?;
            let descriptor: MethodDescriptor<BinaryName> = MethodDescriptor::parse(descriptor)
                .map_err(|_| VerifierErrorKind::BadDescriptor(descriptor.to_owned()))?;
            for parameter in descriptor.parameters.iter().rev() {
                pop_assignable_to(frame, &FrameType::from(parameter))?;
            }
            if let Some(return_type) = &descriptor.return_type {
                frame.stack.push(FrameType::from(return_type));
            }
        }

        New(_) => {
            let label = new_label.ok_or(VerifierErrorKind::InvalidType)?;
            frame.stack.push(Uninitialized(label));
        }
        NewArray(base_type) => {
            pop_expecting_type(frame, &Integer)?;
            let array_type = RefType::<BinaryName>::array(FieldType::Base(*base_type));
            frame.stack.push(FrameType::object(array_type.class_name()));
        }
        ANewArray(class) => {
            pop_expecting_type(frame, &Integer)?;
            let element = class_type(pool, *class)?;
            let array_type = RefType::array(FieldType::Ref(element));
            frame.stack.push(FrameType::object(array_type.class_name()));
        }
        MultiANewArray(class, dimensions) => {
            for _ in 0..*dimensions {
                pop_expecting_type(frame, &Integer)?;
            }
            frame.stack.push(FrameType::object(class_type(pool, *class)?.class_name()));
        }
        ArrayLength => {
            let array = pop(frame)?;
            if array != Null && array.array_element().is_none() {
                return Err(VerifierErrorKind::NotArrayType);
            }
            frame.stack.push(Integer);
        }
        CheckCast(class) => {
            pop_reference(frame)?;
            frame.stack.push(FrameType::object(class_type(pool, *class)?.class_name()));
        }
        InstanceOf(_) => {
            pop_reference(frame)?;
            frame.stack.push(Integer);
        }
        MonitorEnter | MonitorExit => pop_reference(frame)?,
    }
    Ok(())
}

fn verify_branch_instruction<Lbl>(
    frame: &mut EditFrame,
    insn: &BranchInstruction<Lbl>,
    return_type: &Option<FieldType<BinaryName>>,
) -> Result<(), VerifierErrorKind> {
    use BranchInstruction::*;
    use VerificationType::*;

    let expected_return = return_type.as_ref().map(FrameType::from);
    match insn {
        If(_, _) | TableSwitch { .. } | LookupSwitch { .. } => {
            pop_expecting_type(frame, &Integer)?
        }
        IfICmp(_, _) => {
            pop_expecting_type(frame, &Integer)?;
            pop_expecting_type(frame, &Integer)?;
        }
        IfACmp(_, _) => {
            pop_reference(frame)?;
            pop_reference(frame)?;
        }
        IfNull(_, _) => pop_reference(frame)?,
        Goto(_) => (),
        IReturn | LReturn | FReturn | DReturn => {
            let returned = match insn {
                IReturn => Integer,
                LReturn => Long,
                FReturn => Float,
                _ => Double,
            };
            pop_expecting_type(frame, &returned)?;
            if expected_return != Some(returned) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        AReturn => match &expected_return {
            Some(expected) if expected.is_reference() => pop_assignable_to(frame, expected)?,
            _ => return Err(VerifierErrorKind::InvalidType),
        },
        Return => {
            if expected_return.is_some() {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        AThrow => {
            let exception = pop(frame)?;
            let throwable = FrameType::object(BinaryName::THROWABLE.as_str());
            if !FrameType::is_assignable(&exception, &throwable) {
                return Err(VerifierErrorKind::IncompatibleTypes(exception, throwable));
            }
        }
    }
    Ok(())
}

fn class_type(
    pool: &ConstantPool,
    class: ClassConstantIndex,
) -> Result<RefType<BinaryName>, VerifierErrorKind> {
    let name = pool
        .class_name(class)
        .map_err(|_| VerifierErrorKind::BadDescriptor(format!("{:?}", class)))?;
    RefType::from_class_name(name).map_err(|_| VerifierErrorKind::BadDescriptor(name.to_owned()))
}

fn load(frame: &mut EditFrame, index: u16, typ: FrameType) -> Result<(), VerifierErrorKind> {
    if frame.get_local(index)? != &typ {
        return Err(VerifierErrorKind::IncompatibleTypes(
            frame.get_local(index)?.clone(),
            typ,
        ));
    }
    frame.stack.push(typ);
    Ok(())
}

fn store(frame: &mut EditFrame, index: u16, typ: FrameType) -> Result<(), VerifierErrorKind> {
    pop_expecting_type(frame, &typ)?;
    frame.set_local(index, typ);
    Ok(())
}

fn array_load(
    frame: &mut EditFrame,
    array_types: &[&str],
    element: FrameType,
) -> Result<(), VerifierErrorKind> {
    pop_expecting_type(frame, &VerificationType::Integer)?;
    pop_array(frame, array_types)?;
    frame.stack.push(element);
    Ok(())
}

fn array_store(
    frame: &mut EditFrame,
    array_types: &[&str],
    element: FrameType,
) -> Result<(), VerifierErrorKind> {
    pop_expecting_type(frame, &element)?;
    pop_expecting_type(frame, &VerificationType::Integer)?;
    pop_array(frame, array_types)
}

fn pop_array(frame: &mut EditFrame, array_types: &[&str]) -> Result<(), VerifierErrorKind> {
    match pop(frame)? {
        VerificationType::Null => Ok(()),
        VerificationType::Object(name) if array_types.contains(&name.as_str()) => Ok(()),
        _ => Err(VerifierErrorKind::NotArrayType),
    }
}

fn unary_or_binary(
    frame: &mut EditFrame,
    operands: &[FrameType],
    result: FrameType,
) -> Result<(), VerifierErrorKind> {
    for operand in operands.iter().rev() {
        pop_expecting_type(frame, operand)?;
    }
    frame.stack.push(result);
    Ok(())
}

fn push_all<const N: usize>(frame: &mut EditFrame, types: [&FrameType; N]) {
    frame.stack.extend(types.into_iter().cloned());
}

/// `<init>` turns every copy of the uninitialized value into the initialized type
fn replace_all(frame: &mut EditFrame, original: &FrameType, updated: &FrameType) {
    for typ in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
        if *typ == *original {
            *typ = updated.clone();
        }
    }
}

fn pop(frame: &mut EditFrame) -> Result<FrameType, VerifierErrorKind> {
    frame.stack.pop().ok_or(VerifierErrorKind::EmptyStack)
}

fn pop_reference(frame: &mut EditFrame) -> Result<(), VerifierErrorKind> {
    if pop(frame)?.is_reference() {
        Ok(())
    } else {
        Err(VerifierErrorKind::InvalidType)
    }
}

fn pop_receiver(frame: &mut EditFrame, owner: &FrameType) -> Result<(), VerifierErrorKind> {
    pop_assignable_to(frame, owner)
}

fn pop_expecting_width(
    frame: &mut EditFrame,
    expected_width: usize,
) -> Result<FrameType, VerifierErrorKind> {
    let typ = pop(frame)?;
    let found_width = typ.width();
    if found_width == expected_width {
        Ok(typ)
    } else {
        Err(VerifierErrorKind::InvalidWidth(found_width))
    }
}

fn pop_expecting_type(
    frame: &mut EditFrame,
    expected_type: &FrameType,
) -> Result<(), VerifierErrorKind> {
    let typ = pop(frame)?;
    if typ == *expected_type {
        Ok(())
    } else {
        Err(VerifierErrorKind::IncompatibleTypes(
            typ,
            expected_type.clone(),
        ))
    }
}

fn pop_assignable_to(
    frame: &mut EditFrame,
    expected_type: &FrameType,
) -> Result<(), VerifierErrorKind> {
    let typ = pop(frame)?;
    if FrameType::is_assignable(&typ, expected_type) {
        Ok(())
    } else {
        Err(VerifierErrorKind::IncompatibleTypes(
            typ,
            expected_type.clone(),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ConstantPool;
    use VerificationType::*;

    fn descriptor(desc: &str) -> MethodDescriptor<BinaryName> {
        MethodDescriptor::parse(desc).unwrap()
    }

    #[test]
    fn method_entry_frames() {
        let frame = Frame::method_entry("a/B", false, false, &descriptor("(JI[Ljava/lang/String;)V"));
        assert_eq!(
            frame.locals,
            vec![
                FrameType::object("a/B"),
                Long,
                Top,
                Integer,
                FrameType::object("[Ljava/lang/String;"),
            ]
        );
        assert!(frame.stack.is_empty());

        let frame = Frame::method_entry("a/B", true, false, &descriptor("(D)I"));
        assert_eq!(frame.locals, vec![Double, Top]);

        let frame = Frame::method_entry("a/B", false, true, &descriptor("()V"));
        assert_eq!(frame.locals, vec![UninitializedThis]);
    }

    #[test]
    fn compact_round_trip_and_trim() {
        let frame: EditFrame = Frame {
            locals: vec![Integer, Long, Top, Top, Top],
            stack: vec![],
        };
        assert_eq!(frame.compact_locals(), vec![Integer, Long]);
        let expanded = Frame::from_compact(&frame.compact_locals(), vec![]);
        assert_eq!(expanded.locals, vec![Integer, Long, Top]);
        assert!(expanded.same_as(&frame));
    }

    #[test]
    fn overwriting_half_of_wide_local() {
        let mut frame: EditFrame = Frame::from_compact(&[Long, Integer], vec![]);
        frame.set_local(1, Float);
        assert_eq!(frame.locals, vec![Top, Float, Integer]);

        let mut frame: EditFrame = Frame::from_compact(&[Integer, Double], vec![]);
        frame.set_local(0, Long);
        assert_eq!(frame.locals, vec![Long, Top, Top]);
    }

    #[test]
    fn stack_map_frame_compression() {
        let prev: ClassFileFrame = Frame::from_compact(&[Integer, Long], vec![]);

        let same = prev.clone();
        assert_eq!(
            same.stack_map_frame(3, &prev),
            StackMapFrame::SameLocalsNoStack { offset_delta: 3 }
        );

        let chopped = Frame::from_compact(&[Integer], vec![]);
        assert_eq!(
            chopped.stack_map_frame(4, &prev),
            StackMapFrame::ChopLocalsNoStack {
                offset_delta: 4,
                chopped_k: 1
            }
        );

        let appended = Frame::from_compact(&[Integer, Long, Float, Null], vec![]);
        assert_eq!(
            appended.stack_map_frame(5, &prev),
            StackMapFrame::AppendLocalsNoStack {
                offset_delta: 5,
                locals: vec![Float, Null]
            }
        );

        let one_stack = Frame::from_compact(&[Integer, Long], vec![Double]);
        assert_eq!(
            one_stack.stack_map_frame(6, &prev),
            StackMapFrame::SameLocalsOneStack {
                offset_delta: 6,
                stack: Double
            }
        );

        let full = Frame::from_compact(&[Float], vec![Integer]);
        let encoded = full.stack_map_frame(7, &prev);
        assert!(matches!(encoded, StackMapFrame::Full { .. }));

        // Applying each encoded frame gets back the original
        for frame in [same, chopped, appended, one_stack, full] {
            let encoded = frame.stack_map_frame(0, &prev);
            let decoded = prev.apply_stack_map_frame(&encoded, |t| Ok(t.clone())).unwrap();
            assert!(decoded.same_as(&frame), "{:?}", encoded);
        }
    }

    #[test]
    fn chop_too_many() {
        let prev: ClassFileFrame = Frame::from_compact(&[Integer], vec![]);
        let chop = StackMapFrame::ChopLocalsNoStack {
            offset_delta: 0,
            chopped_k: 2,
        };
        assert!(prev.apply_stack_map_frame(&chop, |t| Ok(t.clone())).is_err());
    }

    #[test]
    fn merge_weakens_locals() {
        let f1: EditFrame = Frame::from_compact(&[Integer, FrameType::object("a/B")], vec![Null]);
        let f2: EditFrame = Frame::from_compact(&[Float], vec![FrameType::object("a/C")]);
        let merged = f1.merge(&f2).unwrap();
        assert_eq!(merged.locals, vec![Top, Top]);
        assert_eq!(merged.stack, vec![FrameType::object("a/C")]);

        let f3: EditFrame = Frame::from_compact(&[], vec![]);
        assert!(f1.merge(&f3).is_none());
    }

    #[test]
    fn assignable_frames() {
        let target: EditFrame = Frame::from_compact(&[FrameType::object("a/B"), Top], vec![]);
        let source: EditFrame = Frame::from_compact(&[Null, Integer, Float], vec![]);
        assert!(source.is_assignable_to(&target));
        assert!(!target.is_assignable_to(&source));
    }

    #[test]
    fn verify_straight_line_code() {
        let mut pool = ConstantPool::new();
        let field = pool
            .get_field_ref("a/B", "count", "I")
            .unwrap();
        let method = pool
            .get_method_ref("java/lang/String", "startsWith", "(Ljava/lang/String;)Z", false)
            .unwrap();
        let prefix = pool.get_string("x").unwrap();

        let mut frame = Frame::method_entry("a/B", false, false, &descriptor("(Ljava/lang/String;)V"));
        let insns = [
            Instruction::ALoad(0),
            Instruction::GetField(field),
            Instruction::Pop,
            Instruction::ALoad(1),
            Instruction::Ldc(prefix.0),
            Instruction::Invoke(InvokeType::Virtual, method),
        ];
        for insn in &insns {
            frame.verify_instruction(insn, &pool, "a/B", None).unwrap();
        }
        assert_eq!(frame.stack, vec![Integer]);

        assert_eq!(
            frame.verify_instruction(&Instruction::LNeg, &pool, "a/B", None),
            Err(VerifierErrorKind::IncompatibleTypes(Integer, Long))
        );
    }

    #[test]
    fn constructor_call_initializes_all_copies() {
        let mut pool = ConstantPool::new();
        let class = pool.get_class("java/lang/Object").unwrap();
        let init = pool
            .get_method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap();
        let label = crate::jvm::code::LabelAllocator::new().fresh();

        let mut frame: EditFrame = Frame::empty();
        frame
            .verify_instruction(&Instruction::New(class), &pool, "a/B", Some(label))
            .unwrap();
        frame
            .verify_instruction(&Instruction::Dup, &pool, "a/B", None)
            .unwrap();
        assert_eq!(frame.stack, vec![Uninitialized(label), Uninitialized(label)]);
        frame
            .verify_instruction(&Instruction::Invoke(InvokeType::Special, init), &pool, "a/B", None)
            .unwrap();
        assert_eq!(frame.stack, vec![FrameType::object("java/lang/Object")]);
    }

    #[test]
    fn verify_returns() {
        let mut frame: EditFrame = Frame::from_compact(&[], vec![Integer]);
        let ret = Some(FieldType::int());
        frame
            .verify_branch_instruction::<Label>(&BranchInstruction::IReturn, &ret)
            .unwrap();

        let mut frame: EditFrame = Frame::from_compact(&[], vec![Null]);
        let ret = Some(FieldType::object(BinaryName::STRING));
        frame
            .verify_branch_instruction::<Label>(&BranchInstruction::AReturn, &ret)
            .unwrap();

        let mut frame: EditFrame = Frame::empty();
        assert!(frame
            .verify_branch_instruction::<Label>(&BranchInstruction::Return, &ret)
            .is_err());
    }
}
