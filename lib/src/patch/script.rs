//! A small structured language for describing new method logic
//!
//! Replacement bodies and guard blocks are written as trees of [`Stmt`], [`Cond`] and [`Expr`]
//! and compiled straight onto a [`CodeBuilder`]. Since the builder verifies every instruction as
//! it is pushed, the generated code always comes with correct frames and envelope. The language
//! is untyped on the surface: types come from the descriptors of the fields, methods, and locals
//! involved.

use super::PatchError;
use crate::jvm::code::{
    BranchInstruction, CodeBuilder, EqComparison, Instruction, InvokeType, Label, MethodShape,
    OrdComparison,
};
use crate::jvm::{
    BaseType, BinaryName, Error, FieldType, MethodDescriptor, ParseDescriptor, RefType,
    RenderDescriptor,
};
use crate::util::Width;
use std::collections::HashMap;

/// Expression leaving zero (calls to `void` methods) or one value on the stack
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Null,
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),

    /// Receiver of an instance method
    This,

    /// Method argument (0-indexed, not counting `this`)
    Arg(usize),

    /// Local introduced by [`Stmt::Let`], [`Stmt::AllOf`], or a catch binding
    Local(String),

    GetField {
        object: Box<Expr>,
        field: FieldRef,
    },
    GetStatic(FieldRef),
    Call(Box<Call>),
    CheckCast {
        value: Box<Expr>,
        class: String,
    },
    ArrayLength(Box<Expr>),
    ArrayElement {
        array: Box<Expr>,
        index: Box<Expr>,
    },

    /// Freshly allocated array of references, with one entry per element
    ObjectArray {
        element_class: String,
        elements: Vec<Expr>,
    },

    /// Bitwise and of two `int` or `boolean` values (both sides are always evaluated)
    BitAnd(Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub owner: String,
    pub name: String,
    pub descriptor: String,

    /// Must be present for everything but static calls
    pub receiver: Option<Expr>,
    pub args: Vec<Expr>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallKind {
    Static,
    Virtual,
    Interface,
    Special,
}

impl Expr {
    pub fn string(value: &str) -> Expr {
        Expr::Str(value.to_owned())
    }

    pub fn local(name: &str) -> Expr {
        Expr::Local(name.to_owned())
    }

    pub fn field(object: Expr, owner: &str, name: &str, descriptor: &str) -> Expr {
        Expr::GetField {
            object: Box::new(object),
            field: FieldRef::new(owner, name, descriptor),
        }
    }

    pub fn static_field(owner: &str, name: &str, descriptor: &str) -> Expr {
        Expr::GetStatic(FieldRef::new(owner, name, descriptor))
    }

    pub fn call_static(owner: &str, name: &str, descriptor: &str, args: Vec<Expr>) -> Expr {
        Expr::call(CallKind::Static, None, owner, name, descriptor, args)
    }

    pub fn call_virtual(
        receiver: Expr,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Expr>,
    ) -> Expr {
        Expr::call(CallKind::Virtual, Some(receiver), owner, name, descriptor, args)
    }

    pub fn call_interface(
        receiver: Expr,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Expr>,
    ) -> Expr {
        Expr::call(CallKind::Interface, Some(receiver), owner, name, descriptor, args)
    }

    fn call(
        kind: CallKind,
        receiver: Option<Expr>,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Expr>,
    ) -> Expr {
        Expr::Call(Box::new(Call {
            kind,
            owner: owner.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            receiver,
            args,
        }))
    }
}

impl FieldRef {
    pub fn new(owner: &str, name: &str, descriptor: &str) -> FieldRef {
        FieldRef {
            owner: owner.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }
}

/// Boolean condition, only ever compiled into branches
#[derive(Clone, Debug, PartialEq)]
pub enum Cond {
    IsNull(Expr),
    NotNull(Expr),

    /// `int`/`boolean` expression is non-zero
    True(Expr),

    /// `int`/`boolean` expression is zero
    False(Expr),

    /// Comparison of two `int` expressions
    Compare(OrdComparison, Expr, Expr),

    /// Short-circuiting conjunction (empty is true)
    All(Vec<Cond>),

    /// Short-circuiting disjunction (empty is false)
    Any(Vec<Cond>),

    Not(Box<Cond>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Introduce a new local with a given field descriptor
    Let {
        name: String,
        descriptor: String,
        value: Expr,
    },

    /// Overwrite an existing local
    Assign { name: String, value: Expr },

    /// Overwrite a method argument
    SetArg { index: usize, value: Expr },

    /// Evaluate for side effects, discarding any value
    Eval(Expr),

    If {
        cond: Cond,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },

    While { cond: Cond, body: Vec<Stmt> },

    /// Add a constant to an `int` local
    Increment { name: String, by: i16 },

    /// Bind `result` to whether `test` holds for every element of an array
    ///
    /// Inside `test`, the current element is bound to `element`. Every element is tested (there
    /// is no early exit), and the loop is compiled with a hidden index local and a back edge.
    AllOf {
        result: String,
        array: Expr,
        element: String,
        test: Cond,
    },

    TryCatch {
        body: Vec<Stmt>,

        /// Class of exceptions caught (`None` catches everything)
        catch_type: Option<String>,

        /// Local bound to the caught exception (otherwise it is discarded)
        binding: Option<String>,
        handler: Vec<Stmt>,
    },

    Return(Option<Expr>),
}

/// Compiles statements onto a builder
///
/// Locals introduced by the script get fresh slots from `first_free_local` upwards. Slots are never
/// reused within one script.
pub struct ScriptCompiler<'s, 'a> {
    builder: &'s mut CodeBuilder<'a>,
    shape: &'s MethodShape,
    locals: HashMap<String, (u16, FieldType<BinaryName>)>,
    next_local: u16,
}

impl<'s, 'a> ScriptCompiler<'s, 'a> {
    pub fn new(
        builder: &'s mut CodeBuilder<'a>,
        shape: &'s MethodShape,
        first_free_local: u16,
    ) -> ScriptCompiler<'s, 'a> {
        ScriptCompiler {
            builder,
            shape,
            locals: HashMap::new(),
            next_local: first_free_local.max(shape.parameter_slots()),
        }
    }

    /// Underlying builder, for emitting code around the script
    pub fn builder(&mut self) -> &mut CodeBuilder<'a> {
        &mut *self.builder
    }

    /// Whether the current position can be reached
    pub fn is_reachable(&self) -> bool {
        self.builder.current_frame().is_some()
    }

    pub fn block(&mut self, stmts: &[Stmt]) -> Result<(), PatchError> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    /// Jump to `target` if the condition is false, otherwise fall through
    pub fn jump_unless(&mut self, cond: &Cond, target: Label) -> Result<(), PatchError> {
        self.cond(cond, false, target)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), PatchError> {
        match stmt {
            Stmt::Let {
                name,
                descriptor,
                value,
            } => {
                let field_type = parse_field_type(descriptor)?;
                self.value(value)?;
                let slot = self.allocate(&field_type)?;
                self.builder.store(slot, &field_type)?;
                self.locals.insert(name.clone(), (slot, field_type));
            }

            Stmt::Assign { name, value } => {
                let (slot, field_type) = self.lookup(name)?;
                self.value(value)?;
                self.builder.store(slot, &field_type)?;
            }

            Stmt::SetArg { index, value } => {
                let (slot, field_type) = self.argument(*index)?;
                self.value(value)?;
                self.builder.store(slot, &field_type)?;
            }

            Stmt::Eval(expr) => {
                if self.expr(expr)?.is_some() {
                    self.builder.pop()?;
                }
            }

            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let else_label = self.builder.fresh_label();
                self.cond(cond, false, else_label)?;
                self.block(then)?;
                if otherwise.is_empty() {
                    self.place_if_reachable(else_label)?;
                } else {
                    let end = self.builder.fresh_label();
                    if self.is_reachable() {
                        self.builder.push_branch(BranchInstruction::Goto(end))?;
                    }
                    self.place_if_reachable(else_label)?;
                    self.block(otherwise)?;
                    self.place_if_reachable(end)?;
                }
            }

            Stmt::While { cond, body } => {
                let head = self.builder.fresh_label();
                let exit = self.builder.fresh_label();
                self.builder.place_label(head)?;
                self.cond(cond, false, exit)?;
                self.block(body)?;
                if self.is_reachable() {
                    self.builder.push_branch(BranchInstruction::Goto(head))?;
                }
                self.place_if_reachable(exit)?;
            }

            Stmt::Increment { name, by } => {
                let (slot, field_type) = self.lookup(name)?;
                if category(&field_type) != 'I' {
                    return Err(PatchError::Unsupported(format!(
                        "cannot increment `{}` of type {}",
                        name,
                        field_type.render()
                    )));
                }
                self.builder.push(Instruction::IInc(slot, *by))?;
            }

            Stmt::AllOf {
                result,
                array,
                element,
                test,
            } => self.all_of(result, array, element, test)?,

            Stmt::TryCatch {
                body,
                catch_type,
                binding,
                handler,
            } => {
                if body.is_empty() {
                    return Err(PatchError::Unsupported("empty try block".to_owned()));
                }
                let after = self.builder.fresh_label();
                let start = self.builder.begin_try()?;
                self.block(body)?;
                let (handler_label, handler_frame) =
                    self.builder.end_try(start, catch_type.as_deref())?;
                if self.is_reachable() {
                    self.builder.push_branch(BranchInstruction::Goto(after))?;
                }

                self.builder
                    .place_label_with_frame(handler_label, handler_frame)?;
                match binding {
                    Some(name) => {
                        let field_type = match catch_type {
                            Some(class) => class_type(class)?,
                            None => FieldType::object(BinaryName::THROWABLE),
                        };
                        let slot = self.allocate(&field_type)?;
                        self.builder.store(slot, &field_type)?;
                        self.locals.insert(name.clone(), (slot, field_type));
                    }
                    None => self.builder.pop()?,
                }
                self.block(handler)?;
                self.place_if_reachable(after)?;
            }

            Stmt::Return(value) => {
                let expected = self.shape.return_type().clone();
                match (value, &expected) {
                    (None, None) => (),
                    (Some(value), Some(expected)) => {
                        let found = self.value(value)?;
                        if category(&found) != category(expected) {
                            return Err(PatchError::ReturnTypeMismatch {
                                expected: expected.render(),
                                found: found.render(),
                            });
                        }
                    }
                    (None, Some(expected)) => {
                        return Err(PatchError::ReturnTypeMismatch {
                            expected: expected.render(),
                            found: "V".to_owned(),
                        })
                    }
                    (Some(value), None) => {
                        let found = self.value(value)?;
                        return Err(PatchError::ReturnTypeMismatch {
                            expected: "V".to_owned(),
                            found: found.render(),
                        });
                    }
                }
                self.builder.return_()?;
            }
        }
        Ok(())
    }

    fn all_of(
        &mut self,
        result: &str,
        array: &Expr,
        element: &str,
        test: &Cond,
    ) -> Result<(), PatchError> {
        let array_type = self.value(array)?;
        let element_type = match &array_type {
            FieldType::Ref(ref_type) => ref_type.element_type(),
            FieldType::Base(_) => None,
        }
        .ok_or_else(|| {
            PatchError::Unsupported(format!("cannot iterate over {}", array_type.render()))
        })?;

        let array_slot = self.allocate(&array_type)?;
        self.builder.store(array_slot, &array_type)?;
        let index_slot = self.allocate(&FieldType::int())?;
        self.builder.const_int(0)?;
        self.builder.store(index_slot, &FieldType::int())?;
        let result_slot = self.allocate(&FieldType::boolean())?;
        self.builder.const_int(1)?;
        self.builder.store(result_slot, &FieldType::boolean())?;
        let element_slot = self.allocate(&element_type)?;
        self.locals
            .insert(result.to_owned(), (result_slot, FieldType::boolean()));
        self.locals
            .insert(element.to_owned(), (element_slot, element_type.clone()));

        let head = self.builder.fresh_label();
        let exit = self.builder.fresh_label();
        self.builder.place_label(head)?;
        self.builder.push(Instruction::ILoad(index_slot))?;
        self.builder.push(Instruction::ALoad(array_slot))?;
        self.builder.push(Instruction::ArrayLength)?;
        self.builder
            .push_branch(BranchInstruction::IfICmp(OrdComparison::GE, exit))?;

        self.builder.push(Instruction::ALoad(array_slot))?;
        self.builder.push(Instruction::ILoad(index_slot))?;
        self.builder.push(array_load(&element_type))?;
        self.builder.store(element_slot, &element_type)?;

        self.builder.push(Instruction::ILoad(result_slot))?;
        self.cond_value(test)?;
        self.builder.push(Instruction::IAnd)?;
        self.builder.push(Instruction::IStore(result_slot))?;

        self.builder.push(Instruction::IInc(index_slot, 1))?;
        self.builder.push_branch(BranchInstruction::Goto(head))?;
        self.builder.place_label(exit)?;
        Ok(())
    }

    /// Compile a condition as a jump to `target` taken when the condition equals `jump_if`
    fn cond(&mut self, cond: &Cond, jump_if: bool, target: Label) -> Result<(), PatchError> {
        match cond {
            Cond::IsNull(expr) | Cond::NotNull(expr) => {
                self.value(expr)?;
                let is_null = matches!(cond, Cond::IsNull(_));
                let comparison = if is_null == jump_if {
                    EqComparison::EQ
                } else {
                    EqComparison::NE
                };
                self.builder
                    .push_branch(BranchInstruction::IfNull(comparison, target))?;
            }

            Cond::True(expr) | Cond::False(expr) => {
                self.value(expr)?;
                let is_true = matches!(cond, Cond::True(_));
                let comparison = if is_true == jump_if {
                    OrdComparison::NE
                } else {
                    OrdComparison::EQ
                };
                self.builder
                    .push_branch(BranchInstruction::If(comparison, target))?;
            }

            Cond::Compare(comparison, lhs, rhs) => {
                self.value(lhs)?;
                self.value(rhs)?;
                let comparison = if jump_if { *comparison } else { !*comparison };
                self.builder
                    .push_branch(BranchInstruction::IfICmp(comparison, target))?;
            }

            Cond::Not(inner) => self.cond(inner, !jump_if, target)?,

            // Jump when everything holds / when anything fails
            Cond::All(conds) => self.junction(conds, true, jump_if, target)?,

            // Jump when anything holds / when everything fails
            Cond::Any(conds) => self.junction(conds, false, jump_if, target)?,
        }
        Ok(())
    }

    /// Conjunction (`is_all`) or disjunction of conditions
    fn junction(
        &mut self,
        conds: &[Cond],
        is_all: bool,
        jump_if: bool,
        target: Label,
    ) -> Result<(), PatchError> {
        let (last, init) = match conds.split_last() {
            Some(split) => split,
            None => {
                if jump_if == is_all {
                    self.builder.push_branch(BranchInstruction::Goto(target))?;
                }
                return Ok(());
            }
        };

        if jump_if != is_all {
            // Any operand deciding the outcome jumps straight to the target
            for cond in conds {
                self.cond(cond, jump_if, target)?;
            }
        } else {
            // Operands that decide the outcome skip over the final jump
            let skip = self.builder.fresh_label();
            for cond in init {
                self.cond(cond, !jump_if, skip)?;
            }
            self.cond(last, jump_if, target)?;
            self.place_if_reachable(skip)?;
        }
        Ok(())
    }

    /// Push `1` if the condition holds and `0` otherwise
    fn cond_value(&mut self, cond: &Cond) -> Result<(), PatchError> {
        let zero = self.builder.fresh_label();
        let join = self.builder.fresh_label();
        self.cond(cond, false, zero)?;
        if self.is_reachable() {
            self.builder.const_int(1)?;
            self.builder.push_branch(BranchInstruction::Goto(join))?;
        }
        if self.builder.is_jumped_to(zero) {
            self.builder.place_label(zero)?;
            self.builder.const_int(0)?;
        }
        self.place_if_reachable(join)?;
        Ok(())
    }

    /// Compile an expression that must produce a value
    fn value(&mut self, expr: &Expr) -> Result<FieldType<BinaryName>, PatchError> {
        self.expr(expr)?.ok_or_else(|| {
            PatchError::Unsupported(format!("`void` expression used as a value: {:?}", expr))
        })
    }

    /// Compile an expression, returning the type of the value produced (if any)
    fn expr(&mut self, expr: &Expr) -> Result<Option<FieldType<BinaryName>>, PatchError> {
        let field_type = match expr {
            Expr::Null => {
                self.builder.push(Instruction::AConstNull)?;
                FieldType::object(BinaryName::OBJECT)
            }
            Expr::Int(integer) => {
                self.builder.const_int(*integer)?;
                FieldType::int()
            }
            Expr::Long(long) => {
                self.builder.const_long(*long)?;
                FieldType::long()
            }
            Expr::Bool(boolean) => {
                self.builder.const_int(*boolean as i32)?;
                FieldType::boolean()
            }
            Expr::Str(string) => {
                self.builder.const_string(string)?;
                FieldType::object(BinaryName::STRING)
            }
            Expr::This => {
                if self.shape.is_static {
                    return Err(PatchError::Unsupported(
                        "`this` in a static method".to_owned(),
                    ));
                }
                self.builder.push(Instruction::ALoad(0))?;
                class_type(&self.shape.this_class)?
            }
            Expr::Arg(index) => {
                let (slot, field_type) = self.argument(*index)?;
                self.builder.load(slot, &field_type)?;
                field_type
            }
            Expr::Local(name) => {
                let (slot, field_type) = self.lookup(name)?;
                self.builder.load(slot, &field_type)?;
                field_type
            }
            Expr::GetField { object, field } => {
                self.value(object)?;
                self.builder
                    .get_field(false, &field.owner, &field.name, &field.descriptor)?;
                parse_field_type(&field.descriptor)?
            }
            Expr::GetStatic(field) => {
                self.builder
                    .get_field(true, &field.owner, &field.name, &field.descriptor)?;
                parse_field_type(&field.descriptor)?
            }
            Expr::Call(call) => return self.call(call),
            Expr::CheckCast { value, class } => {
                self.value(value)?;
                self.builder.check_cast(class)?;
                class_type(class)?
            }
            Expr::ArrayLength(array) => {
                self.value(array)?;
                self.builder.push(Instruction::ArrayLength)?;
                FieldType::int()
            }
            Expr::ArrayElement { array, index } => {
                let array_type = self.value(array)?;
                let element_type = match &array_type {
                    FieldType::Ref(ref_type) => ref_type.element_type(),
                    FieldType::Base(_) => None,
                }
                .ok_or_else(|| {
                    PatchError::Unsupported(format!("cannot index into {}", array_type.render()))
                })?;
                self.value(index)?;
                self.builder.push(array_load(&element_type))?;
                element_type
            }
            Expr::ObjectArray {
                element_class,
                elements,
            } => {
                let element_type = class_type(element_class)?;
                self.builder.const_int(elements.len() as i32)?;
                self.builder.new_ref_array(element_class)?;
                for (index, element) in elements.iter().enumerate() {
                    self.builder.push(Instruction::Dup)?;
                    self.builder.const_int(index as i32)?;
                    self.value(element)?;
                    self.builder.push(Instruction::AAStore)?;
                }
                FieldType::array(element_type)
            }
            Expr::BitAnd(lhs, rhs) => {
                self.value(lhs)?;
                self.value(rhs)?;
                self.builder.push(Instruction::IAnd)?;
                FieldType::int()
            }
        };
        Ok(Some(field_type))
    }

    fn call(&mut self, call: &Call) -> Result<Option<FieldType<BinaryName>>, PatchError> {
        let descriptor: MethodDescriptor<BinaryName> = MethodDescriptor::parse(&call.descriptor)
            .map_err(|_| Error::BadDescriptor(call.descriptor.clone()))?;
        if descriptor.parameters.len() != call.args.len() {
            return Err(PatchError::ArityMismatch {
                method: format!("{}.{}{}", call.owner, call.name, call.descriptor),
                expected: descriptor.parameters.len(),
                found: call.args.len(),
            });
        }

        match (call.kind, &call.receiver) {
            (CallKind::Static, None) => (),
            (CallKind::Static, Some(_)) => {
                return Err(PatchError::Unsupported(format!(
                    "static call to {} with a receiver",
                    call.name
                )))
            }
            (_, None) => {
                return Err(PatchError::Unsupported(format!(
                    "instance call to {} without a receiver",
                    call.name
                )))
            }
            (_, Some(receiver)) => {
                self.value(receiver)?;
            }
        }
        for arg in &call.args {
            self.value(arg)?;
        }

        let invoke_type = match call.kind {
            CallKind::Static => InvokeType::Static,
            CallKind::Virtual => InvokeType::Virtual,
            CallKind::Special => InvokeType::Special,
            CallKind::Interface => InvokeType::Interface(0),
        };
        self.builder
            .invoke(invoke_type, &call.owner, &call.name, &call.descriptor)?;
        Ok(descriptor.return_type)
    }

    fn place_if_reachable(&mut self, label: Label) -> Result<(), PatchError> {
        if self.is_reachable() || self.builder.is_jumped_to(label) {
            self.builder.place_label(label)?;
        }
        Ok(())
    }

    fn allocate(&mut self, field_type: &FieldType<BinaryName>) -> Result<u16, PatchError> {
        let slot = self.next_local;
        self.next_local = slot
            .checked_add(field_type.width() as u16)
            .ok_or_else(|| PatchError::Unsupported("too many locals".to_owned()))?;
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Result<(u16, FieldType<BinaryName>), PatchError> {
        self.locals
            .get(name)
            .cloned()
            .ok_or_else(|| PatchError::UnknownVariable(name.to_owned()))
    }

    fn argument(&self, index: usize) -> Result<(u16, FieldType<BinaryName>), PatchError> {
        self.shape
            .parameter_slot(index)
            .map(|(slot, field_type)| (slot, field_type.clone()))
            .ok_or(PatchError::ArgumentOutOfRange(index))
    }
}

fn parse_field_type(descriptor: &str) -> Result<FieldType<BinaryName>, PatchError> {
    FieldType::parse(descriptor)
        .map_err(|_| PatchError::Class(Error::BadDescriptor(descriptor.to_owned())))
}

/// Type of values of a class (which may be an array class like `[I`)
fn class_type(class: &str) -> Result<FieldType<BinaryName>, PatchError> {
    RefType::from_class_name(class)
        .map(FieldType::Ref)
        .map_err(|_| PatchError::Class(Error::BadName(class.to_owned())))
}

/// Computational type, as far as loads, stores, and returns are concerned
pub(super) fn category(field_type: &FieldType<BinaryName>) -> char {
    match field_type {
        FieldType::Ref(_) => 'A',
        FieldType::Base(BaseType::Long) => 'J',
        FieldType::Base(BaseType::Float) => 'F',
        FieldType::Base(BaseType::Double) => 'D',
        FieldType::Base(_) => 'I',
    }
}

fn array_load(element_type: &FieldType<BinaryName>) -> Instruction {
    match element_type {
        FieldType::Ref(_) => Instruction::AALoad,
        FieldType::Base(BaseType::Boolean | BaseType::Byte) => Instruction::BALoad,
        FieldType::Base(BaseType::Char) => Instruction::CALoad,
        FieldType::Base(BaseType::Short) => Instruction::SALoad,
        FieldType::Base(BaseType::Int) => Instruction::IALoad,
        FieldType::Base(BaseType::Long) => Instruction::LALoad,
        FieldType::Base(BaseType::Float) => Instruction::FALoad,
        FieldType::Base(BaseType::Double) => Instruction::DALoad,
    }
}
