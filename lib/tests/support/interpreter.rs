//! Just enough of a JVM to run patched methods in tests
//!
//! Methods of the class under test are interpreted. Calls into any other class go to a [`Host`],
//! which records them and answers with canned results. Every step checks the operand stack height
//! against the declared `max_stack`, and every local access against `max_locals`, panicking on a
//! violation.

use classpatch::jvm::class_file::{ClassFile, Constant, ConstantPool};
use classpatch::jvm::code::{
    BranchInstruction, EqComparison, Instruction, InvokeType, Label, MethodBody, MethodShape, Node,
};
use classpatch::jvm::{BaseType, BinaryName, FieldType, MethodDescriptor, ParseDescriptor};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Null,
    Str(String),
    Obj { class: String, id: usize },
    Array(usize),
}

impl Value {
    fn width(&self) -> usize {
        match self {
            Value::Long(_) => 2,
            _ => 1,
        }
    }

    fn int(&self) -> i32 {
        match self {
            Value::Int(int) => *int,
            other => panic!("expected an int, got {:?}", other),
        }
    }

    fn long(&self) -> i64 {
        match self {
            Value::Long(long) => *long,
            other => panic!("expected a long, got {:?}", other),
        }
    }

    fn is_reference(&self) -> bool {
        !matches!(self, Value::Int(_) | Value::Long(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),

    /// Class of the exception that escaped
    Threw(String),
}

/// Call that left the class under test
#[derive(Clone, Debug, PartialEq)]
pub struct HostCall {
    /// `owner.name`
    pub method: String,
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
}

/// Everything outside the class under test
#[derive(Default)]
pub struct Host {
    pub calls: Vec<HostCall>,
    pub statics: HashMap<String, Value>,
    pub fields: HashMap<(usize, String), Value>,
    pub arrays: Vec<Vec<Value>>,
    results: HashMap<String, Vec<Value>>,
    throws: HashMap<String, String>,
    next_object: usize,
}

impl Host {
    pub fn new() -> Host {
        Host::default()
    }

    pub fn object(&mut self, class: &str) -> Value {
        self.next_object += 1;
        Value::Obj {
            class: class.to_owned(),
            id: self.next_object,
        }
    }

    pub fn array(&mut self, elements: Vec<Value>) -> Value {
        self.arrays.push(elements);
        Value::Array(self.arrays.len() - 1)
    }

    /// Answer calls to `owner.name` with these values in order, repeating the last one
    pub fn returns(&mut self, method: &str, values: Vec<Value>) -> &mut Host {
        self.results.insert(method.to_owned(), values);
        self
    }

    /// Make calls to `owner.name` throw a fresh exception of the given class
    pub fn throws(&mut self, method: &str, exception: &str) -> &mut Host {
        self.throws.insert(method.to_owned(), exception.to_owned());
        self
    }

    pub fn set_field(&mut self, object: &Value, name: &str, value: Value) -> &mut Host {
        match object {
            Value::Obj { id, .. } => {
                self.fields.insert((*id, name.to_owned()), value);
            }
            other => panic!("{:?} has no fields", other),
        }
        self
    }

    pub fn calls_to(&self, method: &str) -> Vec<&HostCall> {
        self.calls.iter().filter(|call| call.method == method).collect()
    }

    fn answer(
        &mut self,
        method: &str,
        return_type: &Option<FieldType<BinaryName>>,
    ) -> Option<Value> {
        let return_type = return_type.as_ref()?;
        if let Some(values) = self.results.get_mut(method) {
            if values.len() > 1 {
                return Some(values.remove(0));
            }
            if let Some(value) = values.first() {
                return Some(value.clone());
            }
        }
        Some(default_value(return_type))
    }
}

fn default_value(field_type: &FieldType<BinaryName>) -> Value {
    match field_type {
        FieldType::Base(BaseType::Long) => Value::Long(0),
        FieldType::Base(BaseType::Float) | FieldType::Base(BaseType::Double) => {
            panic!("floating point values are not supported")
        }
        FieldType::Base(_) => Value::Int(0),
        FieldType::Ref(_) => Value::Null,
    }
}

/// Superclass, for the exception classes tests throw around
fn superclass(class: &str) -> Option<&'static str> {
    match class {
        "java/lang/Throwable" => None,
        "java/lang/Exception" | "java/lang/Error" => Some("java/lang/Throwable"),
        "java/lang/RuntimeException" | "java/io/IOException" => Some("java/lang/Exception"),
        "java/lang/IllegalStateException"
        | "java/lang/IllegalArgumentException"
        | "java/lang/NullPointerException"
        | "java/lang/ArithmeticException" => Some("java/lang/RuntimeException"),
        _ => Some("java/lang/Throwable"),
    }
}

fn is_subclass(class: &str, of: &str) -> bool {
    let mut current: Option<&str> = Some(class);
    while let Some(name) = current {
        if name == of {
            return true;
        }
        current = superclass(name);
    }
    false
}

/// Run a method of a class
pub fn run(
    class_bytes: &[u8],
    name: &str,
    descriptor: &str,
    receiver: Option<Value>,
    args: Vec<Value>,
    host: &mut Host,
) -> Outcome {
    let class = ClassFile::parse(class_bytes).unwrap();
    let mut machine = Machine {
        class: &class,
        host,
        steps: 0,
    };
    let mut values: Vec<Value> = receiver.into_iter().collect();
    values.extend(args);
    match machine.call(name, descriptor, values) {
        Ok(value) => Outcome::Returned(value),
        Err(Value::Obj { class, .. }) => Outcome::Threw(class),
        Err(other) => panic!("threw a non-object {:?}", other),
    }
}

struct Machine<'a> {
    class: &'a ClassFile,
    host: &'a mut Host,
    steps: usize,
}

enum Step {
    Next,
    Jump(Label),
    Return(Option<Value>),
    Throw(Value),
}

/// Operand stack that checks its height in slots
struct Stack {
    values: Vec<Value>,
    max_stack: usize,
}

impl Stack {
    fn push(&mut self, value: Value) {
        self.values.push(value);
        let height: usize = self.values.iter().map(Value::width).sum();
        assert!(
            height <= self.max_stack,
            "stack height {} exceeds max_stack {}",
            height,
            self.max_stack
        );
    }

    fn pop(&mut self) -> Value {
        self.values.pop().expect("stack underflow")
    }
}

/// Local variables that check accesses against `max_locals`
struct Locals {
    slots: Vec<Option<Value>>,
}

impl Locals {
    fn load(&self, slot: u16) -> Value {
        let slot = slot as usize;
        assert!(
            slot < self.slots.len(),
            "local {} is outside max_locals {}",
            slot,
            self.slots.len()
        );
        self.slots[slot]
            .clone()
            .unwrap_or_else(|| panic!("local {} read before being set", slot))
    }

    fn store(&mut self, slot: u16, value: Value) {
        let slot = slot as usize;
        let width = value.width();
        assert!(
            slot + width <= self.slots.len(),
            "local {} is outside max_locals {}",
            slot,
            self.slots.len()
        );
        self.slots[slot] = Some(value);
        if width == 2 {
            self.slots[slot + 1] = None;
        }
    }
}

impl<'a> Machine<'a> {
    fn pool(&self) -> &'a ConstantPool {
        &self.class.constants
    }

    /// Call a method of the class under test
    fn call(
        &mut self,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, Value> {
        let class = self.class;
        let index = class
            .methods
            .iter()
            .position(|method| {
                class.method_name(method).unwrap() == name
                    && class.method_descriptor(method).unwrap() == descriptor
            })
            .unwrap_or_else(|| panic!("no method {}{}", name, descriptor));
        let method = &class.methods[index];
        let shape = MethodShape::parse(
            class.name().unwrap(),
            name,
            method.access_flags,
            descriptor,
        )
        .unwrap();
        let code = class
            .method_code(index)
            .unwrap()
            .unwrap_or_else(|| panic!("{}{} has no code", name, descriptor));
        let body = MethodBody::decode(&code, &class.constants, shape).unwrap();
        self.execute(&body, args)
    }

    fn execute(&mut self, body: &MethodBody, args: Vec<Value>) -> Result<Option<Value>, Value> {
        let positions: HashMap<Label, usize> = body
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(position, node)| match node {
                Node::Label(label) => Some((*label, position)),
                _ => None,
            })
            .collect();

        let mut locals = Locals {
            slots: vec![None; body.envelope.max_locals as usize],
        };
        let mut slot: u16 = 0;
        for arg in args {
            let width = arg.width() as u16;
            locals.store(slot, arg);
            slot += width;
        }
        let mut stack = Stack {
            values: vec![],
            max_stack: body.envelope.max_stack as usize,
        };

        let mut pc = 0;
        loop {
            self.steps += 1;
            assert!(self.steps < 1_000_000, "ran for too long");

            let node = body
                .nodes
                .get(pc)
                .unwrap_or_else(|| panic!("fell off the end of the method"));
            let step = match node {
                Node::Label(_) => Step::Next,
                Node::Insn(insn) => self.instruction(insn, &mut stack, &mut locals),
                Node::Branch(branch) => self.branch(branch, &mut stack),
            };

            match step {
                Step::Next => pc += 1,
                Step::Jump(label) => pc = positions[&label],
                Step::Return(value) => return Ok(value),
                Step::Throw(exception) => {
                    let class = match &exception {
                        Value::Obj { class, .. } => class.clone(),
                        other => panic!("throwing {:?}", other),
                    };
                    let handler = body.handlers.iter().find(|handler| {
                        let start = positions[&handler.start];
                        let end = positions[&handler.end];
                        start <= pc
                            && pc < end
                            && handler
                                .catch_type
                                .as_ref()
                                .map_or(true, |catch| is_subclass(&class, catch))
                    });
                    match handler {
                        None => return Err(exception),
                        Some(handler) => {
                            stack.values.clear();
                            stack.push(exception);
                            pc = positions[&handler.handler];
                        }
                    }
                }
            }
        }
    }

    fn exception(&mut self, class: &str) -> Step {
        Step::Throw(self.host.object(class))
    }

    fn instruction(&mut self, insn: &Instruction, stack: &mut Stack, locals: &mut Locals) -> Step {
        use Instruction::*;

        let pool = self.pool();
        match insn {
            Nop | CheckCast(_) => (),
            AConstNull => stack.push(Value::Null),
            IConstM1 => stack.push(Value::Int(-1)),
            IConst0 => stack.push(Value::Int(0)),
            IConst1 => stack.push(Value::Int(1)),
            IConst2 => stack.push(Value::Int(2)),
            IConst3 => stack.push(Value::Int(3)),
            IConst4 => stack.push(Value::Int(4)),
            IConst5 => stack.push(Value::Int(5)),
            LConst0 => stack.push(Value::Long(0)),
            LConst1 => stack.push(Value::Long(1)),
            BiPush(byte) => stack.push(Value::Int(*byte as i32)),
            SiPush(short) => stack.push(Value::Int(*short as i32)),
            Ldc(index) | Ldc2(index) => match pool.get(*index).unwrap() {
                Constant::Integer(int) => stack.push(Value::Int(*int)),
                Constant::Long(long) => stack.push(Value::Long(*long)),
                Constant::String(utf8) => {
                    stack.push(Value::Str(pool.utf8(*utf8).unwrap().to_owned()))
                }
                other => panic!("unsupported constant {:?}", other),
            },

            ILoad(slot) | LLoad(slot) | ALoad(slot) => stack.push(locals.load(*slot)),
            IStore(slot) | LStore(slot) | AStore(slot) => {
                let value = stack.pop();
                locals.store(*slot, value);
            }
            IInc(slot, by) => {
                let value = locals.load(*slot).int();
                locals.store(*slot, Value::Int(value.wrapping_add(*by as i32)));
            }

            Pop => {
                let value = stack.pop();
                assert_eq!(value.width(), 1, "pop of a wide value");
            }
            Pop2 => {
                if stack.pop().width() == 1 {
                    stack.pop();
                }
            }
            Dup => {
                let value = stack.pop();
                stack.push(value.clone());
                stack.push(value);
            }
            DupX1 => {
                let a = stack.pop();
                let b = stack.pop();
                stack.push(a.clone());
                stack.push(b);
                stack.push(a);
            }
            Swap => {
                let a = stack.pop();
                let b = stack.pop();
                stack.push(a);
                stack.push(b);
            }

            IAdd | ISub | IMul | IAnd | IOr | IXor | IDiv | IRem => {
                let rhs = stack.pop().int();
                let lhs = stack.pop().int();
                let result = match insn {
                    IAdd => lhs.wrapping_add(rhs),
                    ISub => lhs.wrapping_sub(rhs),
                    IMul => lhs.wrapping_mul(rhs),
                    IAnd => lhs & rhs,
                    IOr => lhs | rhs,
                    IXor => lhs ^ rhs,
                    _ if rhs == 0 => return self.exception("java/lang/ArithmeticException"),
                    IDiv => lhs.wrapping_div(rhs),
                    _ => lhs.wrapping_rem(rhs),
                };
                stack.push(Value::Int(result));
            }
            INeg => {
                let value = stack.pop().int();
                stack.push(Value::Int(value.wrapping_neg()));
            }
            LAdd | LSub => {
                let rhs = stack.pop().long();
                let lhs = stack.pop().long();
                let result = match insn {
                    LAdd => lhs.wrapping_add(rhs),
                    _ => lhs.wrapping_sub(rhs),
                };
                stack.push(Value::Long(result));
            }
            LCmp => {
                let rhs = stack.pop().long();
                let lhs = stack.pop().long();
                stack.push(Value::Int(lhs.cmp(&rhs) as i32));
            }
            I2L => {
                let value = stack.pop().int();
                stack.push(Value::Long(value as i64));
            }
            L2I => {
                let value = stack.pop().long();
                stack.push(Value::Int(value as i32));
            }

            New(class) => {
                let object = self.host.object(pool.class_name(*class).unwrap());
                stack.push(object);
            }
            ANewArray(_) | NewArray(_) => {
                let length = stack.pop().int();
                if length < 0 {
                    return self.exception("java/lang/NegativeArraySizeException");
                }
                let element = match insn {
                    ANewArray(_) => Value::Null,
                    NewArray(BaseType::Long) => Value::Long(0),
                    _ => Value::Int(0),
                };
                let array = self.host.array(vec![element; length as usize]);
                stack.push(array);
            }
            ArrayLength => match stack.pop() {
                Value::Array(array) => stack.push(Value::Int(self.host.arrays[array].len() as i32)),
                Value::Null => return self.exception("java/lang/NullPointerException"),
                other => panic!("arraylength of {:?}", other),
            },
            AALoad | IALoad | BALoad | LALoad => {
                let index = stack.pop().int();
                match stack.pop() {
                    Value::Array(array) => match self.host.arrays[array].get(index as usize) {
                        Some(element) if index >= 0 => stack.push(element.clone()),
                        _ => return self.exception("java/lang/ArrayIndexOutOfBoundsException"),
                    },
                    Value::Null => return self.exception("java/lang/NullPointerException"),
                    other => panic!("array load from {:?}", other),
                }
            }
            AAStore | IAStore | BAStore | LAStore => {
                let value = stack.pop();
                let index = stack.pop().int();
                match stack.pop() {
                    Value::Array(array) => match self.host.arrays[array].get_mut(index as usize) {
                        Some(element) if index >= 0 => *element = value,
                        _ => return self.exception("java/lang/ArrayIndexOutOfBoundsException"),
                    },
                    Value::Null => return self.exception("java/lang/NullPointerException"),
                    other => panic!("array store into {:?}", other),
                }
            }

            GetStatic(field) | PutStatic(field) => {
                let field = pool.field_ref(*field).unwrap();
                let key = format!("{}.{}", field.class, field.name);
                if let PutStatic(_) = insn {
                    let value = stack.pop();
                    self.host.statics.insert(key, value);
                } else {
                    let value = match self.host.statics.get(&key) {
                        Some(value) => value.clone(),
                        None => default_value(&FieldType::parse(field.descriptor).unwrap()),
                    };
                    stack.push(value);
                }
            }
            GetField(field) => {
                let field = pool.field_ref(*field).unwrap();
                match stack.pop() {
                    Value::Obj { id, .. } => {
                        let value = match self.host.fields.get(&(id, field.name.to_owned())) {
                            Some(value) => value.clone(),
                            None => default_value(&FieldType::parse(field.descriptor).unwrap()),
                        };
                        stack.push(value);
                    }
                    Value::Null => return self.exception("java/lang/NullPointerException"),
                    other => panic!("getfield on {:?}", other),
                }
            }
            PutField(field) => {
                let field = pool.field_ref(*field).unwrap();
                let value = stack.pop();
                match stack.pop() {
                    Value::Obj { id, .. } => {
                        self.host.fields.insert((id, field.name.to_owned()), value);
                    }
                    Value::Null => return self.exception("java/lang/NullPointerException"),
                    other => panic!("putfield on {:?}", other),
                }
            }

            Invoke(invoke_type, method) => {
                let method = pool.method_ref(*method).unwrap();
                let descriptor: MethodDescriptor<BinaryName> =
                    MethodDescriptor::parse(method.descriptor).unwrap();
                let mut args: Vec<Value> = (0..descriptor.parameters.len())
                    .map(|_| stack.pop())
                    .collect();
                args.reverse();
                let receiver = match invoke_type {
                    InvokeType::Static => None,
                    _ => Some(stack.pop()),
                };
                if receiver == Some(Value::Null) {
                    return self.exception("java/lang/NullPointerException");
                }

                let result = if method.name == "<init>" {
                    Ok(None)
                } else if *invoke_type == InvokeType::Static
                    && method.class == self.class.name().unwrap()
                {
                    self.call(method.name, method.descriptor, args)
                } else if let Some(Value::Str(string)) = &receiver {
                    Ok(Some(string_method(string, method.name, &args)))
                } else {
                    let key = format!("{}.{}", method.class, method.name);
                    self.host.calls.push(HostCall {
                        method: key.clone(),
                        receiver,
                        args,
                    });
                    match self.host.throws.get(&key).cloned() {
                        Some(exception) => Err(self.host.object(&exception)),
                        None => Ok(self.host.answer(&key, &descriptor.return_type)),
                    }
                };
                match result {
                    Ok(Some(value)) => stack.push(value),
                    Ok(None) => (),
                    Err(exception) => return Step::Throw(exception),
                }
            }

            other => panic!("unsupported instruction {:?}", other),
        }
        Step::Next
    }

    fn branch(&mut self, branch: &BranchInstruction<Label>, stack: &mut Stack) -> Step {
        use BranchInstruction::*;

        let jump_if = |holds: bool, label: &Label| {
            if holds {
                Step::Jump(*label)
            } else {
                Step::Next
            }
        };
        match branch {
            If(comparison, label) => {
                let value = stack.pop().int();
                jump_if(comparison.holds(value, 0), label)
            }
            IfICmp(comparison, label) => {
                let rhs = stack.pop().int();
                let lhs = stack.pop().int();
                jump_if(comparison.holds(lhs, rhs), label)
            }
            IfACmp(comparison, label) => {
                let rhs = stack.pop();
                let lhs = stack.pop();
                assert!(lhs.is_reference() && rhs.is_reference());
                jump_if((lhs == rhs) == (*comparison == EqComparison::EQ), label)
            }
            IfNull(comparison, label) => {
                let value = stack.pop();
                assert!(value.is_reference());
                jump_if(
                    (value == Value::Null) == (*comparison == EqComparison::EQ),
                    label,
                )
            }
            Goto(label) => Step::Jump(*label),
            TableSwitch {
                default,
                low,
                targets,
            } => {
                let value = stack.pop().int();
                let target = value
                    .checked_sub(*low)
                    .and_then(|index| usize::try_from(index).ok())
                    .and_then(|index| targets.get(index))
                    .unwrap_or(default);
                Step::Jump(*target)
            }
            LookupSwitch { default, targets } => {
                let value = stack.pop().int();
                let target = targets
                    .iter()
                    .find(|(key, _)| *key == value)
                    .map_or(default, |(_, target)| target);
                Step::Jump(*target)
            }
            IReturn | LReturn | AReturn => Step::Return(Some(stack.pop())),
            Return => Step::Return(None),
            AThrow => match stack.pop() {
                Value::Null => self.exception("java/lang/NullPointerException"),
                exception => Step::Throw(exception),
            },
            FReturn | DReturn => panic!("floating point values are not supported"),
        }
    }
}

fn string_method(string: &str, name: &str, args: &[Value]) -> Value {
    match (name, args) {
        ("startsWith", [Value::Str(prefix)]) => {
            Value::Int(string.starts_with(prefix.as_str()) as i32)
        }
        ("length", []) => Value::Int(string.encode_utf16().count() as i32),
        ("equals", [other]) => Value::Int((Value::Str(string.to_owned()) == *other) as i32),
        _ => panic!("unsupported String.{}", name),
    }
}
