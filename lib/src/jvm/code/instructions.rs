//! The representation is slightly different from the usual presentation of JVM bytecode:
//!
//!   - The "wide" instruction doesn't show up at all, but instead gets merged into the
//!     instructions it is allowed to modify
//!
//!   - Some instructions (like the branches) get abstracted into one instruction with a field.
//!     This helps with repetitive pattern matches and also simplifies tasks like inverting a
//!     branch condition.
//!
//!   - `jsr` and `ret` are omitted. Class files from Java 7 onwards can't contain them, and older
//!     ones are rejected when decoding.

use crate::jvm::binary_format::Serialize;
use crate::jvm::class_file::{
    ClassConstantIndex, ConstantIndex, ConstantPool, FieldRefConstantIndex,
    InvokeDynamicConstantIndex, MethodRefConstantIndex,
};
use crate::jvm::{BaseType, Error, FieldType, MethodDescriptor, ParseDescriptor, BinaryName};
use crate::util::Width;
use byteorder::WriteBytesExt;
use std::convert::TryFrom;
use std::io::Result;
use std::ops::Not;

/// Non-branching JVM bytecode instruction
///
/// Operands that refer to the constant pool are indices into the pool of the class the
/// instruction lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    Nop,
    AConstNull,
    IConstM1,
    IConst0,
    IConst1,
    IConst2,
    IConst3,
    IConst4,
    IConst5,
    LConst0,
    LConst1,
    FConst0,
    FConst1,
    FConst2,
    DConst0,
    DConst1,
    BiPush(i8),
    SiPush(i16),
    Ldc(ConstantIndex), // covers both `ldc` and `ldc_w`
    Ldc2(ConstantIndex),
    ILoad(u16), // covers `iload`, `iload{0,3}`, and `wide iload`
    LLoad(u16),
    FLoad(u16),
    DLoad(u16),
    ALoad(u16),
    IALoad,
    LALoad,
    FALoad,
    DALoad,
    AALoad,
    BALoad,
    CALoad,
    SALoad,
    IStore(u16), // covers `istore`, `istore{0,3}`, and `wide istore`
    LStore(u16),
    FStore(u16),
    DStore(u16),
    AStore(u16),
    IAStore,
    LAStore,
    FAStore,
    DAStore,
    AAStore,
    BAStore,
    CAStore,
    SAStore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    IAdd,
    LAdd,
    FAdd,
    DAdd,
    ISub,
    LSub,
    FSub,
    DSub,
    IMul,
    LMul,
    FMul,
    DMul,
    IDiv,
    LDiv,
    FDiv,
    DDiv,
    IRem,
    LRem,
    FRem,
    DRem,
    INeg,
    LNeg,
    FNeg,
    DNeg,
    ISh(ShiftType), // covers `ishr`, `ishl`, and `iushr`
    LSh(ShiftType), // covers `lshr`, `lshl`, and `lushr`
    IAnd,
    LAnd,
    IOr,
    LOr,
    IXor,
    LXor,
    IInc(u16, i16), // covers `iinc` and `wide iinc`
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
    LCmp,
    FCmp(CompareMode), // covers `fcmpl` and `fcmpg`
    DCmp(CompareMode), // covers `dcmpl` and `dcmpg`
    GetStatic(FieldRefConstantIndex),
    PutStatic(FieldRefConstantIndex),
    GetField(FieldRefConstantIndex),
    PutField(FieldRefConstantIndex),
    Invoke(InvokeType, MethodRefConstantIndex),
    InvokeDynamic(InvokeDynamicConstantIndex),
    New(ClassConstantIndex),
    NewArray(BaseType),
    ANewArray(ClassConstantIndex),
    ArrayLength,
    CheckCast(ClassConstantIndex),
    InstanceOf(ClassConstantIndex),
    MonitorEnter,
    MonitorExit,
    MultiANewArray(ClassConstantIndex, u8),
}

impl Width for Instruction {
    fn width(&self) -> usize {
        use Instruction::*;

        match self {
            ILoad(0..=3) | LLoad(0..=3) | FLoad(0..=3) | DLoad(0..=3) | ALoad(0..=3)
            | IStore(0..=3) | LStore(0..=3) | FStore(0..=3) | DStore(0..=3) | AStore(0..=3) => 1,

            BiPush(_)
            | ILoad(4..=255)
            | LLoad(4..=255)
            | FLoad(4..=255)
            | DLoad(4..=255)
            | ALoad(4..=255)
            | IStore(4..=255)
            | LStore(4..=255)
            | FStore(4..=255)
            | DStore(4..=255)
            | AStore(4..=255)
            | Ldc(ConstantIndex(0..=255))
            | NewArray(_) => 2,

            SiPush(_)
            | Ldc(_)
            | Ldc2(_) // always wide, unlike `ldc` vs. `ldc_w`
            | IInc(0..=255, -128..=127)
            | GetStatic(_)
            | PutStatic(_)
            | GetField(_)
            | PutField(_)
            | Invoke(InvokeType::Special, _)
            | Invoke(InvokeType::Static, _)
            | Invoke(InvokeType::Virtual, _)
            | New(_)
            | ANewArray(_)
            | CheckCast(_)
            | InstanceOf(_) => 3,

            ILoad(_) | LLoad(_) | FLoad(_) | DLoad(_) | ALoad(_) | IStore(_) | LStore(_)
            | FStore(_) | DStore(_) | AStore(_) | MultiANewArray(_, _) => 4,

            Invoke(InvokeType::Interface(_), _) | InvokeDynamic(_) => 5,

            IInc(_, _) => 6,

            // Everything else is just the opcode
            _ => 1,
        }
    }
}

/// Number of stack slots an instruction consumes and produces
///
/// `long` and `double` values count for two slots, just like they do in `max_stack`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: usize,
    pub pushes: usize,
}

impl StackEffect {
    const fn new(pops: usize, pushes: usize) -> StackEffect {
        StackEffect { pops, pushes }
    }
}

impl Instruction {
    /// Stack slots consumed and produced
    ///
    /// Member and constant operands are resolved through the pool, since the effect of an
    /// `invoke*`, a field access, or an `ldc` depends on the descriptor it refers to.
    pub fn stack_effect(&self, pool: &ConstantPool) -> std::result::Result<StackEffect, Error> {
        use Instruction::*;

        let effect = match self {
            Nop | IInc(_, _) => StackEffect::new(0, 0),

            AConstNull | IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5
            | FConst0 | FConst1 | FConst2 | BiPush(_) | SiPush(_) | Ldc(_) | ILoad(_)
            | FLoad(_) | ALoad(_) | New(_) => StackEffect::new(0, 1),
            LConst0 | LConst1 | DConst0 | DConst1 | Ldc2(_) | LLoad(_) | DLoad(_) => {
                StackEffect::new(0, 2)
            }

            IALoad | FALoad | AALoad | BALoad | CALoad | SALoad => StackEffect::new(2, 1),
            LALoad | DALoad => StackEffect::new(2, 2),

            IStore(_) | FStore(_) | AStore(_) | Pop | MonitorEnter | MonitorExit => {
                StackEffect::new(1, 0)
            }
            LStore(_) | DStore(_) | Pop2 => StackEffect::new(2, 0),

            IAStore | FAStore | AAStore | BAStore | CAStore | SAStore => StackEffect::new(3, 0),
            LAStore | DAStore => StackEffect::new(4, 0),

            Dup => StackEffect::new(1, 2),
            DupX1 => StackEffect::new(2, 3),
            DupX2 => StackEffect::new(3, 4),
            Dup2 => StackEffect::new(2, 4),
            Dup2X1 => StackEffect::new(3, 5),
            Dup2X2 => StackEffect::new(4, 6),
            Swap => StackEffect::new(2, 2),

            IAdd | FAdd | ISub | FSub | IMul | FMul | IDiv | FDiv | IRem | FRem | ISh(_)
            | IAnd | IOr | IXor | FCmp(_) => StackEffect::new(2, 1),
            LAdd | DAdd | LSub | DSub | LMul | DMul | LDiv | DDiv | LRem | DRem | LAnd | LOr
            | LXor => StackEffect::new(4, 2),
            LSh(_) => StackEffect::new(3, 2),
            LCmp | DCmp(_) => StackEffect::new(4, 1),

            INeg | FNeg | I2F | F2I | I2B | I2C | I2S | ArrayLength | NewArray(_)
            | ANewArray(_) | CheckCast(_) | InstanceOf(_) => StackEffect::new(1, 1),
            LNeg | DNeg | L2D | D2L => StackEffect::new(2, 2),
            I2L | I2D | F2L | F2D => StackEffect::new(1, 2),
            L2I | L2F | D2I | D2F => StackEffect::new(2, 1),

            GetStatic(field) => StackEffect::new(0, field_width(pool, *field)?),
            PutStatic(field) => StackEffect::new(field_width(pool, *field)?, 0),
            GetField(field) => StackEffect::new(1, field_width(pool, *field)?),
            PutField(field) => StackEffect::new(1 + field_width(pool, *field)?, 0),

            Invoke(invoke_type, method) => {
                let descriptor = method_descriptor(pool.method_ref(*method)?.descriptor)?;
                let has_this = !matches!(invoke_type, InvokeType::Static);
                StackEffect::new(
                    descriptor.parameter_slots(has_this),
                    descriptor.return_type.map_or(0, |typ| typ.width()),
                )
            }
            InvokeDynamic(call_site) => {
                let (_, descriptor) = pool.invoke_dynamic(*call_site)?;
                let descriptor = method_descriptor(descriptor)?;
                StackEffect::new(
                    descriptor.parameter_slots(false),
                    descriptor.return_type.map_or(0, |typ| typ.width()),
                )
            }

            MultiANewArray(_, dimensions) => StackEffect::new(*dimensions as usize, 1),
        };
        Ok(effect)
    }

    /// Local variable slot read or written by the instruction, along with its width
    pub fn local_access(&self) -> Option<(u16, usize)> {
        use Instruction::*;

        match self {
            ILoad(idx) | FLoad(idx) | ALoad(idx) | IStore(idx) | FStore(idx) | AStore(idx)
            | IInc(idx, _) => Some((*idx, 1)),
            LLoad(idx) | DLoad(idx) | LStore(idx) | DStore(idx) => Some((*idx, 2)),
            _ => None,
        }
    }
}

fn field_width(
    pool: &ConstantPool,
    field: FieldRefConstantIndex,
) -> std::result::Result<usize, Error> {
    let descriptor = pool.field_ref(field)?.descriptor;
    FieldType::<BinaryName>::parse(descriptor)
        .map(|typ| typ.width())
        .map_err(|_| Error::BadDescriptor(descriptor.to_owned()))
}

fn method_descriptor(descriptor: &str) -> std::result::Result<MethodDescriptor<BinaryName>, Error> {
    MethodDescriptor::parse(descriptor).map_err(|_| Error::BadDescriptor(descriptor.to_owned()))
}

impl Serialize for Instruction {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        /* The load/store instructions follow the same pattern:
         *
         *   - short form (0-3) have special bytes
         *   - normal form (0-255) use `iload` plus a byte operand
         *   - wide form (255-65535) use `wide iload` plus two byte operands
         */
        fn serialize_load_or_store<W: WriteBytesExt>(
            idx: u16,
            short_form_start: u8,
            normal_form: u8,
            writer: &mut W,
        ) -> Result<()> {
            match u8::try_from(idx) {
                Ok(n @ 0..=3) => (short_form_start + n).serialize(writer),
                Ok(n) => {
                    normal_form.serialize(writer)?;
                    n.serialize(writer)
                }
                Err(_) => {
                    0xC4u8.serialize(writer)?;
                    normal_form.serialize(writer)?;
                    idx.serialize(writer)
                }
            }
        }

        fn with_operand<W: WriteBytesExt, A: Serialize>(
            opcode: u8,
            operand: &A,
            writer: &mut W,
        ) -> Result<()> {
            opcode.serialize(writer)?;
            operand.serialize(writer)
        }

        use Instruction::*;
        let simple_opcode: u8 = match self {
            BiPush(b) => return with_operand(0x10, b, writer),
            SiPush(s) => return with_operand(0x11, s, writer),
            Ldc(ConstantIndex(idx)) => {
                return match u8::try_from(*idx) {
                    Ok(b) => with_operand(0x12, &b, writer),
                    Err(_) => with_operand(0x13, idx, writer),
                }
            }
            Ldc2(idx) => return with_operand(0x14, idx, writer),
            ILoad(idx) => return serialize_load_or_store(*idx, 0x1A, 0x15, writer),
            LLoad(idx) => return serialize_load_or_store(*idx, 0x1E, 0x16, writer),
            FLoad(idx) => return serialize_load_or_store(*idx, 0x22, 0x17, writer),
            DLoad(idx) => return serialize_load_or_store(*idx, 0x26, 0x18, writer),
            ALoad(idx) => return serialize_load_or_store(*idx, 0x2A, 0x19, writer),
            IStore(idx) => return serialize_load_or_store(*idx, 0x3B, 0x36, writer),
            LStore(idx) => return serialize_load_or_store(*idx, 0x3F, 0x37, writer),
            FStore(idx) => return serialize_load_or_store(*idx, 0x43, 0x38, writer),
            DStore(idx) => return serialize_load_or_store(*idx, 0x47, 0x39, writer),
            AStore(idx) => return serialize_load_or_store(*idx, 0x4B, 0x3A, writer),
            IInc(idx, diff) => {
                return match (u8::try_from(*idx), i8::try_from(*diff)) {
                    (Ok(b), Ok(d)) => {
                        0x84u8.serialize(writer)?;
                        b.serialize(writer)?;
                        d.serialize(writer)
                    }
                    _ => {
                        0xC4u8.serialize(writer)?;
                        0x84u8.serialize(writer)?;
                        idx.serialize(writer)?;
                        diff.serialize(writer)
                    }
                }
            }
            GetStatic(idx) => return with_operand(0xB2, idx, writer),
            PutStatic(idx) => return with_operand(0xB3, idx, writer),
            GetField(idx) => return with_operand(0xB4, idx, writer),
            PutField(idx) => return with_operand(0xB5, idx, writer),
            Invoke(InvokeType::Virtual, idx) => return with_operand(0xB6, idx, writer),
            Invoke(InvokeType::Special, idx) => return with_operand(0xB7, idx, writer),
            Invoke(InvokeType::Static, idx) => return with_operand(0xB8, idx, writer),
            Invoke(InvokeType::Interface(count), idx) => {
                with_operand(0xB9, idx, writer)?;
                count.serialize(writer)?;
                return 0u8.serialize(writer);
            }
            InvokeDynamic(idx) => {
                with_operand(0xBA, idx, writer)?;
                return 0u16.serialize(writer);
            }
            New(idx) => return with_operand(0xBB, idx, writer),
            NewArray(base_type) => return with_operand(0xBC, &array_type_code(*base_type), writer),
            ANewArray(idx) => return with_operand(0xBD, idx, writer),
            CheckCast(idx) => return with_operand(0xC0, idx, writer),
            InstanceOf(idx) => return with_operand(0xC1, idx, writer),
            MultiANewArray(idx, dimensions) => {
                with_operand(0xC5, idx, writer)?;
                return dimensions.serialize(writer);
            }

            Nop => 0x00,
            AConstNull => 0x01,
            IConstM1 => 0x02,
            IConst0 => 0x03,
            IConst1 => 0x04,
            IConst2 => 0x05,
            IConst3 => 0x06,
            IConst4 => 0x07,
            IConst5 => 0x08,
            LConst0 => 0x09,
            LConst1 => 0x0A,
            FConst0 => 0x0B,
            FConst1 => 0x0C,
            FConst2 => 0x0D,
            DConst0 => 0x0E,
            DConst1 => 0x0F,
            IALoad => 0x2E,
            LALoad => 0x2F,
            FALoad => 0x30,
            DALoad => 0x31,
            AALoad => 0x32,
            BALoad => 0x33,
            CALoad => 0x34,
            SALoad => 0x35,
            IAStore => 0x4F,
            LAStore => 0x50,
            FAStore => 0x51,
            DAStore => 0x52,
            AAStore => 0x53,
            BAStore => 0x54,
            CAStore => 0x55,
            SAStore => 0x56,
            Pop => 0x57,
            Pop2 => 0x58,
            Dup => 0x59,
            DupX1 => 0x5A,
            DupX2 => 0x5B,
            Dup2 => 0x5C,
            Dup2X1 => 0x5D,
            Dup2X2 => 0x5E,
            Swap => 0x5F,
            IAdd => 0x60,
            LAdd => 0x61,
            FAdd => 0x62,
            DAdd => 0x63,
            ISub => 0x64,
            LSub => 0x65,
            FSub => 0x66,
            DSub => 0x67,
            IMul => 0x68,
            LMul => 0x69,
            FMul => 0x6A,
            DMul => 0x6B,
            IDiv => 0x6C,
            LDiv => 0x6D,
            FDiv => 0x6E,
            DDiv => 0x6F,
            IRem => 0x70,
            LRem => 0x71,
            FRem => 0x72,
            DRem => 0x73,
            INeg => 0x74,
            LNeg => 0x75,
            FNeg => 0x76,
            DNeg => 0x77,
            ISh(ShiftType::Left) => 0x78,
            LSh(ShiftType::Left) => 0x79,
            ISh(ShiftType::ArithmeticRight) => 0x7A,
            LSh(ShiftType::ArithmeticRight) => 0x7B,
            ISh(ShiftType::LogicalRight) => 0x7C,
            LSh(ShiftType::LogicalRight) => 0x7D,
            IAnd => 0x7E,
            LAnd => 0x7F,
            IOr => 0x80,
            LOr => 0x81,
            IXor => 0x82,
            LXor => 0x83,
            I2L => 0x85,
            I2F => 0x86,
            I2D => 0x87,
            L2I => 0x88,
            L2F => 0x89,
            L2D => 0x8A,
            F2I => 0x8B,
            F2L => 0x8C,
            F2D => 0x8D,
            D2I => 0x8E,
            D2L => 0x8F,
            D2F => 0x90,
            I2B => 0x91,
            I2C => 0x92,
            I2S => 0x93,
            LCmp => 0x94,
            FCmp(CompareMode::L) => 0x95,
            FCmp(CompareMode::G) => 0x96,
            DCmp(CompareMode::L) => 0x97,
            DCmp(CompareMode::G) => 0x98,
            ArrayLength => 0xBE,
            MonitorEnter => 0xC2,
            MonitorExit => 0xC3,
        };
        simple_opcode.serialize(writer)
    }
}

/// `atype` operand of `newarray`
pub fn array_type_code(base_type: BaseType) -> u8 {
    match base_type {
        BaseType::Boolean => 4,
        BaseType::Char => 5,
        BaseType::Float => 6,
        BaseType::Double => 7,
        BaseType::Byte => 8,
        BaseType::Short => 9,
        BaseType::Int => 10,
        BaseType::Long => 11,
    }
}

/// Inverse of [`array_type_code`]
pub fn array_type_from_code(code: u8) -> Option<BaseType> {
    Some(match code {
        4 => BaseType::Boolean,
        5 => BaseType::Char,
        6 => BaseType::Float,
        7 => BaseType::Double,
        8 => BaseType::Byte,
        9 => BaseType::Short,
        10 => BaseType::Int,
        11 => BaseType::Long,
        _ => return None,
    })
}

/// Branching JVM bytecode instruction
///
/// Jump targets are abstract (usually [`crate::jvm::code::Label`]). Whether a `goto` is encoded
/// as `goto_w` and how much padding a switch gets are decided only when the body is laid out, so
/// neither shows up here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BranchInstruction<Lbl> {
    If(OrdComparison, Lbl), // covers `ifeq`, `ifne`, `iflt`, `ifge`, `ifgt`, `ifle`
    IfICmp(OrdComparison, Lbl), // covers `if_icmpeq`, `if_icmpne`, `if_icmplt`, ... `if_icmple`
    IfACmp(EqComparison, Lbl), // covers `if_acmpeq`, `if_acmpne`
    IfNull(EqComparison, Lbl), // covers `ifnull`, `ifnonnull`
    Goto(Lbl),                 // covers `goto` and `goto_w`
    TableSwitch {
        /// Jump target if the argument is less than `low` or greater than
        /// `low + targets.len()`
        default: Lbl,

        /// Value associated with the first jump target
        low: i32,

        /// Jump targets
        targets: Vec<Lbl>,
    },
    LookupSwitch {
        /// Jump target if there is no corresponding key
        default: Lbl,

        /// Jump targets (sorted so that the keys are ascending)
        targets: Vec<(i32, Lbl)>,
    },
    IReturn,
    LReturn,
    FReturn,
    DReturn,
    AReturn,
    Return,
    AThrow,
}

impl<Lbl: Copy> BranchInstruction<Lbl> {
    /// Whether execution can continue with the next instruction
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            BranchInstruction::If(_, _)
                | BranchInstruction::IfICmp(_, _)
                | BranchInstruction::IfACmp(_, _)
                | BranchInstruction::IfNull(_, _)
        )
    }

    /// Targets this instruction may jump to (not counting fall through)
    pub fn jump_targets(&self) -> Vec<Lbl> {
        match self {
            BranchInstruction::If(_, lbl)
            | BranchInstruction::IfICmp(_, lbl)
            | BranchInstruction::IfACmp(_, lbl)
            | BranchInstruction::IfNull(_, lbl)
            | BranchInstruction::Goto(lbl) => vec![*lbl],
            BranchInstruction::TableSwitch {
                default, targets, ..
            } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            BranchInstruction::LookupSwitch { default, targets } => {
                let mut all = vec![*default];
                all.extend(targets.iter().map(|(_, target)| *target));
                all
            }
            BranchInstruction::IReturn
            | BranchInstruction::LReturn
            | BranchInstruction::FReturn
            | BranchInstruction::DReturn
            | BranchInstruction::AReturn
            | BranchInstruction::Return
            | BranchInstruction::AThrow => vec![],
        }
    }

    /// Stack slots consumed
    pub fn stack_pops(&self) -> usize {
        match self {
            BranchInstruction::If(_, _)
            | BranchInstruction::IfNull(_, _)
            | BranchInstruction::TableSwitch { .. }
            | BranchInstruction::LookupSwitch { .. }
            | BranchInstruction::IReturn
            | BranchInstruction::FReturn
            | BranchInstruction::AReturn
            | BranchInstruction::AThrow => 1,
            BranchInstruction::IfICmp(_, _)
            | BranchInstruction::IfACmp(_, _)
            | BranchInstruction::LReturn
            | BranchInstruction::DReturn => 2,
            BranchInstruction::Goto(_) | BranchInstruction::Return => 0,
        }
    }

    pub fn map_labels<Lbl2, E>(
        &self,
        mut map_label: impl FnMut(&Lbl) -> std::result::Result<Lbl2, E>,
    ) -> std::result::Result<BranchInstruction<Lbl2>, E> {
        use BranchInstruction::*;

        Ok(match self {
            If(op, lbl) => If(*op, map_label(lbl)?),
            IfICmp(op, lbl) => IfICmp(*op, map_label(lbl)?),
            IfACmp(op, lbl) => IfACmp(*op, map_label(lbl)?),
            IfNull(op, lbl) => IfNull(*op, map_label(lbl)?),
            Goto(lbl) => Goto(map_label(lbl)?),
            TableSwitch {
                default,
                low,
                targets,
            } => TableSwitch {
                default: map_label(default)?,
                low: *low,
                targets: targets
                    .iter()
                    .map(&mut map_label)
                    .collect::<std::result::Result<_, E>>()?,
            },
            LookupSwitch { default, targets } => LookupSwitch {
                default: map_label(default)?,
                targets: targets
                    .iter()
                    .map(|(key, lbl)| Ok((*key, map_label(lbl)?)))
                    .collect::<std::result::Result<_, E>>()?,
            },
            IReturn => IReturn,
            LReturn => LReturn,
            FReturn => FReturn,
            DReturn => DReturn,
            AReturn => AReturn,
            Return => Return,
            AThrow => AThrow,
        })
    }

    /// Return instruction matching a method return type
    pub fn return_for<C>(return_type: &Option<FieldType<C>>) -> BranchInstruction<Lbl> {
        match return_type {
            None => BranchInstruction::Return,
            Some(FieldType::Ref(_)) => BranchInstruction::AReturn,
            Some(FieldType::Base(BaseType::Long)) => BranchInstruction::LReturn,
            Some(FieldType::Base(BaseType::Float)) => BranchInstruction::FReturn,
            Some(FieldType::Base(BaseType::Double)) => BranchInstruction::DReturn,
            Some(FieldType::Base(_)) => BranchInstruction::IReturn,
        }
    }
}

/// Possible bit shifts
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ShiftType {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// Comparison modes for floating point
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CompareMode {
    /// -1 on NaN
    L,

    /// 1 on NaN
    G,
}

/// Binary comparison operators available for `int` branches
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum OrdComparison {
    EQ,
    GE,
    GT,
    LE,
    LT,
    NE,
}

impl OrdComparison {
    /// Evaluate the comparison on two ints
    pub fn holds(self, lhs: i32, rhs: i32) -> bool {
        match self {
            OrdComparison::EQ => lhs == rhs,
            OrdComparison::GE => lhs >= rhs,
            OrdComparison::GT => lhs > rhs,
            OrdComparison::LE => lhs <= rhs,
            OrdComparison::LT => lhs < rhs,
            OrdComparison::NE => lhs != rhs,
        }
    }
}

impl Not for OrdComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            OrdComparison::EQ => OrdComparison::NE,
            OrdComparison::GE => OrdComparison::LT,
            OrdComparison::GT => OrdComparison::LE,
            OrdComparison::LE => OrdComparison::GT,
            OrdComparison::LT => OrdComparison::GE,
            OrdComparison::NE => OrdComparison::EQ,
        }
    }
}

/// Equality/inequality comparison operators
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum EqComparison {
    EQ,
    NE,
}

impl Not for EqComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            EqComparison::EQ => EqComparison::NE,
            EqComparison::NE => EqComparison::EQ,
        }
    }
}

/// Type of method to invoke
///
/// Note: `InvokeDynamic` is kept separate because the constant argument it expects is not to a
/// `Constant::MethodRef`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface(u8), // `count` is of total arguments, where `long`/`double` count for 2
}

#[cfg(test)]
mod test {
    use super::*;

    fn bytes(insn: &Instruction) -> Vec<u8> {
        let mut out = vec![];
        insn.serialize(&mut out).unwrap();
        assert_eq!(out.len(), insn.width(), "width of {:?}", insn);
        out
    }

    #[test]
    fn load_store_forms() {
        assert_eq!(bytes(&Instruction::ALoad(0)), vec![0x2A]);
        assert_eq!(bytes(&Instruction::ILoad(7)), vec![0x15, 7]);
        assert_eq!(bytes(&Instruction::DStore(300)), vec![0xC4, 0x39, 1, 44]);
        assert_eq!(bytes(&Instruction::IInc(2, -1)), vec![0x84, 2, 0xFF]);
        assert_eq!(
            bytes(&Instruction::IInc(2, 1000)),
            vec![0xC4, 0x84, 0, 2, 3, 232]
        );
    }

    #[test]
    fn constant_forms() {
        assert_eq!(bytes(&Instruction::Ldc(ConstantIndex(3))), vec![0x12, 3]);
        assert_eq!(
            bytes(&Instruction::Ldc(ConstantIndex(256))),
            vec![0x13, 1, 0]
        );
        assert_eq!(bytes(&Instruction::SiPush(-2)), vec![0x11, 0xFF, 0xFE]);
        assert_eq!(bytes(&Instruction::NewArray(BaseType::Int)), vec![0xBC, 10]);
        assert_eq!(bytes(&Instruction::MonitorExit), vec![0xC3]);
    }

    #[test]
    fn stack_effects() {
        let mut pool = ConstantPool::new();
        let method = pool
            .get_method_ref("a/B", "f", "(JLjava/lang/String;)D", false)
            .unwrap();
        let field = pool.get_field_ref("a/B", "x", "J").unwrap();

        let effect = |insn: Instruction| insn.stack_effect(&pool).unwrap();
        assert_eq!(
            effect(Instruction::Invoke(InvokeType::Virtual, method)),
            StackEffect::new(4, 2)
        );
        assert_eq!(
            effect(Instruction::Invoke(InvokeType::Static, method)),
            StackEffect::new(3, 2)
        );
        assert_eq!(effect(Instruction::PutField(field)), StackEffect::new(3, 0));
        assert_eq!(effect(Instruction::Dup2X1), StackEffect::new(3, 5));
        assert_eq!(effect(Instruction::LSh(ShiftType::Left)), StackEffect::new(3, 2));
    }

    #[test]
    fn branch_targets() {
        let switch = BranchInstruction::LookupSwitch {
            default: 0,
            targets: vec![(1, 5), (9, 7)],
        };
        assert_eq!(switch.jump_targets(), vec![0, 5, 7]);
        assert!(!switch.falls_through());
        assert!(BranchInstruction::If(OrdComparison::EQ, 3).falls_through());
        assert_eq!(!OrdComparison::LT, OrdComparison::GE);

        let shifted: std::result::Result<_, ()> = switch.map_labels(|lbl| Ok(lbl + 1));
        assert_eq!(shifted.unwrap().jump_targets(), vec![1, 6, 8]);
    }
}
