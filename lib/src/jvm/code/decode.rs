use super::*;
use crate::jvm::class_file::{
    ClassConstantIndex, ClassFileVerificationType, Code, ConstantIndex, ConstantPool,
    FieldRefConstantIndex, InvokeDynamicConstantIndex, LineNumberTable, LocalVariable,
    LocalVariableTable, LocalVariableTypeTable, MethodRefConstantIndex, StackMapFrame,
    StackMapTable,
};
use crate::jvm::verifier::{EditFrame, FrameType, VerificationType};
use crate::jvm::Error;
use byteorder::{BigEndian, ByteOrder};
use std::collections::{BTreeMap, BTreeSet};

/// Instruction with jump targets still as absolute byte offsets
enum Decoded {
    Insn(Instruction),
    Branch(BranchInstruction<usize>),
}

impl MethodBody {
    /// Decode a `Code` attribute into a labelled method body
    ///
    /// Labels get created only for offsets that something refers to (jump targets, exception
    /// ranges, stack map frames, `new` instructions referenced from frames, and debug tables).
    /// Sub-attributes of `Code` other than the stack map and debug tables are dropped.
    pub fn decode(code: &Code, pool: &ConstantPool, shape: MethodShape) -> Result<MethodBody, Error> {
        let bytes = &code.code_array.0;
        let code_len = bytes.len();

        // Linear pass over the instructions
        let mut decoded: Vec<(usize, Decoded)> = vec![];
        let mut offset = 0;
        while offset < code_len {
            let (insn, next) = decode_instruction(bytes, offset)?;
            decoded.push((offset, insn));
            offset = next;
        }
        let boundaries: BTreeSet<usize> = decoded
            .iter()
            .map(|(offset, _)| *offset)
            .chain(std::iter::once(code_len))
            .collect();

        // Everything that refers to an offset
        let mut referenced: BTreeSet<usize> = BTreeSet::new();
        for (_, insn) in &decoded {
            if let Decoded::Branch(branch) = insn {
                referenced.extend(branch.jump_targets());
            }
        }
        for entry in &code.exception_table {
            referenced.insert(entry.start_pc.0 as usize);
            referenced.insert(entry.end_pc.0 as usize);
            referenced.insert(entry.handler_pc.0 as usize);
        }

        let mut line_numbers = LineNumberTable(vec![]);
        let mut local_variables = LocalVariableTable(vec![]);
        let mut local_variable_types = LocalVariableTypeTable(vec![]);
        let mut stack_map_table = StackMapTable(vec![]);
        for attribute in &code.attributes {
            match pool.utf8(attribute.name_index)? {
                "StackMapTable" => stack_map_table = attribute.parse()?,
                "LineNumberTable" => line_numbers.0.extend(attribute.parse::<LineNumberTable>()?.0),
                "LocalVariableTable" => local_variables
                    .0
                    .extend(attribute.parse::<LocalVariableTable>()?.0),
                "LocalVariableTypeTable" => local_variable_types
                    .0
                    .extend(attribute.parse::<LocalVariableTypeTable>()?.0),
                other => log::debug!("Dropping `{}` attribute from code", other),
            }
        }

        let mut stack_map_frames: Vec<(usize, &StackMapFrame)> = vec![];
        let mut frame_offset: Option<usize> = None;
        for frame in &stack_map_table.0 {
            let offset = match frame_offset {
                None => frame.offset_delta() as usize,
                Some(previous) => previous + frame.offset_delta() as usize + 1,
            };
            frame_offset = Some(offset);
            stack_map_frames.push((offset, frame));
            referenced.insert(offset);
            for typ in frame_types(frame) {
                if let VerificationType::Uninitialized(new_offset) = typ {
                    referenced.insert(*new_offset as usize);
                }
            }
        }
        for line in &line_numbers.0 {
            referenced.insert(line.start_pc.0 as usize);
        }
        for local in local_variables.0.iter().chain(&local_variable_types.0) {
            referenced.insert(local.start_pc.0 as usize);
            referenced.insert(local.start_pc.0 as usize + local.length as usize);
        }

        // Allocate labels for the referenced offsets
        let mut labels = LabelAllocator::new();
        let mut offset_labels: BTreeMap<usize, Label> = BTreeMap::new();
        for offset in referenced {
            if !boundaries.contains(&offset) {
                return Err(Error::MalformedCode {
                    offset,
                    message: String::from("Reference to an offset that is not an instruction"),
                });
            }
            offset_labels.insert(offset, labels.fresh());
        }
        let label_of = |offset: usize| -> Result<Label, Error> {
            offset_labels
                .get(&offset)
                .copied()
                .ok_or_else(|| Error::MalformedCode {
                    offset,
                    message: String::from("Missing label"),
                })
        };

        // Instructions, interleaved with labels
        let mut nodes = vec![];
        for (offset, insn) in decoded {
            if let Some(label) = offset_labels.get(&offset) {
                nodes.push(Node::Label(*label));
            }
            nodes.push(match insn {
                Decoded::Insn(insn) => Node::Insn(insn),
                Decoded::Branch(branch) => Node::Branch(branch.map_labels(|o| label_of(*o))?),
            });
        }
        if let Some(label) = offset_labels.get(&code_len) {
            nodes.push(Node::Label(*label));
        }

        let mut handlers = vec![];
        for entry in &code.exception_table {
            let catch_type = match entry.catch_type {
                None => None,
                Some(class) => Some(pool.class_name(class)?.to_owned()),
            };
            if entry.start_pc.0 >= entry.end_pc.0 {
                return Err(Error::MalformedCode {
                    offset: entry.start_pc.0 as usize,
                    message: String::from("Empty or inverted exception range"),
                });
            }
            handlers.push(ExceptionHandler {
                start: label_of(entry.start_pc.0 as usize)?,
                end: label_of(entry.end_pc.0 as usize)?,
                handler: label_of(entry.handler_pc.0 as usize)?,
                catch_type,
            });
        }

        // Frames are stored uncompressed, with class names instead of constant indices
        let convert = |typ: &ClassFileVerificationType| -> Result<FrameType, String> {
            typ.try_map(
                |class: &ClassConstantIndex| {
                    pool.class_name(*class)
                        .map(str::to_owned)
                        .map_err(|err| format!("{:?}", err))
                },
                |offset: &u16| {
                    offset_labels
                        .get(&(*offset as usize))
                        .copied()
                        .ok_or_else(|| format!("No instruction at offset {}", offset))
                },
            )
        };
        let mut frames = BTreeMap::new();
        let mut previous: EditFrame = shape.entry_frame();
        for (offset, frame) in stack_map_frames {
            let next = previous
                .apply_stack_map_frame(frame, &convert)
                .map_err(|message| Error::MalformedCode { offset, message })?;
            frames.insert(label_of(offset)?, next.clone());
            previous = next;
        }

        let line_numbers = line_numbers
            .0
            .iter()
            .map(|line| {
                Ok(LineNumberEntry {
                    start: label_of(line.start_pc.0 as usize)?,
                    line: line.line_number,
                })
            })
            .collect::<Result<_, Error>>()?;
        let decode_locals = |locals: &[LocalVariable]| -> Result<Vec<LocalVariableEntry>, Error> {
            locals
                .iter()
                .map(|local| {
                    let start = local.start_pc.0 as usize;
                    Ok(LocalVariableEntry {
                        start: label_of(start)?,
                        end: label_of(start + local.length as usize)?,
                        name: pool.utf8(local.name)?.to_owned(),
                        descriptor: pool.utf8(local.descriptor)?.to_owned(),
                        index: local.index,
                    })
                })
                .collect()
        };
        let local_variables = decode_locals(&local_variables.0)?;
        let local_variable_types = decode_locals(&local_variable_types.0)?;

        Ok(MethodBody {
            shape,
            envelope: StackDepthEnvelope {
                max_stack: code.max_stack,
                max_locals: code.max_locals,
            },
            nodes,
            handlers,
            frames,
            line_numbers,
            local_variables,
            local_variable_types,
            labels,
        })
    }
}

fn frame_types(frame: &StackMapFrame) -> Vec<&ClassFileVerificationType> {
    match frame {
        StackMapFrame::SameLocalsNoStack { .. } | StackMapFrame::ChopLocalsNoStack { .. } => {
            vec![]
        }
        StackMapFrame::SameLocalsOneStack { stack, .. } => vec![stack],
        StackMapFrame::AppendLocalsNoStack { locals, .. } => locals.iter().collect(),
        StackMapFrame::Full { locals, stack, .. } => locals.iter().chain(stack).collect(),
    }
}

/// Cursor over the bytes of one instruction
struct InsnReader<'a> {
    bytes: &'a [u8],
    start: usize,
    position: usize,
}

impl<'a> InsnReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.position + len;
        let taken = self.bytes.get(self.position..end).ok_or(Error::MalformedCode {
            offset: self.start,
            message: String::from("Truncated instruction"),
        })?;
        self.position = end;
        Ok(taken)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, Error> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn i16(&mut self) -> Result<i16, Error> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn constant(&mut self) -> Result<ConstantIndex, Error> {
        self.u16().map(ConstantIndex)
    }

    /// Absolute target of a relative jump
    fn target(&self, relative: i32) -> Result<usize, Error> {
        let target = self.start as i64 + relative as i64;
        if target < 0 || target >= self.bytes.len() as i64 {
            return Err(Error::MalformedCode {
                offset: self.start,
                message: format!("Jump target {} is out of bounds", target),
            });
        }
        Ok(target as usize)
    }

    fn target16(&mut self) -> Result<usize, Error> {
        let relative = self.i16()?;
        self.target(relative as i32)
    }

    fn target32(&mut self) -> Result<usize, Error> {
        let relative = self.i32()?;
        self.target(relative)
    }
}

/// Decode the instruction at `offset`, returning it along with the offset of the next one
fn decode_instruction(bytes: &[u8], offset: usize) -> Result<(Decoded, usize), Error> {
    use BranchInstruction as B;
    use Instruction::*;

    let mut reader = InsnReader {
        bytes,
        start: offset,
        position: offset,
    };
    let opcode = reader.u8()?;
    let branch = |branch: BranchInstruction<usize>| Decoded::Branch(branch);

    let decoded = match opcode {
        0x00 => Decoded::Insn(Nop),
        0x01 => Decoded::Insn(AConstNull),
        0x02 => Decoded::Insn(IConstM1),
        0x03 => Decoded::Insn(IConst0),
        0x04 => Decoded::Insn(IConst1),
        0x05 => Decoded::Insn(IConst2),
        0x06 => Decoded::Insn(IConst3),
        0x07 => Decoded::Insn(IConst4),
        0x08 => Decoded::Insn(IConst5),
        0x09 => Decoded::Insn(LConst0),
        0x0A => Decoded::Insn(LConst1),
        0x0B => Decoded::Insn(FConst0),
        0x0C => Decoded::Insn(FConst1),
        0x0D => Decoded::Insn(FConst2),
        0x0E => Decoded::Insn(DConst0),
        0x0F => Decoded::Insn(DConst1),
        0x10 => Decoded::Insn(BiPush(reader.i8()?)),
        0x11 => Decoded::Insn(SiPush(reader.i16()?)),
        0x12 => Decoded::Insn(Ldc(ConstantIndex(reader.u8()? as u16))),
        0x13 => Decoded::Insn(Ldc(reader.constant()?)),
        0x14 => Decoded::Insn(Ldc2(reader.constant()?)),
        0x15..=0x19 => {
            let index = reader.u8()? as u16;
            Decoded::Insn(load_or_store(opcode, index))
        }
        0x1A..=0x2D => {
            let kind = (opcode - 0x1A) / 4;
            let index = ((opcode - 0x1A) % 4) as u16;
            Decoded::Insn(load_or_store(0x15 + kind, index))
        }
        0x2E => Decoded::Insn(IALoad),
        0x2F => Decoded::Insn(LALoad),
        0x30 => Decoded::Insn(FALoad),
        0x31 => Decoded::Insn(DALoad),
        0x32 => Decoded::Insn(AALoad),
        0x33 => Decoded::Insn(BALoad),
        0x34 => Decoded::Insn(CALoad),
        0x35 => Decoded::Insn(SALoad),
        0x36..=0x3A => {
            let index = reader.u8()? as u16;
            Decoded::Insn(load_or_store(opcode, index))
        }
        0x3B..=0x4E => {
            let kind = (opcode - 0x3B) / 4;
            let index = ((opcode - 0x3B) % 4) as u16;
            Decoded::Insn(load_or_store(0x36 + kind, index))
        }
        0x4F => Decoded::Insn(IAStore),
        0x50 => Decoded::Insn(LAStore),
        0x51 => Decoded::Insn(FAStore),
        0x52 => Decoded::Insn(DAStore),
        0x53 => Decoded::Insn(AAStore),
        0x54 => Decoded::Insn(BAStore),
        0x55 => Decoded::Insn(CAStore),
        0x56 => Decoded::Insn(SAStore),
        0x57 => Decoded::Insn(Pop),
        0x58 => Decoded::Insn(Pop2),
        0x59 => Decoded::Insn(Dup),
        0x5A => Decoded::Insn(DupX1),
        0x5B => Decoded::Insn(DupX2),
        0x5C => Decoded::Insn(Dup2),
        0x5D => Decoded::Insn(Dup2X1),
        0x5E => Decoded::Insn(Dup2X2),
        0x5F => Decoded::Insn(Swap),
        0x60 => Decoded::Insn(IAdd),
        0x61 => Decoded::Insn(LAdd),
        0x62 => Decoded::Insn(FAdd),
        0x63 => Decoded::Insn(DAdd),
        0x64 => Decoded::Insn(ISub),
        0x65 => Decoded::Insn(LSub),
        0x66 => Decoded::Insn(FSub),
        0x67 => Decoded::Insn(DSub),
        0x68 => Decoded::Insn(IMul),
        0x69 => Decoded::Insn(LMul),
        0x6A => Decoded::Insn(FMul),
        0x6B => Decoded::Insn(DMul),
        0x6C => Decoded::Insn(IDiv),
        0x6D => Decoded::Insn(LDiv),
        0x6E => Decoded::Insn(FDiv),
        0x6F => Decoded::Insn(DDiv),
        0x70 => Decoded::Insn(IRem),
        0x71 => Decoded::Insn(LRem),
        0x72 => Decoded::Insn(FRem),
        0x73 => Decoded::Insn(DRem),
        0x74 => Decoded::Insn(INeg),
        0x75 => Decoded::Insn(LNeg),
        0x76 => Decoded::Insn(FNeg),
        0x77 => Decoded::Insn(DNeg),
        0x78 => Decoded::Insn(ISh(ShiftType::Left)),
        0x79 => Decoded::Insn(LSh(ShiftType::Left)),
        0x7A => Decoded::Insn(ISh(ShiftType::ArithmeticRight)),
        0x7B => Decoded::Insn(LSh(ShiftType::ArithmeticRight)),
        0x7C => Decoded::Insn(ISh(ShiftType::LogicalRight)),
        0x7D => Decoded::Insn(LSh(ShiftType::LogicalRight)),
        0x7E => Decoded::Insn(IAnd),
        0x7F => Decoded::Insn(LAnd),
        0x80 => Decoded::Insn(IOr),
        0x81 => Decoded::Insn(LOr),
        0x82 => Decoded::Insn(IXor),
        0x83 => Decoded::Insn(LXor),
        0x84 => {
            let index = reader.u8()? as u16;
            let delta = reader.i8()? as i16;
            Decoded::Insn(IInc(index, delta))
        }
        0x85 => Decoded::Insn(I2L),
        0x86 => Decoded::Insn(I2F),
        0x87 => Decoded::Insn(I2D),
        0x88 => Decoded::Insn(L2I),
        0x89 => Decoded::Insn(L2F),
        0x8A => Decoded::Insn(L2D),
        0x8B => Decoded::Insn(F2I),
        0x8C => Decoded::Insn(F2L),
        0x8D => Decoded::Insn(F2D),
        0x8E => Decoded::Insn(D2I),
        0x8F => Decoded::Insn(D2L),
        0x90 => Decoded::Insn(D2F),
        0x91 => Decoded::Insn(I2B),
        0x92 => Decoded::Insn(I2C),
        0x93 => Decoded::Insn(I2S),
        0x94 => Decoded::Insn(LCmp),
        0x95 => Decoded::Insn(FCmp(CompareMode::L)),
        0x96 => Decoded::Insn(FCmp(CompareMode::G)),
        0x97 => Decoded::Insn(DCmp(CompareMode::L)),
        0x98 => Decoded::Insn(DCmp(CompareMode::G)),
        0x99..=0x9E => {
            let comparison = ord_comparison(opcode - 0x99);
            branch(B::If(comparison, reader.target16()?))
        }
        0x9F..=0xA4 => {
            let comparison = ord_comparison(opcode - 0x9F);
            branch(B::IfICmp(comparison, reader.target16()?))
        }
        0xA5 => branch(B::IfACmp(EqComparison::EQ, reader.target16()?)),
        0xA6 => branch(B::IfACmp(EqComparison::NE, reader.target16()?)),
        0xA7 => branch(B::Goto(reader.target16()?)),
        0xA8 | 0xA9 => return Err(Error::UnsupportedInstruction { opcode, offset }),
        0xAA => {
            reader.take(padding(offset))?;
            let default = reader.target32()?;
            let low = reader.i32()?;
            let high = reader.i32()?;
            if high < low {
                return Err(Error::MalformedCode {
                    offset,
                    message: format!("tableswitch with low {} above high {}", low, high),
                });
            }
            let mut targets = vec![];
            for _ in low..=high {
                targets.push(reader.target32()?);
            }
            branch(B::TableSwitch {
                default,
                low,
                targets,
            })
        }
        0xAB => {
            reader.take(padding(offset))?;
            let default = reader.target32()?;
            let pairs = reader.i32()?;
            if pairs < 0 {
                return Err(Error::MalformedCode {
                    offset,
                    message: format!("lookupswitch with {} pairs", pairs),
                });
            }
            let mut targets = vec![];
            for _ in 0..pairs {
                let key = reader.i32()?;
                targets.push((key, reader.target32()?));
            }
            branch(B::LookupSwitch { default, targets })
        }
        0xAC => branch(B::IReturn),
        0xAD => branch(B::LReturn),
        0xAE => branch(B::FReturn),
        0xAF => branch(B::DReturn),
        0xB0 => branch(B::AReturn),
        0xB1 => branch(B::Return),
        0xB2 => Decoded::Insn(GetStatic(FieldRefConstantIndex(reader.constant()?))),
        0xB3 => Decoded::Insn(PutStatic(FieldRefConstantIndex(reader.constant()?))),
        0xB4 => Decoded::Insn(GetField(FieldRefConstantIndex(reader.constant()?))),
        0xB5 => Decoded::Insn(PutField(FieldRefConstantIndex(reader.constant()?))),
        0xB6 => Decoded::Insn(Invoke(
            InvokeType::Virtual,
            MethodRefConstantIndex(reader.constant()?),
        )),
        0xB7 => Decoded::Insn(Invoke(
            InvokeType::Special,
            MethodRefConstantIndex(reader.constant()?),
        )),
        0xB8 => Decoded::Insn(Invoke(
            InvokeType::Static,
            MethodRefConstantIndex(reader.constant()?),
        )),
        0xB9 => {
            let method = MethodRefConstantIndex(reader.constant()?);
            let count = reader.u8()?;
            reader.u8()?;
            Decoded::Insn(Invoke(InvokeType::Interface(count), method))
        }
        0xBA => {
            let call_site = InvokeDynamicConstantIndex(reader.constant()?);
            reader.u16()?;
            Decoded::Insn(InvokeDynamic(call_site))
        }
        0xBB => Decoded::Insn(New(ClassConstantIndex(reader.constant()?))),
        0xBC => {
            let code = reader.u8()?;
            let base_type = array_type_from_code(code).ok_or(Error::MalformedCode {
                offset,
                message: format!("Bad newarray type {}", code),
            })?;
            Decoded::Insn(NewArray(base_type))
        }
        0xBD => Decoded::Insn(ANewArray(ClassConstantIndex(reader.constant()?))),
        0xBE => Decoded::Insn(ArrayLength),
        0xBF => branch(B::AThrow),
        0xC0 => Decoded::Insn(CheckCast(ClassConstantIndex(reader.constant()?))),
        0xC1 => Decoded::Insn(InstanceOf(ClassConstantIndex(reader.constant()?))),
        0xC2 => Decoded::Insn(MonitorEnter),
        0xC3 => Decoded::Insn(MonitorExit),
        0xC4 => {
            let modified = reader.u8()?;
            match modified {
                0x15..=0x19 | 0x36..=0x3A => {
                    let index = reader.u16()?;
                    Decoded::Insn(load_or_store(modified, index))
                }
                0x84 => {
                    let index = reader.u16()?;
                    let delta = reader.i16()?;
                    Decoded::Insn(IInc(index, delta))
                }
                0xA9 => return Err(Error::UnsupportedInstruction { opcode: modified, offset }),
                _ => {
                    return Err(Error::MalformedCode {
                        offset,
                        message: format!("`wide` cannot modify opcode {:#x}", modified),
                    })
                }
            }
        }
        0xC5 => {
            let class = ClassConstantIndex(reader.constant()?);
            let dimensions = reader.u8()?;
            Decoded::Insn(MultiANewArray(class, dimensions))
        }
        0xC6 => branch(B::IfNull(EqComparison::EQ, reader.target16()?)),
        0xC7 => branch(B::IfNull(EqComparison::NE, reader.target16()?)),
        0xC8 => branch(B::Goto(reader.target32()?)),
        _ => return Err(Error::UnsupportedInstruction { opcode, offset }),
    };
    Ok((decoded, reader.position))
}

/// Bytes of padding after a switch opcode at `offset`
pub fn padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Load/store instruction from its long-form opcode (`iload` through `astore`)
fn load_or_store(opcode: u8, index: u16) -> Instruction {
    use Instruction::*;
    match opcode {
        0x15 => ILoad(index),
        0x16 => LLoad(index),
        0x17 => FLoad(index),
        0x18 => DLoad(index),
        0x19 => ALoad(index),
        0x36 => IStore(index),
        0x37 => LStore(index),
        0x38 => FStore(index),
        0x39 => DStore(index),
        _ => AStore(index),
    }
}

/// Comparison encoded in the opcode offset from `ifeq` or `if_icmpeq`
fn ord_comparison(relative_opcode: u8) -> OrdComparison {
    match relative_opcode {
        0 => OrdComparison::EQ,
        1 => OrdComparison::NE,
        2 => OrdComparison::LT,
        3 => OrdComparison::GE,
        4 => OrdComparison::GT,
        _ => OrdComparison::LE,
    }
}
