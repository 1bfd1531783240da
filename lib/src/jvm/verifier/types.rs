use crate::jvm::binary_format::{Deserialize, Serialize};
use crate::jvm::class_file::ClassConstantIndex;
use crate::jvm::code::Label;
use crate::jvm::{BaseType, BinaryName, FieldType, RefType};
use crate::util::Width;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Error as IoError, ErrorKind};

/// These types are from [this hierarchy][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType<Cls, U> {
    /// Unusable value (eg. an unassigned local, or the second slot of a `long` local)
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,

    /// In the constructor, the `this` parameter starts with this type then turns into an object
    /// type after `<init>` is called
    UninitializedThis,

    /// Object type
    ///
    /// While editing, this is the name of the class as it would appear in a `CONSTANT_Class`
    /// (binary names for classes, descriptors for arrays).
    Object(Cls),

    /// State of an object after `new` has been called but `<init>` has not been called
    ///
    /// This refers to the position of the `new` instruction: a label while editing, and an
    /// offset into the code array in the class file.
    Uninitialized(U),
}

/// Verification type as tracked while editing method bodies
pub type FrameType = VerificationType<String, Label>;

impl<Cls, U> VerificationType<Cls, U> {
    /// Is this type is a reference type?
    pub fn is_reference(&self) -> bool {
        match self {
            VerificationType::Top
            | VerificationType::Integer
            | VerificationType::Float
            | VerificationType::Double
            | VerificationType::Long => false,

            VerificationType::Null
            | VerificationType::UninitializedThis
            | VerificationType::Object(_)
            | VerificationType::Uninitialized(_) => true,
        }
    }

    pub fn try_map<C2, U2, E>(
        &self,
        map_class: impl FnOnce(&Cls) -> Result<C2, E>,
        map_uninitialized: impl FnOnce(&U) -> Result<U2, E>,
    ) -> Result<VerificationType<C2, U2>, E> {
        Ok(match self {
            VerificationType::Top => VerificationType::Top,
            VerificationType::Integer => VerificationType::Integer,
            VerificationType::Float => VerificationType::Float,
            VerificationType::Long => VerificationType::Long,
            VerificationType::Double => VerificationType::Double,
            VerificationType::Null => VerificationType::Null,
            VerificationType::UninitializedThis => VerificationType::UninitializedThis,
            VerificationType::Object(cls) => VerificationType::Object(map_class(cls)?),
            VerificationType::Uninitialized(uninit) => {
                VerificationType::Uninitialized(map_uninitialized(uninit)?)
            }
        })
    }
}

impl<Cls, U> Width for VerificationType<Cls, U> {
    fn width(&self) -> usize {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }
}

impl From<&FieldType<BinaryName>> for FrameType {
    fn from(field_type: &FieldType<BinaryName>) -> Self {
        match field_type {
            FieldType::Base(BaseType::Int)
            | FieldType::Base(BaseType::Char)
            | FieldType::Base(BaseType::Short)
            | FieldType::Base(BaseType::Byte)
            | FieldType::Base(BaseType::Boolean) => VerificationType::Integer,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Ref(ref_type) => VerificationType::Object(ref_type.class_name()),
        }
    }
}

impl FrameType {
    /// Object type for a class name
    pub fn object(class_name: impl Into<String>) -> FrameType {
        VerificationType::Object(class_name.into())
    }

    /// Check if one verification type is assignable to another
    ///
    /// There is no class hierarchy to consult, so two distinct (non-array) classes are assumed to
    /// be compatible. Primitive and array shapes are always checked.
    pub fn is_assignable(sub_type: &FrameType, super_type: &FrameType) -> bool {
        match (sub_type, super_type) {
            (_, VerificationType::Top) => true,
            (VerificationType::Null, VerificationType::Object(_)) => true,
            (VerificationType::Object(sub), VerificationType::Object(sup)) => {
                is_class_assignable(sub, sup)
            }
            (t1, t2) => t1 == t2,
        }
    }

    /// Least upper bound used when two control flow paths meet
    ///
    /// Anything that can't be unified turns into `Top` (which makes the value unusable after the
    /// merge, rather than guessing at a common superclass).
    pub fn meet(t1: &FrameType, t2: &FrameType) -> FrameType {
        match (t1, t2) {
            (VerificationType::Null, obj @ VerificationType::Object(_))
            | (obj @ VerificationType::Object(_), VerificationType::Null) => obj.clone(),
            (t1, t2) if t1 == t2 => t1.clone(),
            _ => VerificationType::Top,
        }
    }

    /// Type of the elements in an array type
    pub fn array_element(&self) -> Option<FrameType> {
        match self {
            VerificationType::Object(class_name) if class_name.starts_with('[') => {
                let array_type = RefType::from_class_name(class_name).ok()?;
                array_type.element_type().map(|elem| FrameType::from(&elem))
            }
            _ => None,
        }
    }
}

fn is_class_assignable(sub: &str, sup: &str) -> bool {
    if sub == sup || sup == "java/lang/Object" {
        return true;
    }
    match (sub.strip_prefix('['), sup.strip_prefix('[')) {
        (None, None) => true,
        (Some(_), None) => sup == "java/lang/Cloneable" || sup == "java/io/Serializable",
        (None, Some(_)) => false,
        (Some(sub_elem), Some(sup_elem)) => {
            match (reference_component(sub_elem), reference_component(sup_elem)) {
                (Some(sub_elem), Some(sup_elem)) => is_class_assignable(sub_elem, sup_elem),
                _ => sub_elem == sup_elem,
            }
        }
    }
}

/// `Ljava/lang/String;` to `java/lang/String`, and `[I` to itself
fn reference_component(descriptor: &str) -> Option<&str> {
    if descriptor.starts_with('[') {
        Some(descriptor)
    } else {
        descriptor.strip_prefix('L')?.strip_suffix(';')
    }
}

impl Serialize for VerificationType<ClassConstantIndex, u16> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            VerificationType::Top => 0u8.serialize(writer)?,
            VerificationType::Integer => 1u8.serialize(writer)?,
            VerificationType::Float => 2u8.serialize(writer)?,
            VerificationType::Double => 3u8.serialize(writer)?,
            VerificationType::Long => 4u8.serialize(writer)?,
            VerificationType::Null => 5u8.serialize(writer)?,
            VerificationType::UninitializedThis => 6u8.serialize(writer)?,
            VerificationType::Object(cls) => {
                7u8.serialize(writer)?;
                cls.serialize(writer)?;
            }
            VerificationType::Uninitialized(off) => {
                8u8.serialize(writer)?;
                off.serialize(writer)?;
            }
        };
        Ok(())
    }
}

impl Deserialize for VerificationType<ClassConstantIndex, u16> {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(match u8::deserialize(reader)? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(ClassConstantIndex::deserialize(reader)?),
            8 => VerificationType::Uninitialized(u16::deserialize(reader)?),
            other => {
                let msg = format!("Invalid verification type tag {}", other);
                return Err(IoError::new(ErrorKind::InvalidData, msg));
            }
        })
    }
}
