//! Field and method descriptors
//!
//! See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.3>

use super::{BinaryName, Name};
use crate::util::Width;

/// Failure to read a descriptor, with the byte offset where reading stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError {
    pub descriptor: String,
    pub position: usize,
    pub expected: &'static str,
}

/// Position in a descriptor being parsed
pub struct DescriptorCursor<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> DescriptorCursor<'a> {
    pub fn new(text: &'a str) -> DescriptorCursor<'a> {
        DescriptorCursor { text, position: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.position).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let next = self.peek()?;
        self.position += 1;
        Some(next)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn is_done(&self) -> bool {
        self.position >= self.text.len()
    }

    /// Text up to (not including) the next `terminator`, which is consumed
    fn until(&mut self, terminator: char) -> Option<&'a str> {
        let rest = &self.text[self.position..];
        let end = rest.find(terminator)?;
        self.position += end + terminator.len_utf8();
        Some(&rest[..end])
    }

    fn error(&self, expected: &'static str) -> DescriptorError {
        DescriptorError {
            descriptor: self.text.to_owned(),
            position: self.position,
            expected,
        }
    }
}

/// Conversion of descriptors to their string form
pub trait RenderDescriptor {
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    fn render_to(&self, write_to: &mut String);
}

/// Conversion of descriptors from their string form
pub trait ParseDescriptor: Sized {
    /// Parse a complete descriptor, rejecting trailing input
    fn parse(source: &str) -> Result<Self, DescriptorError> {
        let mut cursor = DescriptorCursor::new(source);
        let parsed = Self::parse_from(&mut cursor)?;
        if cursor.is_done() {
            Ok(parsed)
        } else {
            Err(cursor.error("end of descriptor"))
        }
    }

    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl BaseType {
    fn from_tag(tag: u8) -> Option<BaseType> {
        Some(match tag {
            b'B' => BaseType::Byte,
            b'C' => BaseType::Char,
            b'D' => BaseType::Double,
            b'F' => BaseType::Float,
            b'I' => BaseType::Int,
            b'J' => BaseType::Long,
            b'S' => BaseType::Short,
            b'Z' => BaseType::Boolean,
            _ => return None,
        })
    }

    fn tag(self) -> char {
        match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        }
    }
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        write_to.push(self.tag());
    }
}

impl ParseDescriptor for BaseType {
    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        match cursor.peek().and_then(BaseType::from_tag) {
            Some(base_type) => {
                cursor.bump();
                Ok(base_type)
            }
            None => Err(cursor.error("primitive type")),
        }
    }
}

impl RenderDescriptor for BinaryName {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('L');
        write_to.push_str(self.as_str());
        write_to.push(';');
    }
}

impl ParseDescriptor for BinaryName {
    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        if !cursor.eat(b'L') {
            return Err(cursor.error("`L`"));
        }
        let start = cursor.position;
        let name = cursor.until(';').ok_or_else(|| cursor.error("`;`"))?;
        BinaryName::from_string(name.to_owned()).map_err(|_| DescriptorError {
            descriptor: cursor.text.to_owned(),
            position: start,
            expected: "class name",
        })
    }
}

/// Innermost element of an array type
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ElementType<Class> {
    Base(BaseType),
    Object(Class),
}

/// Reference type
///
/// The class file format caps arrays at 255 dimensions, which is what `dimensions` can hold.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RefType<Class> {
    Object(Class),
    Array {
        dimensions: u8,
        element: ElementType<Class>,
    },
}

impl<C: RenderDescriptor> RenderDescriptor for RefType<C> {
    fn render_to(&self, write_to: &mut String) {
        match self {
            RefType::Object(class) => class.render_to(write_to),
            RefType::Array {
                dimensions,
                element,
            } => {
                for _ in 0..*dimensions {
                    write_to.push('[');
                }
                match element {
                    ElementType::Base(base_type) => base_type.render_to(write_to),
                    ElementType::Object(class) => class.render_to(write_to),
                }
            }
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for RefType<C> {
    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        let mut dimensions: u8 = 0;
        while cursor.peek() == Some(b'[') {
            dimensions = dimensions
                .checked_add(1)
                .ok_or_else(|| cursor.error("at most 255 array dimensions"))?;
            cursor.bump();
        }
        match (dimensions, cursor.peek()) {
            (0, Some(b'L')) => C::parse_from(cursor).map(RefType::Object),
            (0, _) => Err(cursor.error("reference type")),
            (_, Some(b'L')) => Ok(RefType::Array {
                dimensions,
                element: ElementType::Object(C::parse_from(cursor)?),
            }),
            (_, _) => Ok(RefType::Array {
                dimensions,
                element: ElementType::Base(BaseType::parse_from(cursor)?),
            }),
        }
    }
}

impl<C> RefType<C> {
    /// Array whose elements have the given type (saturating at 255 dimensions)
    pub fn array(element_type: FieldType<C>) -> RefType<C> {
        match element_type {
            FieldType::Base(base_type) => RefType::Array {
                dimensions: 1,
                element: ElementType::Base(base_type),
            },
            FieldType::Ref(RefType::Object(class)) => RefType::Array {
                dimensions: 1,
                element: ElementType::Object(class),
            },
            FieldType::Ref(RefType::Array {
                dimensions,
                element,
            }) => RefType::Array {
                dimensions: dimensions.saturating_add(1),
                element,
            },
        }
    }
}

impl<C: Clone> RefType<C> {
    /// Type of the elements, if this is an array type
    pub fn element_type(&self) -> Option<FieldType<C>> {
        match self {
            RefType::Object(_) => None,
            RefType::Array {
                dimensions: 1,
                element: ElementType::Base(base_type),
            } => Some(FieldType::Base(*base_type)),
            RefType::Array {
                dimensions: 1,
                element: ElementType::Object(class),
            } => Some(FieldType::object(class.clone())),
            RefType::Array {
                dimensions,
                element,
            } => Some(FieldType::Ref(RefType::Array {
                dimensions: dimensions.saturating_sub(1),
                element: element.clone(),
            })),
        }
    }
}

impl RefType<BinaryName> {
    /// Name of the type as it appears in a `CONSTANT_Class` entry
    ///
    /// Classes are spelled as their binary name, but array classes are spelled as their full
    /// descriptor (eg. `[Ljava/lang/String;`).
    pub fn class_name(&self) -> String {
        match self {
            RefType::Object(name) => name.as_str().to_owned(),
            RefType::Array { .. } => self.render(),
        }
    }

    /// Inverse of [`Self::class_name`]
    pub fn from_class_name(name: &str) -> Result<RefType<BinaryName>, DescriptorError> {
        if name.starts_with('[') {
            RefType::parse(name)
        } else {
            BinaryName::from_string(name.to_owned())
                .map(RefType::Object)
                .map_err(|_| DescriptorCursor::new(name).error("class name"))
        }
    }
}

/// Type of a field, argument, or local variable
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType<Class> {
    Base(BaseType),
    Ref(RefType<Class>),
}

impl<C> Width for FieldType<C> {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.width(),
            FieldType::Ref(_) => 1,
        }
    }
}

impl<C> FieldType<C> {
    pub fn array(element_type: FieldType<C>) -> FieldType<C> {
        FieldType::Ref(RefType::array(element_type))
    }

    pub const fn object(class_name: C) -> FieldType<C> {
        FieldType::Ref(RefType::Object(class_name))
    }

    pub const fn int() -> FieldType<C> {
        FieldType::Base(BaseType::Int)
    }

    pub const fn long() -> FieldType<C> {
        FieldType::Base(BaseType::Long)
    }

    pub const fn float() -> FieldType<C> {
        FieldType::Base(BaseType::Float)
    }

    pub const fn double() -> FieldType<C> {
        FieldType::Base(BaseType::Double)
    }

    pub const fn boolean() -> FieldType<C> {
        FieldType::Base(BaseType::Boolean)
    }
}

impl<C: RenderDescriptor> RenderDescriptor for FieldType<C> {
    fn render_to(&self, write_to: &mut String) {
        match self {
            FieldType::Base(base_type) => base_type.render_to(write_to),
            FieldType::Ref(ref_type) => ref_type.render_to(write_to),
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for FieldType<C> {
    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        match cursor.peek() {
            Some(b'L' | b'[') => RefType::parse_from(cursor).map(FieldType::Ref),
            _ => BaseType::parse_from(cursor)
                .map(FieldType::Base)
                .map_err(|_| cursor.error("field type")),
        }
    }
}

/// Parameter and return types of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor<Class> {
    pub parameters: Vec<FieldType<Class>>,

    /// `None` for `void`
    pub return_type: Option<FieldType<Class>>,
}

impl<C> MethodDescriptor<C> {
    /// Local variable slots taken by the parameters, counting `this` if there is one
    ///
    /// Valid methods take at most 255 slots.
    pub fn parameter_slots(&self, has_this: bool) -> usize {
        let parameters: usize = self.parameters.iter().map(Width::width).sum();
        parameters + has_this as usize
    }
}

impl<C: RenderDescriptor> RenderDescriptor for MethodDescriptor<C> {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        match &self.return_type {
            None => write_to.push('V'),
            Some(return_type) => return_type.render_to(write_to),
        }
    }
}

impl<C: ParseDescriptor> ParseDescriptor for MethodDescriptor<C> {
    fn parse_from(cursor: &mut DescriptorCursor) -> Result<Self, DescriptorError> {
        if !cursor.eat(b'(') {
            return Err(cursor.error("`(`"));
        }
        let mut parameters = vec![];
        while !cursor.eat(b')') {
            if cursor.is_done() {
                return Err(cursor.error("`)`"));
            }
            parameters.push(FieldType::parse_from(cursor)?);
        }
        let return_type = if cursor.eat(b'V') {
            None
        } else {
            Some(FieldType::parse_from(cursor)?)
        };
        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}
