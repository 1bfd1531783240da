use crate::jvm::binary_format::{Deserialize, Serialize};
use crate::jvm::class_file::{
    Attribute, ClassConstantIndex, Code, ConstantPool, Field, Method, Version,
};
use crate::jvm::{ClassAccessFlags, Error, FieldAccessFlags, MethodAccessFlags};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Representation of the [`class` file format of the JVM][0]
///
/// Parsing then serializing a class produces the exact same bytes. Edits go through the constant
/// pool interning methods and [`ClassFile::set_method_code`], both of which leave everything they
/// don't touch in place.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,

    /// Only `java/lang/Object` has no superclass
    pub super_class: Option<ClassConstantIndex>,
    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    pub const MAGIC: u32 = 0xCAFE_BABE;

    /// Start a new class with no members
    pub fn new(
        this_class: &str,
        super_class: Option<&str>,
        access_flags: ClassAccessFlags,
        version: Version,
    ) -> Result<ClassFile, Error> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(this_class)?;
        let super_class = match super_class {
            None => None,
            Some(super_class) => Some(constants.get_class(super_class)?),
        };
        Ok(ClassFile {
            version,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        })
    }

    /// Parse a class from its bytes
    pub fn parse(bytes: &[u8]) -> Result<ClassFile, Error> {
        let mut reader = Cursor::new(bytes);
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != ClassFile::MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let class = ClassFile {
            version: Version::deserialize(&mut reader)?,
            constants: ConstantPool::deserialize(&mut reader)?,
            access_flags: ClassAccessFlags::deserialize(&mut reader)?,
            this_class: ClassConstantIndex::deserialize(&mut reader)?,
            super_class: {
                let index = ClassConstantIndex::deserialize(&mut reader)?;
                if index.0 .0 == 0 {
                    None
                } else {
                    Some(index)
                }
            },
            interfaces: Vec::deserialize(&mut reader)?,
            fields: Vec::deserialize(&mut reader)?,
            methods: Vec::deserialize(&mut reader)?,
            attributes: Vec::deserialize(&mut reader)?,
        };

        let leftover = bytes.len() - reader.position() as usize;
        if leftover != 0 {
            return Err(Error::TrailingBytes(leftover));
        }
        Ok(class)
    }

    /// Serialize the class into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }

    /// Binary name of the class
    pub fn name(&self) -> Result<&str, Error> {
        self.constants.class_name(self.this_class)
    }

    /// Binary name of the superclass
    pub fn super_name(&self) -> Result<Option<&str>, Error> {
        match self.super_class {
            None => Ok(None),
            Some(super_class) => self.constants.class_name(super_class).map(Some),
        }
    }

    pub fn method_name(&self, method: &Method) -> Result<&str, Error> {
        self.constants.utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &Method) -> Result<&str, Error> {
        self.constants.utf8(method.descriptor_index)
    }

    /// Declare a field
    pub fn add_field(
        &mut self,
        access_flags: FieldAccessFlags,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error> {
        let field = Field {
            access_flags,
            name_index: self.constants.get_utf8(name)?,
            descriptor_index: self.constants.get_utf8(descriptor)?,
            attributes: vec![],
        };
        self.fields.push(field);
        Ok(())
    }

    /// Declare a method, returning its index in `methods`
    ///
    /// Abstract and native methods should have no code.
    pub fn add_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        code: Option<&Code>,
    ) -> Result<usize, Error> {
        let mut method = Method {
            access_flags,
            name_index: self.constants.get_utf8(name)?,
            descriptor_index: self.constants.get_utf8(descriptor)?,
            attributes: vec![],
        };
        if let Some(code) = code {
            method.attributes.push(self.constants.get_attribute(code)?);
        }
        self.methods.push(method);
        Ok(self.methods.len() - 1)
    }

    /// Parse the `Code` attribute of a method, if it has one
    pub fn method_code(&self, method_index: usize) -> Result<Option<Code>, Error> {
        let method = self.method(method_index)?;
        match self.constants.find_attribute::<Code>(&method.attributes) {
            None => Ok(None),
            Some((_, attribute)) => Ok(Some(attribute.parse::<Code>()?)),
        }
    }

    /// Replace the `Code` attribute of a method
    ///
    /// The new attribute takes the position of the old one (if there was one) so that the other
    /// method attributes keep their order.
    pub fn set_method_code(&mut self, method_index: usize, code: &Code) -> Result<(), Error> {
        let attribute = self.constants.get_attribute(code)?;
        let existing = self
            .constants
            .find_attribute::<Code>(&self.method(method_index)?.attributes)
            .map(|(position, _)| position);
        let method = &mut self.methods[method_index];
        match existing {
            Some(position) => method.attributes[position] = attribute,
            None => method.attributes.push(attribute),
        }
        Ok(())
    }

    fn method(&self, method_index: usize) -> Result<&Method, Error> {
        self.methods.get(method_index).ok_or_else(|| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No method at index {}", method_index),
            ))
        })
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        ClassFile::MAGIC.serialize(writer)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        match self.super_class {
            None => 0u16.serialize(writer)?,
            Some(super_class) => super_class.serialize(writer)?,
        }
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::BytecodeArray;

    fn sample_class() -> ClassFile {
        let mut class = ClassFile::new(
            "me/test/Sample",
            Some("java/lang/Object"),
            ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            Version::JAVA8,
        )
        .unwrap();
        class
            .add_field(FieldAccessFlags::PRIVATE, "count", "I")
            .unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            code_array: BytecodeArray(vec![0x04, 0xAC]), // iconst_1; ireturn
            exception_table: vec![],
            attributes: vec![],
        };
        class
            .add_method(MethodAccessFlags::STATIC, "one", "()I", Some(&code))
            .unwrap();
        class
            .add_method(MethodAccessFlags::ABSTRACT, "two", "()I", None)
            .unwrap();
        class
    }

    #[test]
    fn parse_round_trip() {
        let bytes = sample_class().to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);

        let parsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(parsed.name().unwrap(), "me/test/Sample");
        assert_eq!(parsed.super_name().unwrap(), Some("java/lang/Object"));
        assert_eq!(parsed.methods.len(), 2);
        assert_eq!(parsed.method_name(&parsed.methods[1]).unwrap(), "two");
        assert_eq!(parsed.to_bytes().unwrap(), bytes);

        let code = parsed.method_code(0).unwrap().unwrap();
        assert_eq!(code.code_array.0, vec![0x04, 0xAC]);
        assert!(parsed.method_code(1).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_input() {
        let mut bytes = sample_class().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            ClassFile::parse(&bytes),
            Err(Error::TrailingBytes(1))
        ));

        bytes[0] = 0xCB;
        assert!(matches!(ClassFile::parse(&bytes), Err(Error::BadMagic(_))));

        bytes[0] = 0xCA;
        assert!(matches!(
            ClassFile::parse(&bytes[..20]),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn replacing_code_keeps_attribute_position() {
        let mut class = sample_class();
        let extra = class.constants.get_utf8("Deprecated").unwrap();
        class.methods[0].attributes.push(Attribute {
            name_index: extra,
            info: vec![],
        });

        let code = Code {
            max_stack: 1,
            max_locals: 1,
            code_array: BytecodeArray(vec![0x05, 0xAC]),
            exception_table: vec![],
            attributes: vec![],
        };
        class.set_method_code(0, &code).unwrap();
        assert_eq!(class.methods[0].attributes.len(), 2);
        assert_eq!(class.methods[0].attributes[1].name_index, extra);
        assert_eq!(class.method_code(0).unwrap().unwrap(), code);
    }
}
