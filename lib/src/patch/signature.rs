use super::PatchError;
use crate::jvm::class_file::ClassFile;
use crate::jvm::code::{MethodBody, MethodShape};
use crate::jvm::{
    BinaryName, Error, MethodAccessFlags, MethodDescriptor, Name, ParseDescriptor,
    RenderDescriptor, UnqualifiedName,
};
use std::fmt;
use std::str::FromStr;

/// Exact identity of a method: declaring class, name, and descriptor
///
/// Overloads never collide since the descriptor includes the parameter list. Descriptors are
/// compared structurally after parsing.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub owner: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
}

impl MethodSignature {
    /// Build a signature, validating all three parts
    ///
    /// The owner can be given as a binary name (`a/b/C`) or as a qualified name (`a.b.C`).
    pub fn new(owner: &str, name: &str, descriptor: &str) -> Result<MethodSignature, Error> {
        let owner = BinaryName::from_qualified(owner).map_err(Error::BadName)?;
        let name = UnqualifiedName::from_string(name.to_owned()).map_err(Error::BadName)?;
        let descriptor = MethodDescriptor::parse(descriptor)
            .map_err(|_| Error::BadDescriptor(descriptor.to_owned()))?;
        Ok(MethodSignature {
            owner,
            name,
            descriptor,
        })
    }

    pub fn descriptor_string(&self) -> String {
        self.descriptor.render()
    }
}

/// Parses `owner.name(descriptor)`, eg. `java/lang/String.length()I`
impl FromStr for MethodSignature {
    type Err = Error;

    fn from_str(source: &str) -> Result<MethodSignature, Error> {
        let paren = source
            .find('(')
            .ok_or_else(|| Error::BadDescriptor(source.to_owned()))?;
        let dot = source[..paren]
            .rfind('.')
            .ok_or_else(|| Error::BadName(source.to_owned()))?;
        MethodSignature::new(&source[..dot], &source[dot + 1..paren], &source[paren..])
    }
}

impl fmt::Debug for MethodSignature {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, formatter)
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}.{}{}",
            self.owner.as_str(),
            self.name.as_str(),
            self.descriptor.render()
        )
    }
}

/// Method found by [`locate`]
#[derive(Debug)]
pub struct LocatedMethod {
    /// Index in `ClassFile::methods`
    pub index: usize,
    pub access_flags: MethodAccessFlags,
    pub shape: MethodShape,

    /// Decoded code (`None` for abstract and native methods)
    pub body: Option<MethodBody>,
}

/// Find a method by exact signature
///
/// Returns `Ok(None)` when the class is not the owner or has no method with that name and
/// descriptor. Matching by name alone never happens.
pub fn locate(
    class: &ClassFile,
    signature: &MethodSignature,
) -> Result<Option<LocatedMethod>, PatchError> {
    let class_name = class.name()?;
    if class_name != signature.owner.as_str() {
        return Ok(None);
    }

    for (index, method) in class.methods.iter().enumerate() {
        if class.method_name(method)? != signature.name.as_str() {
            continue;
        }
        let descriptor_str = class.method_descriptor(method)?;
        let descriptor: MethodDescriptor<BinaryName> = match MethodDescriptor::parse(descriptor_str)
        {
            Ok(descriptor) => descriptor,
            Err(_) => return Err(Error::BadDescriptor(descriptor_str.to_owned()).into()),
        };
        if descriptor != signature.descriptor {
            continue;
        }

        let shape = MethodShape::parse(
            class_name,
            signature.name.as_str(),
            method.access_flags,
            descriptor_str,
        )?;
        let body = match class.method_code(index)? {
            None => None,
            Some(code) => Some(MethodBody::decode(&code, &class.constants, shape.clone())?),
        };
        return Ok(Some(LocatedMethod {
            index,
            access_flags: method.access_flags,
            shape,
            body,
        }));
    }
    Ok(None)
}
