use std::borrow::Cow;
use std::fmt;

/// Names of methods and fields
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces, with `/` separating packages
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct BinaryName(Cow<'static, str>);

pub trait Name: Sized {
    /// Check that a string is a well-formed name, explaining why not otherwise
    fn check_valid(name: &str) -> Result<(), String>;

    fn as_str(&self) -> &str;

    /// Wrap an owned string, after checking it
    fn from_string(name: String) -> Result<Self, String>;
}

/// `<init>` and `<clinit>` are the only method names allowed to contain angle brackets
fn check_member_name(name: &str, allow_special: bool) -> Result<(), String> {
    let is_special = name == "<init>" || name == "<clinit>";
    if name.is_empty() {
        Err("empty name".to_owned())
    } else if let Some(bad) = name.chars().find(|c| matches!(c, '.' | ';' | '[' | '/')) {
        Err(format!("'{}' contains '{}'", name, bad))
    } else if name.contains(&['<', '>'][..]) && !(allow_special && is_special) {
        Err(format!("'{}' contains angle brackets", name))
    } else {
        Ok(())
    }
}

impl Name for UnqualifiedName {
    fn check_valid(name: &str) -> Result<(), String> {
        check_member_name(name, true)
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(UnqualifiedName(Cow::Owned(name)))
    }
}

impl Name for BinaryName {
    fn check_valid(name: &str) -> Result<(), String> {
        name.split('/')
            .try_for_each(|segment| check_member_name(segment, false))
            .map_err(|problem| format!("class name '{}': {}", name, problem))
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(BinaryName(Cow::Owned(name)))
    }
}

macro_rules! show_as_str {
    ($($name:ty),*) => {
        $(
            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )*
    };
}

show_as_str!(UnqualifiedName, BinaryName);

impl UnqualifiedName {
    pub const INIT: Self = UnqualifiedName(Cow::Borrowed("<init>"));
}

impl BinaryName {
    /// Parse a fully qualified name as handed out by class loaders (`java.lang.String`) or as it
    /// appears inside class files (`java/lang/String`)
    pub fn from_qualified(name: &str) -> Result<BinaryName, String> {
        BinaryName::from_string(name.replace('.', "/"))
    }

    /// Name with `/` replaced by `.`, the way class loaders spell it
    pub fn to_dotted(&self) -> String {
        self.0.replace('/', ".")
    }

    const fn name(value: &'static str) -> BinaryName {
        BinaryName(Cow::Borrowed(value))
    }

    pub const CLASS: Self = Self::name("java/lang/Class");
    pub const METHODHANDLE: Self = Self::name("java/lang/invoke/MethodHandle");
    pub const METHODTYPE: Self = Self::name("java/lang/invoke/MethodType");
    pub const OBJECT: Self = Self::name("java/lang/Object");
    pub const STRING: Self = Self::name("java/lang/String");
    pub const THROWABLE: Self = Self::name("java/lang/Throwable");
}
