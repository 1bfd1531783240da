use crate::jvm::binary_format::{Deserialize, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Result;

/// Class file version
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.1-200-B.2
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major_version: u16,
    pub minor_version: u16,
}

impl Version {
    /// Last version without `StackMapTable` attributes
    pub const JAVA5: Version = Version {
        major_version: 49,
        minor_version: 0,
    };
    pub const JAVA6: Version = Version {
        major_version: 50,
        minor_version: 0,
    };
    pub const JAVA8: Version = Version {
        major_version: 52,
        minor_version: 0,
    };
    pub const JAVA17: Version = Version {
        major_version: 61,
        minor_version: 0,
    };

    /// Whether methods in classes of this version carry `StackMapTable` attributes
    pub fn supports_stack_map_table(&self) -> bool {
        self.major_version >= 50
    }
}

/// Minor version comes first in the class file
impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor_version.serialize(writer)?;
        self.major_version.serialize(writer)
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let minor_version = u16::deserialize(reader)?;
        let major_version = u16::deserialize(reader)?;
        Ok(Version {
            major_version,
            minor_version,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_map_tables_start_at_major_50() {
        assert!(!Version::JAVA5.supports_stack_map_table());
        assert!(Version::JAVA6.supports_stack_map_table());
        assert!(Version::JAVA17.supports_stack_map_table());
        assert!(Version::JAVA5 < Version::JAVA6);
    }
}
