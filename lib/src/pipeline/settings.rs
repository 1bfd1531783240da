use crate::jvm::code::MAX_CODE_LENGTH;

/// Knobs of the [`super::Transformer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Patched methods with more bytecode than this are rejected
    pub max_code_length: usize,

    /// Log class sizes before and after patching (at debug level)
    pub log_sizes: bool,

    /// Leave a class alone when the name supplied with it is not the name inside it
    pub strict_class_name: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            max_code_length: MAX_CODE_LENGTH,
            log_sizes: false,
            strict_class_name: true,
        }
    }
}
