use crate::patch::PatchError;

/// Reasons a rule (or a whole class) was left unpatched
#[derive(Debug)]
pub enum Error {
    /// Class image could not be parsed
    MalformedInput(crate::jvm::Error),

    /// Strategy refused or failed to patch the method
    Patch(PatchError),

    /// Patched class could not be serialized
    SerializationFailure(crate::jvm::Error),
}

impl From<PatchError> for Error {
    fn from(err: PatchError) -> Error {
        Error::Patch(err)
    }
}
