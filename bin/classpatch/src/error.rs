use std::io;
use std::path::PathBuf;

/// Ways the command line tool can fail (patching itself never does)
#[derive(Debug)]
pub enum CliError {
    Io(io::Error),

    /// Input directory could not be walked (unreadable entry, symlink loop)
    Walk(walkdir::Error),

    /// Input is a directory, but the output is an existing file
    OutputNotADirectory(PathBuf),

    /// A class name was given for a whole directory of classes
    ClassNameForDirectory,

    /// Path of a class file under the input directory doesn't name a class
    NotAClassPath(PathBuf),
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> CliError {
        CliError::Io(err)
    }
}

impl From<walkdir::Error> for CliError {
    fn from(err: walkdir::Error) -> CliError {
        CliError::Walk(err)
    }
}
