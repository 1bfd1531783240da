mod attribute;
mod class;
mod constants;
mod member;
mod version;

pub use attribute::*;
pub use class::*;
pub use constants::*;
pub use member::*;
pub use version::*;
