/// Types whose values occupy a known number of JVM slots
///
/// `long` and `double` are the only two-slot types, both on the operand stack and in the local
/// variables.
pub trait Width {
    /// Number of slots the value takes up
    fn width(&self) -> usize;
}
