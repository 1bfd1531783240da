use crate::jvm::Error;
use std::collections::HashMap;
use std::fmt;

/// Opaque label
///
/// Labels stand for positions in a method body: jump targets, exception range bounds, and the
/// positions that frames and debug information are attached to. They are only ever turned into
/// byte offsets when a body is encoded (see [`LabelTable`]).
#[derive(Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Label(usize);

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

/// Hands out fresh labels for one method body
///
/// Cloning does not split the source - the clone will produce the same sequence of labels as the
/// original.
#[derive(Clone, Debug, Default)]
pub struct LabelAllocator {
    next: usize,
}

impl LabelAllocator {
    pub fn new() -> LabelAllocator {
        LabelAllocator { next: 0 }
    }

    /// Generate a fresh label
    pub fn fresh(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }

    /// Number of labels handed out so far
    pub fn allocated(&self) -> usize {
        self.next
    }
}

/// Byte offsets of labels, built up while laying out a method body
#[derive(Debug, Default)]
pub struct LabelTable {
    offsets: HashMap<Label, usize>,
}

impl LabelTable {
    pub fn new() -> LabelTable {
        LabelTable {
            offsets: HashMap::new(),
        }
    }

    /// Bind a label to an offset (labels can only be bound once)
    pub fn bind(&mut self, label: Label, offset: usize) -> Result<(), Error> {
        if self.offsets.insert(label, offset).is_some() {
            return Err(Error::DuplicateLabel(label));
        }
        Ok(())
    }

    /// Look up the offset of a bound label
    pub fn offset_of(&self, label: Label) -> Result<usize, Error> {
        self.offsets
            .get(&label)
            .copied()
            .ok_or(Error::UnboundLabel(label))
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.offsets.contains_key(&label)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_bind_once() {
        let mut labels = LabelAllocator::new();
        let (a, b) = (labels.fresh(), labels.fresh());
        assert_ne!(a, b);
        assert_eq!(format!("{:?}", b), "L1");

        let mut table = LabelTable::new();
        table.bind(a, 4).unwrap();
        assert_eq!(table.offset_of(a).unwrap(), 4);
        assert!(matches!(table.bind(a, 6), Err(Error::DuplicateLabel(l)) if l == a));
        assert!(matches!(table.offset_of(b), Err(Error::UnboundLabel(l)) if l == b));
    }
}
