use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Index into the query range table.
pub type RelIndex = usize;

/// The largest number of range table entries a single query level may hold.
pub const MAX_RELIDS: usize = 64;

/// A set of range table indexes.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct Relids(u64);

impl Relids {
    #[must_use]
    pub const fn empty() -> Self {
        Relids(0)
    }

    /// # Panics
    /// - index doesn't fit into the set (callers validate the range table first)
    #[must_use]
    pub fn single(rel: RelIndex) -> Self {
        assert!(rel < MAX_RELIDS, "relation index {rel} out of range");
        Relids(1 << rel)
    }

    #[must_use]
    pub fn from_slice(rels: &[RelIndex]) -> Self {
        rels.iter()
            .fold(Relids::empty(), |acc, r| acc.union(Relids::single(*r)))
    }

    #[must_use]
    pub fn union(self, other: Relids) -> Relids {
        Relids(self.0 | other.0)
    }

    #[must_use]
    pub fn intersect(self, other: Relids) -> Relids {
        Relids(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(self, other: Relids) -> Relids {
        Relids(self.0 & !other.0)
    }

    #[must_use]
    pub fn overlaps(self, other: Relids) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn is_subset_of(self, other: Relids) -> bool {
        self.0 & !other.0 == 0
    }

    #[must_use]
    pub fn contains(self, rel: RelIndex) -> bool {
        rel < MAX_RELIDS && self.0 & (1 << rel) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// The only member of a singleton set.
    #[must_use]
    pub fn singleton_member(self) -> Option<RelIndex> {
        if self.len() == 1 {
            Some(self.0.trailing_zeros() as usize)
        } else {
            None
        }
    }

    pub fn iter(self) -> impl Iterator<Item = RelIndex> {
        (0..MAX_RELIDS).filter(move |i| self.0 & (1 << i) != 0)
    }
}

impl Display for Relids {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, r) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ")")
    }
}
