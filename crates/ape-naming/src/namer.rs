//! Namers and their attribute type sets

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute kinds a namer may read, in ordinal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NamerType {
    Type,
    Index,
    Parent,
    Text,
    Ancestor,
}

impl NamerType {
    pub const ALL: [NamerType; 5] = [
        NamerType::Type,
        NamerType::Index,
        NamerType::Parent,
        NamerType::Text,
        NamerType::Ancestor,
    ];

    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Local kinds only look at the node itself
    pub fn is_local(self) -> bool {
        !matches!(self, NamerType::Parent | NamerType::Ancestor)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NamerType::Type => "TYPE",
            NamerType::Index => "INDEX",
            NamerType::Parent => "PARENT",
            NamerType::Text => "TEXT",
            NamerType::Ancestor => "ANCESTOR",
        }
    }
}

/// Set of [`NamerType`]s, stored as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NamerTypeSet(u8);

impl NamerTypeSet {
    pub const fn empty() -> Self {
        NamerTypeSet(0)
    }

    pub fn of(types: &[NamerType]) -> Self {
        types.iter().fold(Self::empty(), |acc, t| acc.with(*t))
    }

    /// Every kind in ordinal order up to and including `last`
    pub fn up_to(last: NamerType) -> Self {
        NamerType::ALL
            .iter()
            .filter(|t| **t <= last)
            .fold(Self::empty(), |acc, t| acc.with(*t))
    }

    pub fn contains(self, t: NamerType) -> bool {
        self.0 & t.bit() != 0
    }

    pub fn with(self, t: NamerType) -> Self {
        NamerTypeSet(self.0 | t.bit())
    }

    pub fn without(self, t: NamerType) -> Self {
        NamerTypeSet(self.0 & !t.bit())
    }

    pub fn union(self, other: Self) -> Self {
        NamerTypeSet(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        NamerTypeSet(self.0 & other.0)
    }

    /// Complement relative to `universe`
    pub fn complement(self, universe: Self) -> Self {
        NamerTypeSet(universe.0 & !self.0)
    }

    pub fn is_superset(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn ordinal_sum(self) -> u32 {
        self.iter().map(NamerType::ordinal).sum()
    }

    /// Restriction to local kinds
    pub fn local(self) -> Self {
        self.without(NamerType::Parent).without(NamerType::Ancestor)
    }

    pub fn is_local(self) -> bool {
        self.local() == self
    }

    pub fn iter(self) -> impl Iterator<Item = NamerType> {
        NamerType::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    /// Namer comparator: coarser sets first, then by ordinal sum
    pub fn compare(self, other: Self) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.ordinal_sum().cmp(&other.ordinal_sum()))
    }
}

impl fmt::Display for NamerTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.iter().map(NamerType::as_str).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

/// Index of a namer in the lattice arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamerId(pub u16);

impl NamerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Structure of a namer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamerKind {
    /// Names every node the same
    Empty,
    /// Class and resource id
    Type,
    /// Text and content description
    Text,
    /// Position among siblings
    Index,
    /// Concatenation of atomic namers
    Compound(Vec<NamerId>),
    /// Parent's assigned name plus a local name
    Parent(NamerId),
    /// Chain of local names from the root
    Ancestor(NamerId),
    /// Base name plus interactive capability bits
    ActionPatch(NamerId),
}

/// A node naming function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namer {
    pub id: NamerId,
    pub types: NamerTypeSet,
    pub kind: NamerKind,
}

impl Namer {
    /// `self` refines `other` iff it reads at least the same kinds
    pub fn refines_to(&self, other: &Namer) -> bool {
        self.types.is_superset(other.types)
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, NamerKind::ActionPatch(_))
    }
}

impl fmt::Display for Namer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NamerKind::Empty => "EmptyNamer",
            NamerKind::Type => "TypeNamer",
            NamerKind::Text => "TextNamer",
            NamerKind::Index => "IndexNamer",
            NamerKind::Compound(_) => "CompoundNamer",
            NamerKind::Parent(_) => "ParentNamer",
            NamerKind::Ancestor(_) => "AncestorNamer",
            NamerKind::ActionPatch(_) => "ActionPatchNamer",
        };
        write!(f, "{}#{}{}", kind, self.id.0, self.types)
    }
}
