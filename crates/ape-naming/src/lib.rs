//! # APE Naming
//!
//! Node naming for state abstraction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   names    ┌─────────────┐   results   ┌──────────────┐
//! │ NamerLattice │ ─────────> │  NameCache  │ <────────── │  NamingTree  │
//! │  (namers)    │            │ (interned)  │             │  (namelets)  │
//! └──────────────┘            └─────────────┘             └──────────────┘
//!        ^                                                       │
//!        └───────────── refines_to / sorted_above ───────────────┘
//! ```
//!
//! - [`NamerLattice`]: one namer per attribute type set, ordered by inclusion
//! - [`Selector`]: XPath subset used by namelets and generated from names
//! - [`NamingTree`]: namings built from namelets, with memoized refinement steps
//! - [`NamingResult`]: per-tree naming outcome, cached per naming and tree

pub mod factory;
pub mod lattice;
pub mod name;
pub mod namer;
pub mod naming;
pub mod result;
pub mod selector;

pub use factory::BaseNaming;
pub use lattice::NamerLattice;
pub use name::{Name, NameCache, NameId, NameKind};
pub use namer::{Namer, NamerId, NamerKind, NamerType, NamerTypeSet};
pub use naming::{Namelet, NameletId, NameletKind, NameletSpec, Naming, NamingId, NamingTree};
pub use result::NamingResult;
pub use selector::Selector;
