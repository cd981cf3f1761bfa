//! Interned names
//!
//! Every name produced by a namer is interned in a [`NameCache`]. A
//! [`NameId`] is the creation index of the name, so ordering ids orders
//! names by first appearance, which is the tie-break used throughout the
//! model.

use std::collections::HashMap;
use std::fmt;

use ape_common::{ActionType, ScrollType};
use serde::{Deserialize, Serialize};

use crate::namer::NamerId;

/// Interned name handle; ordered by creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameId(pub u32);

impl NameId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Interactive properties recorded by the action-patch combinator, lowest bit first
pub const PATCH_PROPERTIES: [&str; 5] = [
    "enabled",
    "clickable",
    "checkable",
    "long-clickable",
    "scrollable",
];

pub const PATCH_ENABLED: u8 = 1 << 0;
pub const PATCH_CLICKABLE: u8 = 1 << 1;
pub const PATCH_CHECKABLE: u8 = 1 << 2;
pub const PATCH_LONG_CLICKABLE: u8 = 1 << 3;
pub const PATCH_SCROLLABLE: u8 = 1 << 4;

/// Structure of a name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameKind {
    Empty,
    Type { class: String, resource_id: String },
    Text { text: String, content_desc: String },
    Index(u32),
    Compound(Vec<NameId>),
    Parent { parent: NameId, local: NameId },
    /// Root first
    Ancestor(Vec<NameId>),
    ActionPatch { base: NameId, patch: u8, scroll: ScrollType },
}

impl NameKind {
    pub fn is_empty_name(&self) -> bool {
        matches!(self, NameKind::Empty)
    }
}

/// An interned name with its derived data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Name {
    pub id: NameId,
    pub namer: NamerId,
    pub kind: NameKind,
    /// Name of the node itself without parent or ancestor context
    pub local: NameId,
    /// Selector matching the nodes this name denotes
    pub xpath: String,
    /// Attribute predicates of the node itself
    pub local_props: String,
    /// Action types the name carries; empty unless patched
    pub actions: Vec<ActionType>,
}

impl Name {
    pub fn has_action(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Name interner keyed by producing namer and structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameCache {
    names: Vec<Name>,
    #[serde(skip)]
    index: HashMap<(NamerId, NameKind), NameId>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NameId) -> &Name {
        &self.names[id.index()]
    }

    pub fn try_get(&self, id: NameId) -> Option<&Name> {
        self.names.get(id.index())
    }

    pub fn lookup(&self, namer: NamerId, kind: &NameKind) -> Option<NameId> {
        self.index.get(&(namer, kind.clone())).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Next id to be assigned
    pub fn next_id(&self) -> NameId {
        NameId(self.names.len() as u32)
    }

    /// Store a fully derived name; returns the existing id on a structural match
    pub fn insert(&mut self, name: Name) -> NameId {
        let key = (name.namer, name.kind.clone());
        if let Some(existing) = self.index.get(&key) {
            return *existing;
        }
        let id = name.id;
        debug_assert_eq!(id, self.next_id());
        self.index.insert(key, id);
        self.names.push(name);
        id
    }

    /// Rebuild the structural index after deserialization
    pub fn reindex(&mut self) {
        self.index = self
            .names
            .iter()
            .map(|n| ((n.namer, n.kind.clone()), n.id))
            .collect();
    }
}

/// Action types encoded by patch bits and scroll type
pub fn decode_actions(patch: u8, scroll: ScrollType) -> Vec<ActionType> {
    let mut actions = Vec::with_capacity(6);
    if patch & (PATCH_CLICKABLE | PATCH_CHECKABLE) != 0 {
        actions.push(ActionType::ModelClick);
    }
    if patch & PATCH_LONG_CLICKABLE != 0 {
        actions.push(ActionType::ModelLongClick);
    }
    match scroll {
        ScrollType::All => actions.extend([
            ActionType::ModelScrollBottomUp,
            ActionType::ModelScrollTopDown,
            ActionType::ModelScrollLeftRight,
            ActionType::ModelScrollRightLeft,
        ]),
        ScrollType::Horizontal => actions.extend([
            ActionType::ModelScrollLeftRight,
            ActionType::ModelScrollRightLeft,
        ]),
        ScrollType::Vertical => actions.extend([
            ActionType::ModelScrollBottomUp,
            ActionType::ModelScrollTopDown,
        ]),
        ScrollType::None => {}
    }
    actions
}

/// Selector predicates for patch bits
pub fn patch_props(patch: u8) -> String {
    let mut out = String::new();
    for (i, prop) in PATCH_PROPERTIES.iter().enumerate() {
        let value = patch & (1 << i) != 0;
        out.push_str(&format!("[@{}='{}']", prop, value));
    }
    out
}

/// Quote a value for a double-quoted selector literal
pub fn escape_xpath(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
