//! Namer Lattice
//!
//! The lattice holds one namer per attribute type set, ordered by set
//! inclusion. Besides its members it owns an arena of the helper namers the
//! members are composed of, and the [`NameCache`] every produced name is
//! interned in.
//!
//! ```text
//!                 {TYPE,INDEX,PARENT,TEXT,ANCESTOR}   top
//!                /            |             \
//!        {TYPE,INDEX}   {TYPE,TEXT}   {PARENT,TEXT} ...
//!                \            |             /
//!                            {}                         bottom
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;

use ape_common::{NamingError, NodeId, Result, UiTree};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::name::{
    decode_actions, escape_xpath, patch_props, Name, NameCache, NameId, NameKind, PATCH_CHECKABLE,
    PATCH_CLICKABLE, PATCH_ENABLED, PATCH_LONG_CLICKABLE, PATCH_SCROLLABLE,
};
use crate::namer::{Namer, NamerId, NamerKind, NamerType, NamerTypeSet};

/// Precomputed neighbourhood of one member
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Relations {
    upper: Vec<NamerId>,
    lower: Vec<NamerId>,
    not_above: Vec<NamerId>,
    not_below: Vec<NamerId>,
    sorted_above: Vec<NamerId>,
    complement: NamerId,
}

/// Lattice of namers plus the name interner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamerLattice {
    namers: Vec<Namer>,
    structural: HashMap<NamerKind, NamerId>,
    members: Vec<NamerId>,
    by_types: HashMap<NamerTypeSet, NamerId>,
    relations: HashMap<NamerId, Relations>,
    used: NamerTypeSet,
    top: NamerId,
    bottom: NamerId,
    empty_name: NameId,
    names: NameCache,
}

impl NamerLattice {
    /// Standard lattice: every subset of {TYPE, TEXT, INDEX, PARENT}, optionally
    /// doubled with ANCESTOR variants, optionally action-patched
    pub fn new(use_ancestor: bool, use_patch: bool) -> Result<Self> {
        let used = if use_ancestor {
            NamerTypeSet::up_to(NamerType::Ancestor)
        } else {
            NamerTypeSet::up_to(NamerType::Text)
        };
        let base_kinds = [
            NamerType::Type,
            NamerType::Text,
            NamerType::Index,
            NamerType::Parent,
        ];
        let mut sets = Vec::with_capacity(32);
        for mask in 0u8..16 {
            let set = base_kinds
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .fold(NamerTypeSet::empty(), |acc, (_, t)| acc.with(*t));
            sets.push(set);
        }
        if use_ancestor {
            let ancestors: Vec<NamerTypeSet> =
                sets.iter().map(|s| s.with(NamerType::Ancestor)).collect();
            sets.extend(ancestors);
        }
        Self::from_type_sets(&sets, used, use_patch)
    }

    /// Build a lattice from explicit member type sets
    pub fn from_type_sets(
        sets: &[NamerTypeSet],
        used: NamerTypeSet,
        use_patch: bool,
    ) -> Result<Self> {
        let mut lattice = Self {
            namers: Vec::new(),
            structural: HashMap::new(),
            members: Vec::with_capacity(sets.len()),
            by_types: HashMap::new(),
            relations: HashMap::new(),
            used,
            top: NamerId(0),
            bottom: NamerId(0),
            empty_name: NameId(0),
            names: NameCache::new(),
        };

        let empty = lattice.add_namer(NamerTypeSet::empty(), NamerKind::Empty);
        for set in sets {
            let base = lattice.base_namer(*set);
            let member = if use_patch {
                lattice.add_namer(*set, NamerKind::ActionPatch(base))
            } else {
                base
            };
            if lattice.by_types.insert(*set, member).is_some() {
                return Err(NamingError::DuplicateNamer(set.to_string()).into());
            }
            lattice.members.push(member);
        }

        lattice.bottom = lattice
            .by_types
            .get(&NamerTypeSet::empty())
            .copied()
            .ok_or_else(|| NamingError::IncompleteLattice("missing bottom namer".into()))?;
        lattice.top = lattice
            .by_types
            .get(&used)
            .copied()
            .ok_or_else(|| NamingError::IncompleteLattice("missing top namer".into()))?;

        // Step 1: every member needs its complement
        let mut complements = HashMap::new();
        for member in &lattice.members {
            let types = lattice.namer(*member).types;
            let compl = types.complement(used);
            let id = lattice.by_types.get(&compl).copied().ok_or_else(|| {
                NamingError::IncompleteLattice(format!("missing complement {} of {}", compl, types))
            })?;
            complements.insert(*member, id);
        }

        // Step 2: order relations
        let members = lattice.members.clone();
        for member in &members {
            let types = lattice.namer(*member).types;
            let mut rel = Relations {
                complement: complements[member],
                ..Default::default()
            };
            for other in &members {
                let other_types = lattice.namer(*other).types;
                if other_types == types {
                    continue;
                }
                if other_types.is_superset(types) {
                    rel.upper.push(*other);
                    rel.not_below.push(*other);
                } else if types.is_superset(other_types) {
                    rel.lower.push(*other);
                    rel.not_above.push(*other);
                } else {
                    rel.not_below.push(*other);
                    rel.not_above.push(*other);
                }
            }
            let mut sorted = rel.upper.clone();
            sorted.sort_by(|a, b| lattice.compare(*a, *b));
            rel.sorted_above = sorted;
            lattice.relations.insert(*member, rel);
        }

        lattice.empty_name = lattice.intern(empty, NameKind::Empty)?;
        debug!(
            members = lattice.members.len(),
            namers = lattice.namers.len(),
            used = %used,
            "namer lattice built"
        );
        Ok(lattice)
    }

    fn add_namer(&mut self, types: NamerTypeSet, kind: NamerKind) -> NamerId {
        if let Some(id) = self.structural.get(&kind) {
            return *id;
        }
        let id = NamerId(self.namers.len() as u16);
        self.structural.insert(kind.clone(), id);
        self.namers.push(Namer { id, types, kind });
        id
    }

    fn atomic_namer(&mut self, t: NamerType) -> NamerId {
        let kind = match t {
            NamerType::Type => NamerKind::Type,
            NamerType::Text => NamerKind::Text,
            _ => NamerKind::Index,
        };
        self.add_namer(NamerTypeSet::of(&[t]), kind)
    }

    fn local_base_namer(&mut self, types: NamerTypeSet) -> NamerId {
        let parts: Vec<NamerId> = [NamerType::Type, NamerType::Text, NamerType::Index]
            .into_iter()
            .filter(|t| types.contains(*t))
            .map(|t| self.atomic_namer(t))
            .collect();
        match parts.len() {
            0 => self.add_namer(NamerTypeSet::empty(), NamerKind::Empty),
            1 => parts[0],
            _ => self.add_namer(types.local(), NamerKind::Compound(parts)),
        }
    }

    fn base_namer(&mut self, types: NamerTypeSet) -> NamerId {
        let mut id = self.local_base_namer(types.local());
        if types.contains(NamerType::Parent) {
            id = self.add_namer(types.local().with(NamerType::Parent), NamerKind::Parent(id));
        }
        if types.contains(NamerType::Ancestor) {
            id = self.add_namer(types, NamerKind::Ancestor(id));
        }
        id
    }

    pub fn namer(&self, id: NamerId) -> &Namer {
        &self.namers[id.index()]
    }

    pub fn types(&self, id: NamerId) -> NamerTypeSet {
        self.namers[id.index()].types
    }

    /// All lattice members
    pub fn all(&self) -> &[NamerId] {
        &self.members
    }

    pub fn used(&self) -> NamerTypeSet {
        self.used
    }

    pub fn top(&self) -> NamerId {
        self.top
    }

    pub fn bottom(&self) -> NamerId {
        self.bottom
    }

    pub fn namer_for(&self, types: NamerTypeSet) -> Result<NamerId> {
        self.by_types
            .get(&types)
            .copied()
            .ok_or_else(|| NamingError::UnknownNamer(types.to_string()).into())
    }

    /// {ANCESTOR, INDEX, TYPE, TEXT}
    pub fn full_namer(&self) -> Result<NamerId> {
        self.namer_for(NamerTypeSet::of(&[
            NamerType::Ancestor,
            NamerType::Index,
            NamerType::Type,
            NamerType::Text,
        ]))
    }

    pub fn refines_to(&self, a: NamerId, b: NamerId) -> bool {
        self.types(a).is_superset(self.types(b))
    }

    pub fn join(&self, a: NamerId, b: NamerId) -> Result<NamerId> {
        self.namer_for(self.types(a).union(self.types(b)))
    }

    pub fn meet(&self, a: NamerId, b: NamerId) -> Result<NamerId> {
        self.namer_for(self.types(a).intersection(self.types(b)))
    }

    /// Member reading only the local kinds of `id`
    pub fn local_namer(&self, id: NamerId) -> Result<NamerId> {
        self.namer_for(self.types(id).local())
    }

    pub fn is_local_namer(&self, id: NamerId) -> bool {
        self.types(id).is_local()
    }

    fn relations(&self, id: NamerId) -> Result<&Relations> {
        self.relations
            .get(&id)
            .ok_or_else(|| NamingError::UnknownNamer(self.types(id).to_string()).into())
    }

    /// Strict upper set in comparator order
    pub fn sorted_above(&self, id: NamerId) -> Result<&[NamerId]> {
        Ok(&self.relations(id)?.sorted_above)
    }

    pub fn upper(&self, id: NamerId) -> Result<&[NamerId]> {
        Ok(&self.relations(id)?.upper)
    }

    pub fn lower(&self, id: NamerId) -> Result<&[NamerId]> {
        Ok(&self.relations(id)?.lower)
    }

    pub fn not_above(&self, id: NamerId) -> Result<&[NamerId]> {
        Ok(&self.relations(id)?.not_above)
    }

    pub fn not_below(&self, id: NamerId) -> Result<&[NamerId]> {
        Ok(&self.relations(id)?.not_below)
    }

    pub fn complement(&self, id: NamerId) -> Result<NamerId> {
        Ok(self.relations(id)?.complement)
    }

    /// Namer comparator: type-set size, ordinal sum, then id
    pub fn compare(&self, a: NamerId, b: NamerId) -> Ordering {
        self.types(a).compare(self.types(b)).then_with(|| a.cmp(&b))
    }

    pub fn names(&self) -> &NameCache {
        &self.names
    }

    pub fn name(&self, id: NameId) -> &Name {
        self.names.get(id)
    }

    pub fn empty_name(&self) -> NameId {
        self.empty_name
    }

    /// Restore lookup tables after deserialization
    pub fn reindex(&mut self) {
        self.names.reindex();
    }

    /// Compute the name of `node` under `namer`.
    ///
    /// `assigned` holds the names already given to nodes in the current
    /// naming pass; parent and ancestor namers read them.
    pub fn name_node(
        &mut self,
        namer: NamerId,
        tree: &UiTree,
        node: NodeId,
        assigned: &[Option<NameId>],
    ) -> Result<NameId> {
        let kind = self.namer(namer).kind.clone();
        let n = tree.node(node);
        let name_kind = match kind {
            NamerKind::Empty => NameKind::Empty,
            NamerKind::Type => NameKind::Type {
                class: n.class_name.clone(),
                resource_id: n.resource_id.clone(),
            },
            NamerKind::Text => NameKind::Text {
                text: n.naming_text().to_string(),
                content_desc: n.content_desc.clone(),
            },
            NamerKind::Index => NameKind::Index(n.index),
            NamerKind::Compound(parts) => {
                let mut names = Vec::with_capacity(parts.len());
                for part in parts {
                    names.push(self.name_node(part, tree, node, assigned)?);
                }
                NameKind::Compound(names)
            }
            NamerKind::Parent(local_namer) => {
                let local = self.name_node(local_namer, tree, node, assigned)?;
                let parent = match tree.parent(node) {
                    Some(p) => assigned_name(assigned, p)?,
                    None => self.empty_name,
                };
                NameKind::Parent { parent, local }
            }
            NamerKind::Ancestor(inner) => {
                let local_namer = self.local_namer(inner)?;
                let use_parent = self.types(inner).contains(NamerType::Parent);
                let mut chain = vec![self.name_node(local_namer, tree, node, assigned)?];
                let mut current = tree.parent(node);
                while let Some(p) = current {
                    let ancestor_namer = if use_parent {
                        let assigned_namer = self.name(assigned_name(assigned, p)?).namer;
                        self.local_namer(assigned_namer)?
                    } else {
                        local_namer
                    };
                    chain.push(self.name_node(ancestor_namer, tree, p, assigned)?);
                    current = tree.parent(p);
                }
                chain.reverse();
                NameKind::Ancestor(chain)
            }
            NamerKind::ActionPatch(base) => {
                let base = self.name_node(base, tree, node, assigned)?;
                let mut patch = 0u8;
                if n.enabled {
                    patch |= PATCH_ENABLED;
                }
                if n.clickable {
                    patch |= PATCH_CLICKABLE;
                }
                if n.checkable {
                    patch |= PATCH_CHECKABLE;
                }
                if n.long_clickable {
                    patch |= PATCH_LONG_CLICKABLE;
                }
                if n.scrollable {
                    patch |= PATCH_SCROLLABLE;
                }
                NameKind::ActionPatch {
                    base,
                    patch,
                    scroll: n.scroll_type,
                }
            }
        };
        self.intern(namer, name_kind)
    }

    /// Intern a name, deriving its local name, selector and actions
    pub fn intern(&mut self, namer: NamerId, kind: NameKind) -> Result<NameId> {
        if let Some(id) = self.names.lookup(namer, &kind) {
            return Ok(id);
        }

        // Step 1: intern dependencies before taking an id
        let mut local: Option<NameId> = None;
        let mut actions = Vec::new();
        let (xpath, local_props) = match &kind {
            NameKind::Empty => ("//*".to_string(), String::new()),
            NameKind::Type { class, resource_id } => {
                let props = format!(
                    "[@class=\"{}\"][@resource-id=\"{}\"]",
                    escape_xpath(class),
                    escape_xpath(resource_id)
                );
                (format!("//*{}", props), props)
            }
            NameKind::Text { text, content_desc } => {
                let props = format!(
                    "[@text=\"{}\"][@content-desc=\"{}\"]",
                    escape_xpath(text),
                    escape_xpath(content_desc)
                );
                (format!("//*{}", props), props)
            }
            NameKind::Index(i) => {
                let props = format!("[@index={}]", i);
                (format!("//*{}", props), props)
            }
            NameKind::Compound(parts) => {
                let props: String = parts
                    .iter()
                    .map(|p| self.names.get(*p).local_props.as_str())
                    .collect();
                (format!("//*{}", props), props)
            }
            NameKind::Parent { parent, local: l } => {
                local = Some(*l);
                let parent_name = self.names.get(*parent);
                let prefix = if parent_name.kind.is_empty_name() {
                    String::new()
                } else {
                    parent_name.xpath.clone()
                };
                (
                    format!("{}/*{}", prefix, self.names.get(*l).local_props),
                    String::new(),
                )
            }
            NameKind::Ancestor(chain) => {
                let last = chain
                    .last()
                    .copied()
                    .ok_or_else(|| NamingError::NamingConflict("empty ancestor chain".into()))?;
                local = Some(self.names.get(last).local);
                let xpath: String = chain
                    .iter()
                    .map(|c| format!("/*{}", self.names.get(*c).local_props))
                    .collect();
                (xpath, String::new())
            }
            NameKind::ActionPatch {
                base,
                patch,
                scroll,
            } => {
                actions = decode_actions(*patch, *scroll);
                let base_name = self.names.get(*base);
                let (base_xpath, base_props, base_local) = (
                    base_name.xpath.clone(),
                    base_name.local_props.clone(),
                    base_name.local,
                );
                if base_local != *base {
                    let local_namer = self.local_namer(namer)?;
                    local = Some(self.intern(
                        local_namer,
                        NameKind::ActionPatch {
                            base: base_local,
                            patch: *patch,
                            scroll: *scroll,
                        },
                    )?);
                }
                let suffix = patch_props(*patch);
                (
                    format!("{}{}", base_xpath, suffix),
                    format!("{}{}", base_props, suffix),
                )
            }
        };

        // Step 2: store
        let id = self.names.next_id();
        let name = Name {
            id,
            namer,
            kind,
            local: local.unwrap_or(id),
            xpath,
            local_props,
            actions,
        };
        Ok(self.names.insert(name))
    }

    /// Whether name `a` is at least as fine as name `b`
    pub fn name_refines_to(&self, a: NameId, b: NameId) -> bool {
        if a == b {
            return true;
        }
        let na = self.names.get(a);
        let nb = self.names.get(b);
        match &na.kind {
            NameKind::ActionPatch {
                base,
                patch,
                scroll,
            } => match &nb.kind {
                NameKind::ActionPatch {
                    base: other_base,
                    patch: other_patch,
                    scroll: other_scroll,
                } => {
                    patch == other_patch
                        && scroll == other_scroll
                        && self.name_refines_to(*base, *other_base)
                }
                _ => self.name_refines_to(*base, b),
            },
            NameKind::Compound(parts) => {
                let other_local = self.names.get(nb.local);
                match &other_local.kind {
                    NameKind::Compound(others) => {
                        others.len() <= parts.len() && others.iter().all(|o| parts.contains(o))
                    }
                    NameKind::Empty => true,
                    _ => parts.contains(&other_local.id),
                }
            }
            NameKind::Empty
            | NameKind::Type { .. }
            | NameKind::Text { .. }
            | NameKind::Index(_) => nb.kind.is_empty_name(),
            NameKind::Parent { .. } | NameKind::Ancestor(_) => {
                self.refines_to(na.namer, nb.namer) && self.name_refines_to(na.local, nb.local)
            }
        }
    }
}

fn assigned_name(assigned: &[Option<NameId>], node: NodeId) -> Result<NameId> {
    assigned
        .get(node.index())
        .copied()
        .flatten()
        .ok_or_else(|| NamingError::NamingConflict(format!("parent node {} is not named yet", node.0)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ape_common::{RawNode, RawSnapshot, Rect, TreeOptions};

    fn tree() -> UiTree {
        let mut root = RawNode {
            class_name: "android.widget.FrameLayout".into(),
            enabled: true,
            bounds: Rect::new(0, 0, 100, 100),
            ..Default::default()
        };
        root.children.push(RawNode {
            class_name: "android.widget.Button".into(),
            resource_id: "ok".into(),
            text: "OK".into(),
            enabled: true,
            clickable: true,
            bounds: Rect::new(0, 0, 50, 50),
            ..Default::default()
        });
        UiTree::build(
            &RawSnapshot {
                activity: "A".into(),
                root,
            },
            &TreeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_standard_lattice_sizes() {
        let lattice = NamerLattice::new(true, true).unwrap();
        assert_eq!(lattice.all().len(), 32);
        assert_eq!(lattice.types(lattice.top()).len(), 5);
        assert!(lattice.types(lattice.bottom()).is_empty());

        let small = NamerLattice::new(false, false).unwrap();
        assert_eq!(small.all().len(), 16);
        assert_eq!(small.used().len(), 4);
        assert!(small.full_namer().is_err());
    }

    #[test]
    fn test_incomplete_lattice_rejected() {
        let used = NamerTypeSet::of(&[NamerType::Type, NamerType::Text]);
        let sets = [
            NamerTypeSet::empty(),
            NamerTypeSet::of(&[NamerType::Type]),
            used,
        ];
        let err = NamerLattice::from_type_sets(&sets, used, true).unwrap_err();
        assert!(err.to_string().contains("complement"));

        let dup = [NamerTypeSet::empty(), NamerTypeSet::empty(), used];
        assert!(NamerLattice::from_type_sets(&dup, used, false).is_err());
    }

    #[test]
    fn test_sorted_above_is_ordered_and_strict() {
        let lattice = NamerLattice::new(true, true).unwrap();
        let ty = lattice.namer_for(NamerTypeSet::of(&[NamerType::Type])).unwrap();
        let above = lattice.sorted_above(ty).unwrap();
        assert_eq!(above.len(), 15);
        assert!(above.iter().all(|n| lattice.refines_to(*n, ty) && *n != ty));
        for pair in above.windows(2) {
            assert_ne!(lattice.compare(pair[0], pair[1]), Ordering::Greater);
        }
    }

    #[test]
    fn test_join_meet_local() {
        let lattice = NamerLattice::new(true, true).unwrap();
        let t = lattice.namer_for(NamerTypeSet::of(&[NamerType::Type])).unwrap();
        let p = lattice.namer_for(NamerTypeSet::of(&[NamerType::Parent])).unwrap();
        let tp = lattice.join(t, p).unwrap();
        assert_eq!(
            lattice.types(tp),
            NamerTypeSet::of(&[NamerType::Type, NamerType::Parent])
        );
        assert_eq!(lattice.meet(tp, t).unwrap(), t);
        assert_eq!(lattice.local_namer(tp).unwrap(), t);
        assert_eq!(lattice.complement(lattice.top()).unwrap(), lattice.bottom());
    }

    #[test]
    fn test_naming_is_interned_and_patched() {
        let mut lattice = NamerLattice::new(true, true).unwrap();
        let tree = tree();
        let t = lattice.namer_for(NamerTypeSet::of(&[NamerType::Type])).unwrap();
        let button = NodeId(1);
        let a = lattice.name_node(t, &tree, button, &[]).unwrap();
        let b = lattice.name_node(t, &tree, button, &[]).unwrap();
        assert_eq!(a, b);
        let name = lattice.name(a);
        assert_eq!(name.actions, vec![ape_common::ActionType::ModelClick]);
        assert!(name.xpath.starts_with("//*[@class=\"android.widget.Button\"]"));
        assert!(name.xpath.contains("[@clickable='true']"));
    }

    #[test]
    fn test_parent_name_reads_assigned_parent() {
        let mut lattice = NamerLattice::new(true, true).unwrap();
        let tree = tree();
        let bottom = lattice.bottom();
        let pt = lattice
            .namer_for(NamerTypeSet::of(&[NamerType::Parent, NamerType::Type]))
            .unwrap();
        assert!(lattice.name_node(pt, &tree, NodeId(1), &[None, None]).is_err());

        let root_name = lattice.name_node(bottom, &tree, NodeId::ROOT, &[]).unwrap();
        let assigned = vec![Some(root_name), None];
        let child = lattice.name_node(pt, &tree, NodeId(1), &assigned).unwrap();
        let t = lattice.namer_for(NamerTypeSet::of(&[NamerType::Type])).unwrap();
        let coarse = lattice.name_node(t, &tree, NodeId(1), &assigned).unwrap();
        assert!(lattice.name_refines_to(child, coarse));
        assert!(!lattice.name_refines_to(coarse, child));
        assert!(lattice.name(child).xpath.contains("/*[@class=\"android.widget.Button\"]"));
    }

    #[test]
    fn test_ancestor_chain_runs_from_root() {
        let mut lattice = NamerLattice::new(true, false).unwrap();
        let tree = tree();
        let at = lattice
            .namer_for(NamerTypeSet::of(&[NamerType::Ancestor, NamerType::Type]))
            .unwrap();
        let name = lattice.name_node(at, &tree, NodeId(1), &[]).unwrap();
        match &lattice.name(name).kind {
            NameKind::Ancestor(chain) => assert_eq!(chain.len(), 2),
            other => panic!("unexpected kind {:?}", other),
        }
        let xpath = &lattice.name(name).xpath;
        assert!(xpath.starts_with("/*[@class=\"android.widget.FrameLayout\"]"));
    }

    proptest::proptest! {
        #[test]
        fn test_refinement_matches_superset(a in 0usize..32, b in 0usize..32) {
            let lattice = NamerLattice::new(true, true).unwrap();
            let na = lattice.all()[a];
            let nb = lattice.all()[b];
            let expected = lattice.types(na).is_superset(lattice.types(nb));
            proptest::prop_assert_eq!(lattice.refines_to(na, nb), expected);
            let join = lattice.join(na, nb).unwrap();
            proptest::prop_assert!(lattice.refines_to(join, na) && lattice.refines_to(join, nb));
            let meet = lattice.meet(na, nb).unwrap();
            proptest::prop_assert!(lattice.refines_to(na, meet) && lattice.refines_to(nb, meet));
        }
    }
}
