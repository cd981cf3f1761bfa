//! Namelets and the naming tree
//!
//! A naming is an ordered list of namelets; together their selectors cover
//! every node of a tree. Namings form a tree of their own: `extend` adds a
//! refining namelet and yields a child naming, `replace_last` swaps the last
//! refining namelet and yields a sibling. Both are memoized, so the same
//! refinement always maps to the same [`NamingId`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ape_common::{NamingError, NodeId, Result, TreeId, UiTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::lattice::NamerLattice;
use crate::name::NameId;
use crate::namer::NamerId;
use crate::result::NamingResult;
use crate::selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamingId(pub u32);

impl NamingId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NamingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Naming[{}]", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameletId(pub u32);

impl NameletId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameletKind {
    Base,
    Refine,
}

/// Selector plus the namer applied to the nodes it selects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namelet {
    pub id: NameletId,
    pub kind: NameletKind,
    pub selector: Selector,
    pub namer: NamerId,
    pub parent: Option<NameletId>,
    pub depth: u32,
}

impl Namelet {
    pub fn is_base(&self) -> bool {
        self.kind == NameletKind::Base
    }

    pub fn is_refine(&self) -> bool {
        self.kind == NameletKind::Refine
    }

    /// Content equality, ignoring identity and position
    pub fn same_content(&self, other: &Namelet) -> bool {
        self.kind == other.kind && self.selector == other.selector && self.namer == other.namer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct ChildKey {
    parent_namelet: NameletId,
    expr: String,
    namer: NamerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Naming {
    pub id: NamingId,
    pub parent: Option<NamingId>,
    pub namelets: Vec<NameletId>,
    /// Largest type-set size over the namelets
    pub fineness: usize,
    children: HashMap<ChildKey, NamingId>,
}

impl Naming {
    pub fn size(&self) -> usize {
        self.namelets.len()
    }

    pub fn last_namelet(&self) -> Option<NameletId> {
        self.namelets.last().copied()
    }

    pub fn contains(&self, namelet: NameletId) -> bool {
        self.namelets.contains(&namelet)
    }

    pub fn children(&self) -> impl Iterator<Item = NamingId> + '_ {
        self.children.values().copied()
    }
}

/// Description of a namelet used when building root namings
#[derive(Debug, Clone)]
pub struct NameletSpec {
    pub kind: NameletKind,
    pub expr: String,
    pub namer: NamerId,
    /// Index into the spec list of the parent namelet
    pub parent: Option<usize>,
}

/// Arena of namelets and namings plus the per-tree result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingTree {
    namelets: Vec<Namelet>,
    namings: Vec<Naming>,
    top: NamingId,
    bottom: NamingId,
    base: NamingId,
    #[serde(skip)]
    results: HashMap<(NamingId, TreeId), Arc<NamingResult>>,
}

impl NamingTree {
    pub(crate) fn empty() -> Self {
        Self {
            namelets: Vec::new(),
            namings: Vec::new(),
            top: NamingId(0),
            bottom: NamingId(0),
            base: NamingId(0),
            results: HashMap::new(),
        }
    }

    pub(crate) fn set_sentinels(&mut self, top: NamingId, bottom: NamingId, base: NamingId) {
        self.top = top;
        self.bottom = bottom;
        self.base = base;
    }

    pub fn top(&self) -> NamingId {
        self.top
    }

    pub fn bottom(&self) -> NamingId {
        self.bottom
    }

    pub fn base(&self) -> NamingId {
        self.base
    }

    pub fn naming(&self, id: NamingId) -> &Naming {
        &self.namings[id.index()]
    }

    pub fn namelet(&self, id: NameletId) -> &Namelet {
        &self.namelets[id.index()]
    }

    pub fn len(&self) -> usize {
        self.namings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namings.is_empty()
    }

    pub fn parent(&self, id: NamingId) -> Option<NamingId> {
        self.naming(id).parent
    }

    pub fn fineness(&self, id: NamingId) -> usize {
        self.naming(id).fineness
    }

    /// State-count bound for candidates of `naming`
    pub fn max_states_for_refinement(&self, lattice: &NamerLattice, id: NamingId) -> usize {
        let used = lattice.used().len();
        let diff = used.saturating_sub(self.fineness(id)) as u32;
        let bound = 2usize.checked_shl(diff).unwrap_or(usize::MAX);
        bound.clamp(1, ape_common::MAX_REFINEMENT_STATES)
    }

    /// Whether `ancestor` is a strict ancestor of `descendant`
    pub fn is_ancestor(&self, ancestor: NamingId, descendant: NamingId) -> bool {
        let mut current = self.parent(descendant);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    /// Namings from `id` up to its root, `id` first
    pub fn chain(&self, id: NamingId) -> Vec<NamingId> {
        let mut out = vec![id];
        let mut current = self.parent(id);
        while let Some(n) = current {
            out.push(n);
            current = self.parent(n);
        }
        out
    }

    /// Same namelet contents regardless of identity
    pub fn equivalent(&self, a: NamingId, b: NamingId) -> bool {
        let na = self.naming(a);
        let nb = self.naming(b);
        if na.size() != nb.size() {
            return false;
        }
        let covers = |x: &Naming, y: &Naming| {
            x.namelets.iter().all(|l| {
                y.namelets
                    .iter()
                    .any(|r| self.namelet(*l).same_content(self.namelet(*r)))
            })
        };
        covers(na, nb) && covers(nb, na)
    }

    pub fn is_replaceable(&self, naming: NamingId, namelet: NameletId) -> bool {
        self.namelet(namelet).is_refine() && self.naming(naming).last_namelet() == Some(namelet)
    }

    fn add_namelet(
        &mut self,
        kind: NameletKind,
        selector: Selector,
        namer: NamerId,
        parent: Option<NameletId>,
    ) -> NameletId {
        let id = NameletId(self.namelets.len() as u32);
        let depth = parent.map(|p| self.namelet(p).depth + 1).unwrap_or(0);
        self.namelets.push(Namelet {
            id,
            kind,
            selector,
            namer,
            parent,
            depth,
        });
        id
    }

    fn add_naming(
        &mut self,
        lattice: &NamerLattice,
        parent: Option<NamingId>,
        namelets: Vec<NameletId>,
    ) -> NamingId {
        let id = NamingId(self.namings.len() as u32);
        let fineness = namelets
            .iter()
            .map(|l| lattice.types(self.namelet(*l).namer).len())
            .max()
            .unwrap_or(0);
        self.namings.push(Naming {
            id,
            parent,
            namelets,
            fineness,
            children: HashMap::new(),
        });
        id
    }

    /// Create a parentless naming from namelet descriptions
    pub fn create_root(&mut self, lattice: &NamerLattice, specs: &[NameletSpec]) -> Result<NamingId> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let selector = Selector::parse(&spec.expr)?;
            let parent = match spec.parent {
                Some(i) => Some(*ids.get(i).ok_or_else(|| {
                    NamingError::NamingConflict(format!("namelet parent {} is not declared yet", i))
                })?),
                None => None,
            };
            ids.push(self.add_namelet(spec.kind, selector, spec.namer, parent));
        }
        Ok(self.add_naming(lattice, None, ids))
    }

    /// Child naming with one more refining namelet below `parent_namelet`
    #[instrument(level = "debug", skip(self, lattice, selector), fields(selector = %selector))]
    pub fn extend(
        &mut self,
        lattice: &NamerLattice,
        naming: NamingId,
        parent_namelet: NameletId,
        selector: Selector,
        namer: NamerId,
    ) -> Result<NamingId> {
        if !self.naming(naming).contains(parent_namelet) {
            return Err(NamingError::NotContained { naming: naming.0 }.into());
        }
        if !lattice.refines_to(namer, self.namelet(parent_namelet).namer) {
            return Err(NamingError::NotRefinement.into());
        }
        let key = ChildKey {
            parent_namelet,
            expr: selector.as_str().to_string(),
            namer,
        };
        if let Some(child) = self.naming(naming).children.get(&key) {
            return Ok(*child);
        }

        let namelet = self.add_namelet(NameletKind::Refine, selector, namer, Some(parent_namelet));
        let mut namelets = self.naming(naming).namelets.clone();
        namelets.push(namelet);
        let child = self.add_naming(lattice, Some(naming), namelets);
        self.namings[naming.index()].children.insert(key, child);
        debug!(parent = %naming, child = %child, "naming extended");
        Ok(child)
    }

    /// Sibling naming whose last namelet uses `namer` instead
    pub fn replace_last(
        &mut self,
        lattice: &NamerLattice,
        naming: NamingId,
        replaced: NameletId,
        namer: NamerId,
    ) -> Result<NamingId> {
        if !self.is_replaceable(naming, replaced) {
            return Err(NamingError::NotReplaceable(format!(
                "namelet {} is not the last refining namelet of {}",
                replaced.0, naming
            ))
            .into());
        }
        let parent_naming = self
            .parent(naming)
            .ok_or_else(|| NamingError::NotReplaceable(format!("{} has no parent", naming)))?;
        let old = self.namelet(replaced);
        let parent_namelet = old
            .parent
            .ok_or_else(|| NamingError::NotReplaceable("refining namelet has no parent".into()))?;
        let selector = old.selector.clone();
        self.extend(lattice, parent_naming, parent_namelet, selector, namer)
    }

    fn select_namelet(&self, node: NodeId, candidates: &mut [NameletId]) -> Result<NameletId> {
        match candidates.len() {
            0 => Err(NamingError::NoNamelet { node: node.0 }.into()),
            1 => {
                let only = candidates[0];
                if self.namelet(only).is_base() {
                    Ok(only)
                } else {
                    Err(NamingError::AmbiguousNamelet { node: node.0 }.into())
                }
            }
            _ => {
                candidates.sort_by(|a, b| {
                    let (la, lb) = (self.namelet(*a), self.namelet(*b));
                    la.depth
                        .cmp(&lb.depth)
                        .then_with(|| la.selector.as_str().cmp(lb.selector.as_str()))
                });
                for id in candidates.iter().rev() {
                    let mut parent = self.namelet(*id).parent;
                    let mut complete = true;
                    while let Some(p) = parent {
                        if !candidates.contains(&p) {
                            complete = false;
                            break;
                        }
                        parent = self.namelet(p).parent;
                    }
                    if complete {
                        return Ok(*id);
                    }
                }
                Err(NamingError::AmbiguousNamelet { node: node.0 }.into())
            }
        }
    }

    fn compute(
        &self,
        lattice: &mut NamerLattice,
        naming: NamingId,
        tree: &UiTree,
    ) -> Result<NamingResult> {
        // Step 1: evaluate selectors
        let mut candidates: Vec<Vec<NameletId>> = vec![Vec::new(); tree.len()];
        for namelet in &self.naming(naming).namelets {
            for node in self.namelet(*namelet).selector.select(tree) {
                candidates[node.index()].push(*namelet);
            }
        }

        // Step 2: name breadth-first so parents are named before children
        let mut assigned: Vec<Option<NameId>> = vec![None; tree.len()];
        let mut namelets: Vec<Option<NameletId>> = vec![None; tree.len()];
        for node in tree.breadth_first() {
            let namelet = self.select_namelet(node, &mut candidates[node.index()])?;
            let namer = self.namelet(namelet).namer;
            let name = lattice.name_node(namer, tree, node, &assigned)?;
            assigned[node.index()] = Some(name);
            namelets[node.index()] = Some(namelet);
        }

        let node_names: Option<Vec<NameId>> = assigned.into_iter().collect();
        let node_namelets: Option<Vec<NameletId>> = namelets.into_iter().collect();
        match (node_names, node_namelets) {
            (Some(names), Some(namelets)) => Ok(NamingResult::new(names, namelets)),
            _ => Err(NamingError::NamingConflict("tree has unreachable nodes".into()).into()),
        }
    }

    /// Names of every node of `tree` under `naming`, cached per tree
    pub fn naming_result(
        &mut self,
        lattice: &mut NamerLattice,
        naming: NamingId,
        tree_id: TreeId,
        tree: &UiTree,
    ) -> Result<Arc<NamingResult>> {
        if let Some(result) = self.results.get(&(naming, tree_id)) {
            return Ok(result.clone());
        }
        let result = Arc::new(self.compute(lattice, naming, tree)?);
        debug!(
            naming = %naming,
            tree = %tree_id,
            names = result.name_count(),
            nodes = result.node_count(),
            "naming computed"
        );
        self.results.insert((naming, tree_id), result.clone());
        Ok(result)
    }

    /// Drop cached results of a removed tree
    pub fn release(&mut self, tree_id: TreeId) {
        self.results.retain(|(_, t), _| *t != tree_id);
    }

    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    /// Namelets of `naming` whose namer is `namer`
    pub fn namelets_with_namer(&self, naming: NamingId, namer: NamerId) -> Vec<NameletId> {
        self.naming(naming)
            .namelets
            .iter()
            .copied()
            .filter(|l| self.namelet(*l).namer == namer)
            .collect()
    }

    /// Log the namelets of a naming
    pub fn dump(&self, lattice: &NamerLattice, naming: NamingId) {
        let n = self.naming(naming);
        debug!(naming = %naming, parent = ?n.parent, fineness = n.fineness, "naming");
        for (i, l) in n.namelets.iter().enumerate() {
            let namelet = self.namelet(*l);
            debug!(
                "{:3}. [{:03}][{:?}] {} -> {}",
                i,
                namelet.depth,
                namelet.kind,
                namelet.selector,
                lattice.namer(namelet.namer)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::BaseNaming;
    use crate::namer::{NamerType, NamerTypeSet};
    use ape_common::{RawNode, RawSnapshot, Rect, TreeOptions};

    fn raw(class: &str, text: &str, clickable: bool) -> RawNode {
        RawNode {
            class_name: class.into(),
            text: text.into(),
            clickable,
            enabled: true,
            bounds: Rect::new(0, 0, 10, 10),
            ..Default::default()
        }
    }

    fn tree() -> UiTree {
        let mut root = raw("android.widget.FrameLayout", "", false);
        root.children.push(raw("android.widget.Button", "OK", true));
        root.children.push(raw("android.widget.Button", "Cancel", true));
        root.children.push(raw("android.widget.TextView", "hello", false));
        let options = TreeOptions {
            patch_clickable_containers: false,
            ..TreeOptions::default()
        };
        UiTree::build(
            &RawSnapshot {
                activity: "A".into(),
                root,
            },
            &options,
        )
        .unwrap()
    }

    fn setup() -> (NamerLattice, NamingTree) {
        let lattice = NamerLattice::new(true, true).unwrap();
        let tree = NamingTree::new(&lattice, BaseNaming::ActionType).unwrap();
        (lattice, tree)
    }

    #[test]
    fn test_base_naming_partitions_tree() {
        let (mut lattice, mut namings) = setup();
        let tree = tree();
        let base = namings.base();
        let result = namings
            .naming_result(&mut lattice, base, TreeId(0), &tree)
            .unwrap();
        assert_eq!(result.node_count(), 4);
        // Both buttons share a type name, root and text view share the bottom name
        assert_eq!(result.name_count(), 2);
        assert_eq!(namings.cached_results(), 1);
        namings.release(TreeId(0));
        assert_eq!(namings.cached_results(), 0);
    }

    #[test]
    fn test_extend_and_replace_are_memoized() {
        let (mut lattice, mut namings) = setup();
        let tree = tree();
        let base = namings.base();
        let type_namelet = namings.naming(base).namelets[0];
        let tt = lattice
            .namer_for(NamerTypeSet::of(&[NamerType::Type, NamerType::Text]))
            .unwrap();
        let selector = Selector::parse("//*[@class='android.widget.Button']").unwrap();
        let child = namings
            .extend(&lattice, base, type_namelet, selector.clone(), tt)
            .unwrap();
        let again = namings
            .extend(&lattice, base, type_namelet, selector, tt)
            .unwrap();
        assert_eq!(child, again);
        assert!(namings.is_ancestor(base, child));
        assert!(namings.fineness(child) > namings.fineness(base));

        let result = namings
            .naming_result(&mut lattice, child, TreeId(0), &tree)
            .unwrap();
        assert_eq!(result.name_count(), 3);

        let last = namings.naming(child).last_namelet().unwrap();
        let tidx = lattice
            .namer_for(NamerTypeSet::of(&[NamerType::Type, NamerType::Index]))
            .unwrap();
        let sibling = namings.replace_last(&lattice, child, last, tidx).unwrap();
        assert_ne!(sibling, child);
        assert_eq!(namings.parent(sibling), Some(base));
        assert!(!namings.equivalent(sibling, child));
    }

    #[test]
    fn test_extend_rejects_coarser_namer() {
        let (lattice, mut namings) = setup();
        let base = namings.base();
        let type_namelet = namings.naming(base).namelets[0];
        let err = namings
            .extend(&lattice, base, type_namelet, Selector::any(), lattice.bottom())
            .unwrap_err();
        assert!(matches!(err, ape_common::ApeError::Naming(NamingError::NotRefinement)));
        assert!(namings
            .replace_last(&lattice, base, type_namelet, lattice.top())
            .is_err());
    }

    #[test]
    fn test_refinement_threshold() {
        let (lattice, namings) = setup();
        assert_eq!(namings.max_states_for_refinement(&lattice, namings.bottom()), 8);
        assert_eq!(namings.max_states_for_refinement(&lattice, namings.top()), 2);
        // One type kind in the base naming: 2 << 4 is capped
        assert_eq!(namings.max_states_for_refinement(&lattice, namings.base()), 8);
    }

    #[test]
    fn test_uncovered_node_is_an_error() {
        let lattice = NamerLattice::new(true, true).unwrap();
        let mut lattice_mut = lattice.clone();
        let mut namings = NamingTree::new(&lattice, BaseNaming::Top).unwrap();
        let spec = NameletSpec {
            kind: NameletKind::Base,
            expr: "//*[@clickable='true']".into(),
            namer: lattice.bottom(),
            parent: None,
        };
        let partial = namings.create_root(&lattice, &[spec]).unwrap();
        let err = namings
            .naming_result(&mut lattice_mut, partial, TreeId(1), &tree())
            .unwrap_err();
        assert!(err.to_string().contains("No namelet"));
    }
}
