//! States
//!
//! A state owns the actions derived from its key: one action per action
//! type each widget name carries, then the back action. Actions never change
//! after construction; only their resolution and statistics do.

use std::fmt;

use ape_common::{ActionType, GraphError, Result, TreeId};
use ape_naming::{NameId, NamerLattice};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::action::{ActionFilter, ActionId, ActionPredicate, ModelAction};
use crate::state_key::StateKey;
use crate::transition::TransitionId;
use crate::visit::VisitStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl StateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub label: String,
    key: StateKey,
    actions: Vec<ModelAction>,
    /// Widgets carrying at least one action
    actionable: usize,
    trees: Vec<TreeId>,
    pub visits: VisitStats,
    pub(crate) in_edges: Vec<TransitionId>,
    pub(crate) out_edges: Vec<TransitionId>,
}

impl State {
    pub fn new(id: StateId, label: String, key: StateKey, lattice: &NamerLattice) -> Self {
        let mut actions = Vec::new();
        let mut actionable = 0;
        for widget in key.widgets() {
            let name = lattice.name(*widget);
            if !name.actions.is_empty() {
                actionable += 1;
            }
            for action_type in &name.actions {
                let index = actions.len() as u32;
                actions.push(ModelAction::new(
                    ActionId { state: id, index },
                    Some(*widget),
                    *action_type,
                ));
            }
        }
        let index = actions.len() as u32;
        actions.push(ModelAction::new(
            ActionId { state: id, index },
            None,
            ActionType::ModelBack,
        ));
        Self {
            id,
            label,
            key,
            actions,
            actionable,
            trees: Vec::new(),
            visits: VisitStats::default(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn activity(&self) -> &str {
        self.key.activity()
    }

    pub fn widget_count(&self) -> usize {
        self.key.widgets().len()
    }

    pub fn actions(&self) -> &[ModelAction] {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut [ModelAction] {
        &mut self.actions
    }

    pub fn action(&self, id: ActionId) -> Result<&ModelAction> {
        self.actions
            .get(id.index as usize)
            .filter(|_| id.state == self.id)
            .ok_or_else(|| {
                GraphError::UnknownAction {
                    state: id.state.0,
                    action: id.index,
                }
                .into()
            })
    }

    pub fn action_mut(&mut self, id: ActionId) -> Result<&mut ModelAction> {
        let state = self.id;
        self.actions
            .get_mut(id.index as usize)
            .filter(|_| id.state == state)
            .ok_or_else(|| {
                GraphError::UnknownAction {
                    state: id.state.0,
                    action: id.index,
                }
                .into()
            })
    }

    pub fn back_action(&self) -> &ModelAction {
        // the back action is always last
        &self.actions[self.actions.len() - 1]
    }

    pub fn in_edges(&self) -> &[TransitionId] {
        &self.in_edges
    }

    pub fn out_edges(&self) -> &[TransitionId] {
        &self.out_edges
    }

    /// Targeted action on `widget` of type `action_type`
    pub fn get_action(&self, widget: NameId, action_type: ActionType) -> Result<ActionId> {
        self.actions
            .iter()
            .find(|a| a.target == Some(widget) && a.action_type == action_type)
            .map(|a| a.id)
            .ok_or_else(|| {
                GraphError::NoSuchAction {
                    state: self.id.0,
                    action_type: format!("{}@{}", action_type.as_str(), widget),
                }
                .into()
            })
    }

    /// Untargeted action of type `action_type`
    pub fn get_untargeted(&self, action_type: ActionType) -> Result<ActionId> {
        self.actions
            .iter()
            .find(|a| a.target.is_none() && a.action_type == action_type)
            .map(|a| a.id)
            .ok_or_else(|| {
                GraphError::NoSuchAction {
                    state: self.id.0,
                    action_type: action_type.as_str().to_string(),
                }
                .into()
            })
    }

    pub fn trees(&self) -> &[TreeId] {
        &self.trees
    }

    pub fn latest_tree(&self) -> Option<TreeId> {
        self.trees.last().copied()
    }

    pub(crate) fn append_tree(&mut self, tree: TreeId) {
        self.trees.push(tree);
    }

    /// Drop the tree before the latest one, used after a refreshed snapshot
    pub fn remove_last_last_tree(&mut self) -> Option<TreeId> {
        if self.trees.len() <= 1 {
            return None;
        }
        let index = self.trees.len() - 2;
        Some(self.trees.remove(index))
    }

    pub fn is_trivial(&self, widget_threshold: usize, action_threshold: usize) -> bool {
        self.widget_count() <= widget_threshold || self.actionable <= action_threshold
    }

    pub fn is_saturated(&self) -> bool {
        self.actions
            .iter()
            .filter(|a| ActionFilter::EnabledValid.include(a))
            .all(|a| a.is_saturated())
    }

    pub fn saturation(&self) -> f32 {
        if self.actions.is_empty() {
            return 1.0;
        }
        let total: f32 = self.actions.iter().map(|a| a.resolved_saturation()).sum();
        total / self.actions.len() as f32
    }

    pub fn is_back_enabled(&self) -> bool {
        ActionFilter::EnabledValid.include(self.back_action())
    }

    pub fn collect_actions(&self, filter: &impl ActionPredicate) -> Vec<ActionId> {
        self.actions
            .iter()
            .filter(|a| filter.include(a))
            .map(|a| a.id)
            .collect()
    }

    pub fn targeted_actions(&self) -> Vec<ActionId> {
        self.collect_actions(&ActionFilter::WithTarget)
    }

    pub fn unsaturated_actions(&self) -> Vec<ActionId> {
        self.collect_actions(&ActionFilter::EnabledValidUnsaturated)
    }

    pub fn count_actions(&self, filter: &impl ActionPredicate, include_back: bool) -> usize {
        self.actions
            .iter()
            .filter(|a| include_back || !a.is_back())
            .filter(|a| filter.include(a))
            .count()
    }

    pub fn first_action(&self, filter: &impl ActionPredicate) -> Option<ActionId> {
        self.actions.iter().find(|a| filter.include(a)).map(|a| a.id)
    }

    pub fn greedy_pick_least_visited(&self, filter: &impl ActionPredicate) -> Option<ActionId> {
        let mut best: Option<&ModelAction> = None;
        for action in self.actions.iter().filter(|a| filter.include(a)) {
            if best.map_or(true, |b| action.visits.count < b.visits.count) {
                best = Some(action);
            }
        }
        best.map(|a| a.id)
    }

    /// Priority-weighted random pick; every included action needs a positive priority
    pub fn randomly_pick_action<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        filter: &impl ActionPredicate,
        include_back: bool,
    ) -> Result<Option<ActionId>> {
        let candidates: Vec<&ModelAction> = self
            .actions
            .iter()
            .filter(|a| include_back || !a.is_back())
            .filter(|a| filter.include(a))
            .collect();
        let mut total: i64 = 0;
        for action in &candidates {
            if action.priority <= 0 {
                return Err(GraphError::InvalidTransition(format!(
                    "action {} has non-positive priority {}",
                    action.label, action.priority
                ))
                .into());
            }
            total += action.priority as i64;
        }
        if total == 0 {
            return Ok(None);
        }
        let mut index = rng.gen_range(0..total);
        for action in candidates {
            let priority = action.priority as i64;
            if priority > index {
                return Ok(Some(action.id));
            }
            index -= priority;
        }
        Ok(None)
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for State {}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}[A={}]", self.label, self.key, self.actions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{list_tree, name_tree};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state() -> State {
        let (mut lattice, mut namings) = name_tree();
        let ui = list_tree("A", &["a", "b"]);
        let base = namings.base();
        let result = namings
            .naming_result(&mut lattice, base, TreeId(0), &ui)
            .unwrap();
        let key = StateKey::from_result("A", base, &result);
        State::new(StateId(0), "g0s0".into(), key, &lattice)
    }

    #[test]
    fn test_back_action_is_last() {
        let s = state();
        assert!(s.back_action().is_back());
        assert_eq!(s.actions().iter().filter(|a| a.is_back()).count(), 1);
        assert!(s.actions().len() > 1);
    }

    #[test]
    fn test_get_action() {
        let s = state();
        let clickable = s
            .actions()
            .iter()
            .find(|a| a.action_type == ActionType::ModelClick)
            .unwrap();
        let target = clickable.target.unwrap();
        assert_eq!(
            s.get_action(target, ActionType::ModelClick).unwrap(),
            clickable.id
        );
        assert!(s.get_action(target, ActionType::ModelScrollLeftRight).is_err());
        assert_eq!(
            s.get_untargeted(ActionType::ModelBack).unwrap(),
            s.back_action().id
        );
    }

    #[test]
    fn test_random_pick_respects_priority() {
        let mut s = state();
        for a in s.actions_mut() {
            a.valid = true;
            a.priority = if a.is_back() { 1 } else { 0 };
        }
        let mut rng = StdRng::seed_from_u64(7);
        assert!(s
            .randomly_pick_action(&mut rng, &ActionFilter::EnabledValid, false)
            .is_err());
        let picked = s
            .randomly_pick_action(&mut rng, &ActionFilter::EnabledValid, true)
            .unwrap_err();
        assert!(picked.to_string().contains("priority"));

        for a in s.actions_mut() {
            a.priority = if a.is_back() { 0 } else { 3 };
        }
        for _ in 0..20 {
            let id = s
                .randomly_pick_action(&mut rng, &ActionFilter::EnabledValid, false)
                .unwrap()
                .unwrap();
            assert!(!s.action(id).unwrap().is_back());
        }
    }

    #[test]
    fn test_least_visited() {
        let mut s = state();
        for a in s.actions_mut() {
            a.valid = true;
            a.visits.visited_at(1);
        }
        let last = s.actions().len() - 2;
        s.actions_mut()[last].visits.reset();
        let picked = s
            .greedy_pick_least_visited(&ActionFilter::EnabledValid)
            .unwrap();
        assert_eq!(picked.index as usize, last);
    }

    #[test]
    fn test_remove_last_last_tree() {
        let mut s = state();
        assert_eq!(s.remove_last_last_tree(), None);
        s.append_tree(TreeId(1));
        s.append_tree(TreeId(2));
        assert_eq!(s.remove_last_last_tree(), Some(TreeId(1)));
        assert_eq!(s.trees(), &[TreeId(2)]);
    }
}
