//! Action-level difference between two states of the same activity

use std::cmp::Ordering;

use ape_common::Result;
use tracing::trace;

use crate::action::{ActionFilter, ActionId, ActionPredicate, ModelAction};
use crate::graph::Graph;
use crate::state::StateId;

fn by_target_and_type(a: &ModelAction, b: &ModelAction) -> Ordering {
    a.target
        .cmp(&b.target)
        .then_with(|| a.action_type.cmp(&b.action_type))
}

/// Unsaturated enabled, valid actions of `to` that are new relative to
/// `from`, or that both states share without either being saturated.
///
/// Without a comparable `from` every unsaturated action of `to` counts.
pub fn unsaturated_actions(graph: &Graph, from: Option<StateId>, to: StateId) -> Result<Vec<ActionId>> {
    let to_state = graph.state(to)?;
    let from_state = match from {
        Some(id) => Some(graph.state(id)?),
        None => None,
    };
    let Some(from_state) = from_state.filter(|f| f.activity() == to_state.activity()) else {
        return Ok(to_state.unsaturated_actions());
    };

    let mut old: Vec<&ModelAction> = from_state.actions().iter().filter(|a| a.requires_target()).collect();
    let mut new: Vec<&ModelAction> = to_state.actions().iter().filter(|a| a.requires_target()).collect();
    old.sort_by(|a, b| by_target_and_type(a, b));
    new.sort_by(|a, b| by_target_and_type(a, b));

    let mut results = Vec::new();
    let mut keep = |action: &ModelAction| {
        if ActionFilter::EnabledValid.include(action) {
            results.push(action.id);
        }
    };
    let (mut i, mut j) = (0, 0);
    let (mut matched, mut deleted) = (0usize, 0usize);
    while i < old.len() && j < new.len() {
        match by_target_and_type(old[i], new[j]) {
            Ordering::Equal => {
                if !(old[i].is_saturated() || new[j].is_saturated()) {
                    keep(new[j]);
                }
                matched += 1;
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                deleted += 1;
                i += 1;
            }
            Ordering::Greater => {
                if !new[j].is_saturated() {
                    keep(new[j]);
                }
                j += 1;
            }
        }
    }
    deleted += old.len() - i;
    for action in &new[j..] {
        if !action.is_saturated() {
            keep(action);
        }
    }
    trace!(matched, deleted, "state actions compared");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::graph_with_states;

    fn validate(graph: &mut Graph, state: StateId) {
        for action in graph.state_mut(state).unwrap().actions_mut() {
            action.valid = true;
        }
    }

    #[test]
    fn test_without_previous_state_all_unsaturated_count() {
        let (mut graph, _, s) = graph_with_states(1);
        validate(&mut graph, s[0]);
        let expected = graph.state(s[0]).unwrap().unsaturated_actions();
        assert_eq!(unsaturated_actions(&graph, None, s[0]).unwrap(), expected);
    }

    #[test]
    fn test_new_targets_are_greedy() {
        let (mut graph, _, s) = graph_with_states(2);
        validate(&mut graph, s[0]);
        validate(&mut graph, s[1]);
        let greedy = unsaturated_actions(&graph, Some(s[0]), s[1]).unwrap();
        assert!(!greedy.is_empty());
        assert!(greedy.iter().all(|a| a.state == s[1]));
        assert!(greedy
            .iter()
            .all(|a| graph.action(*a).unwrap().requires_target()));
    }
}
