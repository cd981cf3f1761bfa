//! SATA selection policy
//!
//! Cascade, first hit wins:
//!
//! ```text
//!   buffer ─► ABA / greedy forward ─► trivial activity ─► greedy backward
//!          ─► epsilon-greedy ─► null handling
//! ```
//!
//! A *greedy* state still has targeted actions nobody has tried under
//! their name. The policy prefers reaching such states through strong
//! edges and falls back to least-visited picks once the graph is
//! saturated.

use std::collections::BTreeSet;

use ape_common::Result;
use ape_model::{
    differ, ActionFilter, ActionId, ActionPredicate, FnFilter, Graph, ModelAction, StateId,
    StateTransition, Subsequence, SubsequenceFilter,
};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use super::{AgentEvent, Selection, StatefulAgent, Strategy};
use crate::device::SnapshotSource;

/// In-degree above which a state counts as a dialog
const DIALOG_IN_EDGE_THRESHOLD: usize = 5;

pub struct SataStrategy {
    epsilon: f64,
}

impl SataStrategy {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }
}

/// Targeted actions of `to` worth a greedy visit
fn greedy_actions(graph: &Graph, from: Option<StateId>, to: StateId, use_differ: bool) -> Vec<ActionId> {
    if use_differ {
        return differ::unsaturated_actions(graph, from, to).unwrap_or_default();
    }
    let Ok(state) = graph.state(to) else {
        return Vec::new();
    };
    state.collect_actions(&|a: &ModelAction| {
        if !ActionFilter::EnabledValid.include(a) || !a.requires_target() {
            return false;
        }
        if a.action_type.is_scroll() {
            return a.is_unvisited();
        }
        graph.is_action_unvisited_by_name(a)
    })
}

fn is_greedy_state(graph: &Graph, from: Option<StateId>, to: StateId, use_differ: bool) -> bool {
    !greedy_actions(graph, from, to, use_differ).is_empty()
}

fn edge_is_forward_candidate(graph: &Graph, edge: &StateTransition, back: bool) -> bool {
    let Ok(action) = graph.action(edge.action) else {
        return false;
    };
    action.is_back() == back && ActionFilter::EnabledValid.include(action) && edge.is_strong()
}

/// Forward paths over strong edges ending in a greedy state
fn greedy_filter(use_differ: bool) -> impl SubsequenceFilter {
    FnFilter::new(
        |graph: &Graph, path: &Subsequence, edge: &StateTransition| {
            !path.is_closed() && edge_is_forward_candidate(graph, edge, false)
        },
        move |graph: &Graph, path: &Subsequence| {
            !path.is_empty()
                && is_greedy_state(graph, Some(path.last_last_state()), path.last_state(), use_differ)
        },
    )
}

/// Back-only paths ending in a greedy or entry state
fn backtrack_filter(use_differ: bool) -> impl SubsequenceFilter {
    FnFilter::new(
        |graph: &Graph, path: &Subsequence, edge: &StateTransition| {
            !path.is_closed() && edge_is_forward_candidate(graph, edge, true)
        },
        move |graph: &Graph, path: &Subsequence| {
            if path.is_empty() {
                return false;
            }
            let last = path.last_state();
            is_greedy_state(graph, None, last, use_differ) || graph.is_entry_state(last)
        },
    )
}

fn has_greedy_action_forward(graph: &Graph, state: StateId, use_differ: bool, max_len: usize) -> bool {
    if is_greedy_state(graph, None, state, use_differ) {
        return true;
    }
    !graph
        .find_shortest_paths(state, &greedy_filter(use_differ), max_len)
        .is_empty()
}

fn is_dialog_state(graph: &Graph, state: StateId, use_differ: bool, max_len: usize) -> bool {
    if graph.in_edges(state).len() <= DIALOG_IN_EDGE_THRESHOLD {
        return false;
    }
    has_greedy_action_forward(graph, state, use_differ, max_len)
}

fn activity_visits(graph: &Graph, activity: &str) -> u32 {
    graph.activity(activity).map_or(0, |a| a.visits.count)
}

/// Whether moving from `from` to `to` goes from hot to cold
fn do_aba(graph: &Graph, from: StateId, to: StateId, use_differ: bool, max_len: usize) -> bool {
    if is_dialog_state(graph, to, use_differ, max_len) {
        debug!(state = %to, "never move to a saturated dialog in ABA");
        return false;
    }
    let (Ok(a), Ok(b)) = (graph.state(from), graph.state(to)) else {
        return false;
    };
    if a.activity() == b.activity() {
        return b.visits.count < a.visits.count;
    }
    activity_visits(graph, b.activity()) < activity_visits(graph, a.activity())
}

/// Activities with few states and low coverage among the colder half
fn is_trivial_by_coverage(states: usize, visits: u32, visited_rate: f32, state_threshold: usize) -> bool {
    if visits as usize <= states >> 2 {
        return true;
    }
    let limit = if states < state_threshold { 0.8 } else { 0.5 };
    visited_rate <= limit
}

impl SataStrategy {
    fn use_differ(agent: &StatefulAgent) -> bool {
        agent.settings().use_action_differ
    }

    fn max_len(agent: &StatefulAgent) -> usize {
        agent.settings().max_path_length
    }

    fn disable_restart_if_unvisited(agent: &mut StatefulAgent, id: ActionId) -> Result<()> {
        let graph = agent.model().graph();
        if graph.is_action_unvisited_by_name(graph.action(id)?) {
            agent.disable_restart();
        }
        Ok(())
    }

    /// Walk A → B → A: return to the previous state if it is colder, stopping
    /// at the coldest greedy state on the way
    fn select_aba(&mut self, agent: &mut StatefulAgent) -> Result<Option<ActionId>> {
        let Some(b) = agent.current_state() else {
            return Ok(None);
        };
        let a = agent.new_state()?;
        let (use_differ, max_len) = (Self::use_differ(agent), Self::max_len(agent));
        let graph = agent.model().graph();
        if !do_aba(graph, a, b, use_differ, max_len) {
            return Ok(None);
        }
        let mut forward = graph.move_to_state(a, b, false, max_len);
        if forward.is_empty() || graph.move_to_state(b, a, true, max_len).is_empty() {
            return Ok(None);
        }
        forward.sort_by_key(|p| p.len());
        let path = &forward[0];

        let mut best: Option<(usize, StateId)> = None;
        let mut source = path.start;
        for (i, step) in path.steps().iter().enumerate() {
            let target = step.target;
            if !do_aba(graph, source, target, use_differ, max_len) {
                break;
            }
            if is_greedy_state(graph, Some(source), target, use_differ) {
                let colder = match best {
                    None => true,
                    Some((_, last)) => {
                        let (t, l) = (graph.state(target)?, graph.state(last)?);
                        if t.activity() == l.activity() {
                            t.visits.count < l.visits.count
                        } else {
                            activity_visits(graph, t.activity()) < activity_visits(graph, l.activity())
                        }
                    }
                };
                if colder {
                    best = Some((i, target));
                }
            }
            source = target;
        }
        let Some((index, target)) = best else {
            return Ok(None);
        };
        let path = path.truncated(index + 1);
        info!(from = %a, to = %target, steps = path.len(), "ABA");
        agent.refill_buffer(&path)
    }

    fn select_greedy_forward(&mut self, agent: &mut StatefulAgent) -> Result<Option<ActionId>> {
        let new_state = agent.new_state()?;
        let (use_differ, max_len) = (Self::use_differ(agent), Self::max_len(agent));
        let current = agent.current_state();

        let graph = agent.model().graph();
        let weighted: Vec<(ActionId, i32)> = greedy_actions(graph, current, new_state, use_differ)
            .into_iter()
            .filter_map(|id| graph.action(id).ok().map(|a| (id, a.priority.max(1))))
            .collect();
        if let Ok(&(id, _)) = weighted.choose_weighted(agent.rng(), |(_, p)| *p) {
            Self::disable_restart_if_unvisited(agent, id)?;
            return Ok(Some(id));
        }

        let graph = agent.model().graph();
        let state = graph.state(new_state)?;
        for action in state.actions().iter().filter(|a| a.requires_target()) {
            if !ActionFilter::EnabledValidUnvisited.include(action) {
                continue;
            }
            if let Some(target) = graph.name_global_target(action) {
                if is_greedy_state(graph, Some(new_state), target, use_differ) {
                    return Ok(Some(action.id));
                }
            }
        }

        let mut paths = graph.find_shortest_paths(new_state, &greedy_filter(use_differ), max_len);
        if paths.is_empty() {
            return Ok(None);
        }
        paths.sort_by_key(|p| p.len());
        let path = paths.swap_remove(0);
        if path.len() <= 1 {
            if let Some(first) = path.first_action() {
                Self::disable_restart_if_unvisited(agent, first)?;
            }
        }
        agent.refill_buffer(&path)
    }

    fn select_greedy_backward(&mut self, agent: &mut StatefulAgent) -> Result<Option<ActionId>> {
        let new_state = agent.new_state()?;
        let (use_differ, max_len) = (Self::use_differ(agent), Self::max_len(agent));
        let graph = agent.model().graph();
        let back = graph.state(new_state)?.back_action();
        if ActionFilter::EnabledValidUnvisited.include(back) {
            return Ok(Some(back.id));
        }
        let mut paths = graph.find_shortest_paths(new_state, &backtrack_filter(use_differ), max_len);
        if paths.is_empty() {
            return Ok(None);
        }
        paths.sort_by_key(|p| p.len());
        let path = paths.swap_remove(0);
        if path.len() <= 1 {
            if let Some(first) = path.first_action() {
                Self::disable_restart_if_unvisited(agent, first)?;
            }
        }
        agent.refill_buffer(&path)
    }

    fn trivial_activities(agent: &StatefulAgent) -> BTreeSet<String> {
        let model = agent.model();
        let graph = model.graph();
        let mut activities: Vec<_> = graph.activities().collect();
        if activities.len() <= agent.settings().trivial_activity_rank_threshold {
            return BTreeSet::new();
        }
        activities.sort_by(|a, b| a.compare(b));
        let median = activities[activities.len() >> 1].visits.count;
        let mean = activities.iter().map(|a| a.visits.count as u64).sum::<u64>() / activities.len() as u64;
        let threshold = (median as u64).max(mean);
        let state_threshold = model.config().trivial_activity_state_threshold;

        activities
            .into_iter()
            .take_while(|a| a.visits.count as u64 <= threshold)
            .filter(|a| {
                model.is_trivial_activity(&a.activity)
                    || is_trivial_by_coverage(
                        a.states().len(),
                        a.visits.count,
                        graph.activity_visited_rate(&a.activity),
                        state_threshold,
                    )
            })
            .map(|a| a.activity.clone())
            .collect()
    }

    /// Head for an under-explored activity other than the current one
    fn select_for_trivial_activity(&mut self, agent: &mut StatefulAgent) -> Result<Option<ActionId>> {
        let trivial = Self::trivial_activities(agent);
        if trivial.is_empty() {
            return Ok(None);
        }
        let new_state = agent.new_state()?;
        let (use_differ, max_len) = (Self::use_differ(agent), Self::max_len(agent));
        let graph = agent.model().graph();
        if trivial.contains(graph.state(new_state)?.activity()) {
            return Ok(None);
        }
        debug!(activities = ?trivial, "trivial activities");
        let filter = FnFilter::new(
            |graph: &Graph, _: &Subsequence, edge: &StateTransition| {
                edge_is_forward_candidate(graph, edge, false)
            },
            |graph: &Graph, path: &Subsequence| {
                let Ok(last) = graph.state(path.last_state()) else {
                    return false;
                };
                if !trivial.contains(last.activity()) {
                    return false;
                }
                is_greedy_state(graph, None, last.id, use_differ)
                    || last.first_action(&ActionFilter::EnabledValidUnvisited).is_some()
            },
        );
        let paths = graph.find_shortest_paths(new_state, &filter, max_len);
        let Some(path) = paths.choose(agent.rng()).cloned() else {
            return Ok(None);
        };
        agent.refill_buffer(&path)
    }

    fn select_epsilon_greedy(&mut self, agent: &mut StatefulAgent) -> Result<Option<ActionId>> {
        let new_state = agent.new_state()?;
        let back = agent.model().graph().state(new_state)?.back_action();
        if back.valid && back.is_unvisited() {
            return Ok(Some(back.id));
        }
        let v: f64 = agent.rng().gen();
        if v >= self.epsilon {
            debug!(value = v, epsilon = self.epsilon, "least visited");
            return Ok(agent
                .model()
                .graph()
                .state(new_state)?
                .greedy_pick_least_visited(&ActionFilter::EnabledValid));
        }
        debug!(value = v, epsilon = self.epsilon, "random");
        agent.randomly_pick(&ActionFilter::EnabledValid, true)
    }
}

impl Strategy for SataStrategy {
    fn name(&self) -> &'static str {
        "sata"
    }

    fn select(&mut self, agent: &mut StatefulAgent, _source: &mut dyn SnapshotSource) -> Result<Selection> {
        if let Some(id) = agent.select_from_buffer()? {
            agent.log_event(AgentEvent::UseBuffer);
            return Ok(Selection::Model(id));
        }
        let early = match self.select_aba(agent)? {
            Some(id) => Some(id),
            None => self.select_greedy_forward(agent)?,
        };
        if let Some(id) = early {
            agent.log_event(AgentEvent::EarlyStage);
            return Ok(Selection::Model(id));
        }
        if let Some(id) = self.select_for_trivial_activity(agent)? {
            agent.log_event(AgentEvent::TrivialActivity);
            return Ok(Selection::Model(id));
        }
        if let Some(id) = self.select_greedy_backward(agent)? {
            agent.log_event(AgentEvent::EarlyStage);
            return Ok(Selection::Model(id));
        }
        if let Some(id) = self.select_epsilon_greedy(agent)? {
            agent.log_event(AgentEvent::EpsilonGreedy);
            return Ok(Selection::Model(id));
        }
        Ok(Selection::Model(agent.handle_null_action()?))
    }
}
