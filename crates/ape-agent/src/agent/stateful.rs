//! Model maintenance of one exploration step
//!
//! ```text
//!   Recovered ──► Observed ──► Resolved ──► Advanced
//!   (restore      (add tree,   (evolve,     (shift new → current
//!    current)      refresh,     record        → last, or reset)
//!                  validate)    edge, pick)
//! ```
//!
//! The agent keeps three slots: `last`, `current` (the state the previous
//! action was taken on) and `new` (the state just observed).

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use ape_common::{
    ActionType, AgentError, ApeError, GraphError, Rect, Result, TreeId, UiTree, EDGE_PRIORITY_ADJUSTMENT,
    UNVISITED_TARGETED_PRIORITY, UNVISITED_UNTARGETED_PRIORITY,
};
use ape_model::{
    Action, ActionFilter, ActionId, ActionPredicate, Controller, Model, ModelSnapshot, StateId,
    Subsequence, TransitionId, TreeAction, VisitKind,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};

use super::{AgentEvent, Selection, Strategy};
use crate::config::AgentSettings;
use crate::device::SnapshotSource;

/// Snapshots fetched while settling a trivial state
const MAX_REFRESH_RETRIES: u32 = 5;

/// Bound on consecutive successful evolutions within one check
const MAX_EVOLVE_ITERATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Recovered,
    Observed,
    Resolved,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    state: StateId,
    tree: TreeId,
    action: Option<TreeAction>,
    throttle: u32,
}

impl Slot {
    fn new(state: StateId, tree: TreeId) -> Self {
        Self {
            state,
            tree,
            action: None,
            throttle: 0,
        }
    }
}

/// Outcome of fetching one more snapshot for the new state
enum Refresh {
    Void,
    Moved,
    Same { top_equivalent: bool },
}

pub struct StatefulAgent {
    model: Model,
    controller: Controller,
    settings: AgentSettings,
    rng: StdRng,
    timestamp: u64,
    phase: StepPhase,

    last: Option<Slot>,
    current: Option<Slot>,
    new: Option<Slot>,
    current_edge: Option<TransitionId>,
    buffer: VecDeque<TransitionId>,

    graph_stable: u32,
    state_stable: u32,
    activity_stable: u32,

    restart_requested: bool,
    restart_disabled: bool,
    fuzzing_disabled: bool,
    recovered: bool,
    /// Set by an app start and consumed by the next entry state; `true` for a clean start
    app_started: Option<bool>,
    refresh_blacklist: HashSet<StateId>,
    counters: BTreeMap<AgentEvent, u32>,
}

impl StatefulAgent {
    pub fn new(model: Model, controller: Controller, settings: AgentSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let timestamp = model.graph().timestamp();
        Self {
            model,
            controller,
            settings,
            rng,
            timestamp,
            phase: StepPhase::Advanced,
            last: None,
            current: None,
            new: None,
            current_edge: None,
            buffer: VecDeque::new(),
            graph_stable: 0,
            state_stable: 0,
            activity_stable: 0,
            restart_requested: false,
            restart_disabled: false,
            fuzzing_disabled: false,
            recovered: false,
            app_started: None,
            refresh_blacklist: HashSet::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn counters(&self) -> &BTreeMap<AgentEvent, u32> {
        &self.counters
    }

    pub fn new_state(&self) -> Result<StateId> {
        self.new.map(|s| s.state).ok_or_else(|| AgentError::NoCurrentState.into())
    }

    pub fn new_tree(&self) -> Result<TreeId> {
        self.new.map(|s| s.tree).ok_or_else(|| AgentError::NoCurrentState.into())
    }

    pub fn current_state(&self) -> Option<StateId> {
        self.current.map(|s| s.state)
    }

    pub fn current_action(&self) -> Option<ActionId> {
        self.current.and_then(|s| s.action).map(|a| a.model_action)
    }

    pub fn last_state(&self) -> Option<StateId> {
        self.last.map(|s| s.state)
    }

    pub fn current_edge(&self) -> Option<TransitionId> {
        self.current_edge
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Root bounds of the latest screen
    pub fn root_bounds(&self) -> Option<Rect> {
        let slot = self.new.or(self.current)?;
        let tree = self.model.tree(slot.tree).ok()?;
        Some(tree.ui().root().bounds)
    }

    /// Advance the clock; per-step vetoes are lifted
    pub fn tick(&mut self) -> u64 {
        self.timestamp += 1;
        self.restart_disabled = false;
        self.fuzzing_disabled = false;
        self.timestamp
    }

    pub fn log_event(&mut self, event: AgentEvent) {
        *self.counters.entry(event).or_insert(0) += 1;
        debug!(?event, step = self.timestamp, "agent event");
    }

    pub fn take_restart_request(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    pub fn disable_restart(&mut self) {
        self.restart_disabled = true;
    }

    pub fn restart_disabled(&self) -> bool {
        self.restart_disabled
    }

    pub fn disable_fuzzing(&mut self) {
        self.fuzzing_disabled = true;
    }

    pub fn fuzzing_disabled(&self) -> bool {
        self.fuzzing_disabled
    }

    pub fn on_app_started(&mut self, clean: bool) {
        info!(clean, "app started");
        self.app_started = Some(clean);
    }

    pub fn on_activity_stopped(&mut self) {
        info!("activity stopped");
        self.last = None;
        self.current = None;
        self.new = None;
        self.current_edge = None;
        self.clear_buffer();
        self.clear_stability();
    }

    pub fn start_new_episode(&mut self) {
        self.reset_trace();
        self.clear_stability();
    }

    pub fn reset_trace(&mut self) {
        self.clear_buffer();
        self.current_edge = None;
        self.last = None;
        self.current = None;
        self.new = None;
    }

    fn clear_stability(&mut self) {
        self.graph_stable = 0;
        self.state_stable = 0;
        self.activity_stable = 0;
    }

    /// Run one step on `ui` and return the action to perform
    #[instrument(level = "debug", skip_all, fields(step = self.timestamp, strategy = strategy.name()))]
    pub fn step(
        &mut self,
        ui: UiTree,
        source: &mut dyn SnapshotSource,
        strategy: &mut dyn Strategy,
    ) -> Result<Action> {
        // Step 1: restore the current slot from the history after a reset
        self.phase = StepPhase::Recovered;
        self.recover_current_state()?;

        // Step 2: ingest the snapshot
        self.phase = StepPhase::Observed;
        self.observe(ui)?;
        self.refresh_trivial_state(source)?;
        self.validate_all()?;

        // Step 3: evolve the model and record the transition
        self.phase = StepPhase::Resolved;
        if self.settings.evolve_model {
            self.pre_evolve()?;
        }
        let new_state = self.new_state()?;
        self.model.graph_mut().mark_state_visited(new_state, self.timestamp)?;
        self.update_graph()?;
        self.check_stable(strategy.restarts_on_stability());
        self.check_non_deterministic_transitions()?;
        let new_state = self.new_state()?;
        if self.model.graph().state(new_state)?.visits.is_unvisited() {
            self.model.graph_mut().mark_state_visited(new_state, self.timestamp)?;
        }
        self.adjust_priorities()?;
        let selection = strategy.select(self, source)?;

        // Step 4: commit the choice
        self.phase = StepPhase::Advanced;
        match selection {
            Selection::Model(id) => self.advance(id),
            Selection::Other(action) => {
                self.reset_trace();
                Ok(action)
            }
        }
    }

    fn recover_current_state(&mut self) -> Result<()> {
        self.recovered = false;
        if self.current.is_some() {
            return Ok(());
        }
        let mut found = None;
        for record in self.model.history().iter().rev() {
            if record.action.can_start_app() || record.action.action_type == ActionType::PhantomCrash {
                return Ok(());
            }
            if let Some(payload) = record.action.model_payload() {
                found = Some((record.action.action_type, record.action.throttle, payload.clone()));
                break;
            }
        }
        let Some((action_type, throttle, payload)) = found else {
            return Ok(());
        };
        let tree_action = TreeAction {
            action_type,
            node: payload.node,
            model_action: payload.action,
        };
        let recovered = self.model.update_state(payload.action.state, payload.tree).and_then(|state| {
            let action = self.model.update_action(payload.action, payload.tree, &tree_action)?;
            Ok((state, action))
        });
        match recovered {
            Ok((state, action)) => {
                self.current = Some(Slot {
                    state,
                    tree: payload.tree,
                    action: Some(TreeAction {
                        model_action: action,
                        ..tree_action
                    }),
                    throttle,
                });
                self.recovered = true;
                debug!(%state, %action, "current state recovered");
            }
            Err(e) => debug!(error = %e, "current state not recoverable"),
        }
        Ok(())
    }

    fn observe(&mut self, ui: UiTree) -> Result<()> {
        let (tree, state) = self.model.add_tree(ui, self.timestamp)?;
        self.new = Some(Slot::new(state, tree));
        debug!(%state, tree = %tree, "new state");
        Ok(())
    }

    fn refresh_trivial_state(&mut self, source: &mut dyn SnapshotSource) -> Result<()> {
        let origin = self.new_state()?;
        if self.refresh_blacklist.contains(&origin) || !self.model.is_trivial_state(origin)? {
            return Ok(());
        }
        let mut retries = MAX_REFRESH_RETRIES;
        let mut attempt = 0;
        while attempt < retries {
            attempt += 1;
            if !self.model.is_trivial_state(self.new_state()?)? {
                break;
            }
            match self.fetch_refreshed(source)? {
                Refresh::Void => continue,
                Refresh::Moved => retries = retries.min(attempt),
                Refresh::Same { top_equivalent } => {
                    if top_equivalent {
                        retries = retries.min(attempt + 2);
                    }
                }
            }
        }
        let state = self.new_state()?;
        if state == origin {
            debug!(%state, "state blacklisted from refresh");
            self.refresh_blacklist.insert(state);
        } else {
            info!(from = %origin, to = %state, "trivial state refreshed");
        }
        Ok(())
    }

    /// Fetch fresh snapshots until the new state changes; `true` if it did
    pub fn refresh_new_state(&mut self, source: &mut dyn SnapshotSource) -> Result<bool> {
        for _ in 0..MAX_REFRESH_RETRIES {
            if let Refresh::Moved = self.fetch_refreshed(source)? {
                self.validate_all()?;
                self.adjust_priorities()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn fetch_refreshed(&mut self, source: &mut dyn SnapshotSource) -> Result<Refresh> {
        let Some(ui) = source.snapshot()? else {
            return Ok(Refresh::Void);
        };
        let old = self.new.ok_or(AgentError::NoCurrentState)?;
        let (tree, state) = self.model.add_tree(ui, self.timestamp)?;
        if state != old.state {
            self.discard_unvisited(old.state)?;
            self.new = Some(Slot::new(state, tree));
            return Ok(Refresh::Moved);
        }
        let top = self.model.naming().namings.top();
        let top_equivalent = self.model.state_key(top, old.tree)? == self.model.state_key(top, tree)?;
        self.new = Some(Slot { tree, ..old });
        self.model.drop_refreshed_tree(state)?;
        Ok(Refresh::Same { top_equivalent })
    }

    /// Remove a state superseded by a refresh if nothing refers to it
    fn discard_unvisited(&mut self, state: StateId) -> Result<()> {
        let graph = self.model.graph();
        let s = graph.state(state)?;
        if !s.visits.is_unvisited() {
            return Ok(());
        }
        if !s.in_edges().is_empty() || !s.out_edges().is_empty() {
            debug!(%state, "superseded state kept, it has transitions");
            return Ok(());
        }
        self.model.graph_mut().remove(state)?;
        Ok(())
    }

    /// Resolve every action of the new state against its latest tree
    pub fn validate_all(&mut self) -> Result<()> {
        let state = self.new_state()?;
        let ids: Vec<ActionId> = self
            .model
            .graph()
            .state(state)?
            .actions()
            .iter()
            .map(|a| a.id)
            .collect();
        for id in ids {
            self.validate_action(id)?;
        }
        Ok(())
    }

    /// Resolve `id` to a node; `false` when the action cannot be performed
    pub fn validate_action(&mut self, id: ActionId) -> Result<bool> {
        let throttle = self.throttle_for(id)?;
        match self.model.resolve_action(id, throttle, self.timestamp, &mut self.rng) {
            Ok(()) => {}
            Err(ApeError::Graph(GraphError::NoSuchAction { .. })) => {
                let action = self.model.graph_mut().action_mut(id)?;
                action.valid = false;
                debug!(action = %action, "no node to resolve to");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        let action = self.model.graph().action(id)?;
        let (valid, enabled) = if !action.requires_target() {
            (true, action.enabled)
        } else {
            match (action.resolved_tree(), action.resolved_node()) {
                (Some(tree), Some(node)) => {
                    let node = self.model.tree(tree)?.ui().node(node);
                    (!node.bounds.is_empty(), node.enabled)
                }
                _ => (false, action.enabled),
            }
        };
        let action = self.model.graph_mut().action_mut(id)?;
        action.valid = valid;
        action.enabled = enabled;
        Ok(valid)
    }

    fn throttle_for(&self, id: ActionId) -> Result<u32> {
        let graph = self.model.graph();
        let action = graph.action(id)?;
        let activity = graph.state(id.state)?.activity();
        let changes_activity = graph.action_out_edges(id).iter().any(|edge| {
            graph
                .state(edge.target)
                .map_or(false, |target| target.activity() != activity)
        });
        let mut throttle = self.settings.base_throttle;
        if action.is_unvisited() {
            throttle = throttle.saturating_add(self.settings.throttle_for_unvisited_action);
        }
        if changes_activity && !action.is_back() {
            throttle = throttle.saturating_add(self.settings.throttle_for_activity_transition);
        }
        Ok(throttle.min(self.settings.max_throttle))
    }

    fn pre_evolve(&mut self) -> Result<()> {
        self.check_under_abstraction()?;
        self.check_over_abstraction()?;
        self.check_under_abstraction()
    }

    fn check_under_abstraction(&mut self) -> Result<()> {
        for iteration in 0..MAX_EVOLVE_ITERATIONS {
            let before = self.new_state()?;
            self.abstract_new_state()?;
            if self.new_state()? == before {
                break;
            }
            debug!(iteration, "new state abstracted");
        }
        Ok(())
    }

    /// Try the naming of the new state and each of its ancestors as abstraction target
    fn abstract_new_state(&mut self) -> Result<()> {
        let state = self.new_state()?;
        let naming = self.model.graph().state(state)?.key().naming();
        let mut target = naming;
        while let Some(parent) = self.model.naming().namings.parent(target) {
            let states = self
                .model
                .graph()
                .all_states_of_naming(target, &self.model.naming().namings);
            match self
                .model
                .state_abstraction(&mut self.controller, naming, state, target, &states)
            {
                Ok(true) => {
                    self.refresh_slots()?;
                    return self.validate_all();
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, %state, naming = %target, "state abstraction rejected");
                    return Ok(());
                }
            }
            target = parent;
        }
        Ok(())
    }

    fn check_over_abstraction(&mut self) -> Result<()> {
        for iteration in 0..MAX_EVOLVE_ITERATIONS {
            let before = self.new_state()?;
            self.refine_new_state()?;
            if self.new_state()? == before {
                break;
            }
            debug!(iteration, "new state refined");
        }
        Ok(())
    }

    /// Refine one action per target, fewest resolved nodes first
    fn refine_new_state(&mut self) -> Result<()> {
        let state = self.new_state()?;
        let mut candidates: Vec<_> = self
            .model
            .graph()
            .state(state)?
            .actions()
            .iter()
            .filter_map(|a| a.target.map(|t| (a.resolved_nodes().len(), a.id, t)))
            .collect();
        candidates.sort_by_key(|(nodes, id, _)| (*nodes, *id));
        let mut seen = HashSet::new();
        for (_, id, target) in candidates {
            if !seen.insert(target) {
                continue;
            }
            match self.model.action_refinement(&mut self.controller, id) {
                Ok(true) => {
                    self.refresh_slots()?;
                    return self.validate_all();
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, action = %id, "action refinement rejected");
                    self.controller.reject_action_refinement(id);
                }
            }
        }
        Ok(())
    }

    fn check_non_deterministic_transitions(&mut self) -> Result<()> {
        if !self.settings.evolve_model || self.recovered {
            return Ok(());
        }
        let Some(edge) = self.current_edge else {
            return Ok(());
        };
        let action = self.model.graph().transition(edge)?.action;
        match self
            .model
            .resolve_non_deterministic_transitions(&mut self.controller, edge)
        {
            Ok(true) => {
                info!(%edge, "model refined after a non-deterministic transition");
                self.refresh_slots()?;
                self.validate_all()?;
            }
            Ok(false) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, %edge, "non-determinism left unresolved");
                self.controller.reject_non_determinism(action);
            }
        }
        Ok(())
    }

    /// Point every slot, the current edge and the buffer at the rebuilt graph
    fn refresh_slots(&mut self) -> Result<()> {
        self.last = self.last.and_then(|slot| self.updated_slot(slot).ok());
        self.current = self.current.and_then(|slot| self.updated_slot(slot).ok());
        if let Some(slot) = self.new {
            self.new = Some(self.updated_slot(slot)?);
        }
        self.current_edge = self.current_edge.and_then(|e| self.model.update_transition(e));
        let mut buffer = VecDeque::with_capacity(self.buffer.len());
        for edge in &self.buffer {
            match self.model.update_transition(*edge) {
                Some(edge) => buffer.push_back(edge),
                None => {
                    debug!(%edge, "buffered edge lost in rebuild");
                    buffer.clear();
                    break;
                }
            }
        }
        self.buffer = buffer;
        Ok(())
    }

    fn updated_slot(&self, slot: Slot) -> Result<Slot> {
        let state = self.model.update_state(slot.state, slot.tree)?;
        let action = match slot.action {
            Some(a) => Some(TreeAction {
                model_action: self.model.update_action(a.model_action, slot.tree, &a)?,
                ..a
            }),
            None => None,
        };
        Ok(Slot { state, action, ..slot })
    }

    fn update_graph(&mut self) -> Result<()> {
        let new = self.new.ok_or(AgentError::NoCurrentState)?;
        if self.current.is_none() {
            if let Some(clean) = self.app_started.take() {
                info!(state = %new.state, clean, "entry state");
                self.model.graph_mut().add_entry_tree(new.tree);
                if clean {
                    self.model.graph_mut().add_clean_entry_tree(new.tree);
                }
            }
        }
        let source = self.current.and_then(|c| c.action.map(|a| (c.tree, a)));
        let throttle = self.current.map_or(0, |c| c.throttle);
        self.current_edge = self.model.add_transition(source, new.tree, throttle)?;
        if let Some(edge) = self.current_edge {
            self.on_visit_transition(edge)?;
        }
        Ok(())
    }

    fn on_visit_transition(&mut self, edge: TransitionId) -> Result<()> {
        let graph = self.model.graph();
        let transition = graph.transition(edge)?;
        match transition.kind {
            VisitKind::NewAction | VisitKind::NewActionTarget => self.graph_stable = 0,
            VisitKind::Existing => self.graph_stable += 1,
        }
        if transition.is_circle() {
            self.state_stable += 1;
        } else {
            self.state_stable = 0;
        }
        let same_activity =
            graph.state(transition.source)?.activity() == graph.state(transition.target)?.activity();
        if same_activity {
            self.activity_stable += 1;
        } else {
            self.activity_stable = 0;
        }
        Ok(())
    }

    fn check_stable(&mut self, restart_allowed: bool) {
        debug!(
            graph = self.graph_stable,
            state = self.state_stable,
            activity = self.activity_stable,
            "stability counters"
        );
        if !restart_allowed {
            return;
        }
        if self.graph_stable > self.settings.graph_stable_restart_threshold {
            info!(counter = self.graph_stable, "graph is stable");
            self.restart_requested = true;
            self.graph_stable = 0;
        }
        if self.state_stable > self.settings.state_stable_restart_threshold {
            info!(counter = self.state_stable, "state is stable");
            self.restart_requested = true;
            self.state_stable = 0;
        }
        if self.activity_stable > self.settings.activity_stable_restart_threshold {
            info!(counter = self.activity_stable, "activity is stable");
            self.restart_requested = true;
            self.activity_stable = 0;
        }
    }

    /// Recompute the priority of every action of the new state
    pub fn adjust_priorities(&mut self) -> Result<()> {
        let state_id = self.new_state()?;
        let tree = self.model.tree(self.new_tree()?)?;
        let graph = self.model.graph();
        let state = graph.state(state_id)?;
        let max_extra = self.settings.max_extra_priority_aliased_actions;

        let mut priorities = Vec::with_capacity(state.actions().len());
        for action in state.actions() {
            let weight = action.action_type.base_priority();
            let mut priority = weight << 3;
            if !action.requires_target() {
                if action.is_unvisited() {
                    priority += UNVISITED_UNTARGETED_PRIORITY;
                }
                priorities.push((action.id, priority));
                continue;
            }
            if !action.valid || !action.is_resolved_at(self.timestamp) {
                priorities.push((action.id, priority));
                continue;
            }
            if action.is_unvisited() {
                priority += UNVISITED_TARGETED_PRIORITY;
            }
            if !action.is_saturated() {
                let aliases = action.target.map_or(0, |t| tree.nodes_of(t).len());
                if aliases > 1 {
                    priority += (aliases as i32).min(max_extra) * weight;
                }
            }
            let edges = graph.action_out_edges(action.id);
            for edge in &edges {
                if edge.is_strong() {
                    let target = graph.state(edge.target)?;
                    if target.is_saturated() {
                        priority -= EDGE_PRIORITY_ADJUSTMENT;
                    } else if target.activity() == state.activity() {
                        priority += EDGE_PRIORITY_ADJUSTMENT;
                    }
                } else if edges.len() > 1 {
                    priority += EDGE_PRIORITY_ADJUSTMENT;
                }
            }
            priorities.push((action.id, priority.max(1)));
        }

        let graph = self.model.graph_mut();
        for (id, priority) in priorities {
            graph.action_mut(id)?.priority = priority;
        }
        Ok(())
    }

    /// Priority-weighted pick among the actions of the new state
    pub fn randomly_pick(&mut self, filter: &impl ActionPredicate, include_back: bool) -> Result<Option<ActionId>> {
        let state = self.new_state()?;
        self.model
            .graph()
            .state(state)?
            .randomly_pick_action(&mut self.rng, filter, include_back)
    }

    /// Last resort: any enabled valid action, else a bad state
    pub fn handle_null_action(&mut self) -> Result<ActionId> {
        self.log_event(AgentEvent::Null);
        if let Some(id) = self.randomly_pick(&ActionFilter::EnabledValid, true)? {
            if self.validate_action(id)? {
                return Ok(id);
            }
        }
        Err(ApeError::BadState("No available action on the current state".into()))
    }

    fn advance(&mut self, selected: ActionId) -> Result<Action> {
        let new_state = self.new_state()?;
        if selected.state != new_state {
            return Err(AgentError::Unresolved(format!(
                "action {} does not belong to the new state {}",
                selected, new_state
            ))
            .into());
        }
        let action = self.model.graph().action(selected)?;
        let id = if action.requires_target() && (!action.valid || action.resolved_node().is_none()) {
            warn!(action = %action, "selected action is not valid");
            self.handle_null_action()?
        } else {
            selected
        };
        self.model.graph_mut().mark_action_visited(id, self.timestamp)?;
        let action = self.model.graph().action(id)?;
        let tree_action = TreeAction {
            action_type: action.action_type,
            node: action.resolved_node(),
            model_action: id,
        };
        let throttle = action.throttle;
        let new = self.new.as_mut().ok_or(AgentError::NoCurrentState)?;
        new.action = Some(tree_action);
        new.throttle = throttle;
        let executable = self.model.to_action(id)?;
        self.move_forward();
        Ok(executable)
    }

    fn move_forward(&mut self) {
        self.last = self.current.take();
        self.current = self.new.take();
        self.current_edge = None;
    }

    fn clear_buffer(&mut self) {
        let Some(head) = self.buffer.pop_front() else {
            return;
        };
        self.buffer.clear();
        let Ok(transition) = self.model.graph().transition(head) else {
            return;
        };
        let (action, target) = (transition.action, transition.target);
        if let Err(e) = self.model.graph_mut().weaken(action, target) {
            debug!(error = %e, "cannot weaken buffered edge");
        }
    }

    fn weaken_current(&mut self, expected: StateId) {
        let Some(action) = self.current_action() else {
            return;
        };
        if let Err(e) = self.model.graph_mut().weaken(action, expected) {
            debug!(error = %e, "cannot weaken current edge");
        }
    }

    /// Replace the buffer with `path`; returns its first action
    pub fn refill_buffer(&mut self, path: &Subsequence) -> Result<Option<ActionId>> {
        self.log_event(AgentEvent::FillBuffer);
        self.clear_buffer();
        self.buffer.extend(path.edges());
        let (Some(action), Some(&head)) = (path.first_action(), self.buffer.front()) else {
            return Ok(None);
        };
        debug!(length = path.len(), %action, "buffer filled");
        self.raise_throttle(action, head)?;
        Ok(Some(action))
    }

    fn raise_throttle(&mut self, action: ActionId, edge: TransitionId) -> Result<()> {
        let tracked = self.model.graph().transition(edge)?.throttle;
        let action = self.model.graph_mut().action_mut(action)?;
        action.throttle = action.throttle.max(tracked);
        Ok(())
    }

    /// Next action of the buffered plan if the last step went as planned
    pub fn select_from_buffer(&mut self) -> Result<Option<ActionId>> {
        let Some(head) = self.buffer.pop_front() else {
            return Ok(None);
        };
        let new_state = self.new_state()?;
        let Ok(transition) = self.model.graph().transition(head) else {
            self.clear_buffer();
            return Ok(None);
        };
        let (expected_action, expected_target) = (transition.action, transition.target);

        if self.current_action() != Some(expected_action) {
            debug!(expected = %expected_action, "buffer out of sync with the current action");
            self.clear_buffer();
            return Ok(None);
        }

        if expected_target != new_state {
            debug!(expected = %expected_target, actual = %new_state, "unexpected state in buffer");
            let graph = self.model.graph();
            let same_activity = self
                .current_edge
                .and_then(|e| graph.transition(e).ok())
                .map_or(false, |t| {
                    match (graph.state(t.source), graph.state(t.target)) {
                        (Ok(s), Ok(t)) => s.activity() == t.activity(),
                        _ => false,
                    }
                });
            if let (true, Some(&next)) = (same_activity, self.buffer.front()) {
                let next_action = self.model.graph().transition(next)?.action;
                let relocated = self.model.relocate(new_state, next_action)?;
                match relocated {
                    Some(id) => {
                        debug!(from = %next_action, to = %id, "buffered action relocated");
                        self.raise_throttle(id, next)?;
                    }
                    None => {
                        self.weaken_current(expected_target);
                        self.log_event(AgentEvent::BufferLoss);
                    }
                }
                self.clear_buffer();
                return Ok(relocated);
            }
            self.weaken_current(expected_target);
            self.log_event(AgentEvent::BufferLoss);
            self.clear_buffer();
            return Ok(None);
        }

        let Some(&next) = self.buffer.front() else {
            return Ok(None);
        };
        let next_action = self.model.graph().transition(next)?.action;
        let action = self.model.graph().action(next_action)?;
        let state = self.model.graph().state(new_state)?;
        let check = match action.target {
            Some(target) => state.get_action(target, action.action_type).ok(),
            None => state.get_untargeted(action.action_type).ok(),
        };
        if check != Some(next_action) {
            self.clear_buffer();
            return Ok(None);
        }
        self.raise_throttle(next_action, next)?;
        Ok(Some(next_action))
    }

    /// Write the graph as DOT and the model snapshot into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("sataGraph.dot"), self.model.graph().to_dot())?;
        ModelSnapshot::save(&dir.join("sataModel.bin"), &self.model, &self.controller)
    }
}
