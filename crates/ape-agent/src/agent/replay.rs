//! Replays a recorded action log against the live model
//!
//! Targeted entries are matched by their full selector first, then by the
//! coarser target selector. When neither matches, the screen is refreshed a
//! few times before giving up.

use std::path::Path;

use ape_common::{ActionType, ApeError, NodeId, Result};
use ape_model::Action;
use ape_naming::Selector;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::{AgentEvent, Selection, StatefulAgent, Strategy};
use crate::action_log::{read_action_log, LogEntry};
use crate::device::SnapshotSource;

/// Snapshots taken while looking for the node of one entry
const MAX_RESOLVE_ATTEMPTS: u32 = 3;

pub struct ReplayStrategy {
    entries: Vec<LogEntry>,
    cursor: usize,
}

fn stop(reason: impl Into<String>) -> ApeError {
    ApeError::StopTesting(reason.into())
}

impl ReplayStrategy {
    pub fn new(entries: Vec<LogEntry>) -> Self {
        Self { entries, cursor: 0 }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let entries = read_action_log(path)?;
        info!(path = %path.display(), entries = entries.len(), "action log loaded");
        Ok(Self::new(entries))
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.cursor
    }

    fn find_node(agent: &mut StatefulAgent, entry: &LogEntry) -> Result<Option<NodeId>> {
        let tree = agent.model().tree(agent.new_tree()?)?.ui();
        if let Some(full) = &entry.full {
            match Selector::parse(full) {
                Ok(selector) => {
                    if let Some(&node) = selector.select(tree).first() {
                        return Ok(Some(node));
                    }
                }
                Err(e) => debug!(selector = %full, error = %e, "unusable full selector"),
            }
        }
        let Some(target) = &entry.target else {
            return Err(stop("targeted entry without a selector"));
        };
        let selector = Selector::parse(target).map_err(|e| stop(format!("bad selector `{}`: {}", target, e)))?;
        let nodes = selector.select(tree);
        Ok(nodes.choose(agent.rng()).copied())
    }

    fn resolve_targeted(
        &self,
        agent: &mut StatefulAgent,
        source: &mut dyn SnapshotSource,
        entry: &LogEntry,
    ) -> Result<Selection> {
        let mut node = None;
        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            node = Self::find_node(agent, entry)?;
            if node.is_some() {
                break;
            }
            debug!(attempt, "node not found, refreshing");
            agent.refresh_new_state(source)?;
        }
        let Some(node) = node else {
            return Err(stop(format!("cannot find the target of {:?}", entry.target)));
        };

        let state = agent.new_state()?;
        let tree_id = agent.new_tree()?;
        let timestamp = agent.timestamp();
        let tree = agent.model().tree(tree_id)?;
        let name = tree
            .name_of(node)
            .ok_or_else(|| stop(format!("node {} has no name in the current tree", node.0)))?;
        let nodes = tree.nodes_of(name).to_vec();
        let id = agent
            .model()
            .graph()
            .state(state)?
            .get_action(name, entry.action_type)
            .map_err(|e| stop(e.to_string()))?;

        let action = agent.model_mut().graph_mut().action_mut(id)?;
        action
            .resolve_at(timestamp, entry.throttle, tree_id, Some(node), nodes)
            .map_err(|e| stop(e.to_string()))?;
        action.valid = true;
        Ok(Selection::Model(id))
    }
}

impl Strategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn select(&mut self, agent: &mut StatefulAgent, source: &mut dyn SnapshotSource) -> Result<Selection> {
        agent.disable_fuzzing();
        loop {
            let Some(entry) = self.entries.get(self.cursor).cloned() else {
                return Err(stop("action log exhausted"));
            };
            self.cursor += 1;
            agent.log_event(AgentEvent::Replay);
            debug!(index = self.cursor, action = %entry.action_type, "replaying");

            let selection = match entry.action_type {
                ActionType::PhantomCrash => {
                    warn!(activity = ?entry.activity, "skipping recorded crash");
                    continue;
                }
                ActionType::ModelBack => {
                    let state = agent.new_state()?;
                    Selection::Model(agent.model().graph().state(state)?.back_action().id)
                }
                t if t.requires_target() => self.resolve_targeted(agent, source, &entry)?,
                ActionType::Fuzz => {
                    Selection::Other(Action::fuzz(entry.events.clone().unwrap_or_default(), entry.throttle))
                }
                ActionType::EventStart | ActionType::EventRestart | ActionType::EventCleanRestart => {
                    let (Some(package), Some(class)) = (&entry.package_name, &entry.class_name) else {
                        return Err(stop("start entry without a component"));
                    };
                    Selection::Other(Action::start(entry.action_type, package.as_str(), class.as_str()))
                }
                ActionType::EventNop => Selection::Other(Action::nop(entry.throttle)),
                ActionType::EventActivate => Selection::Other(Action::activate()),
                other => return Err(stop(format!("cannot replay {}", other))),
            };
            return Ok(selection);
        }
    }

    fn restarts_on_stability(&self) -> bool {
        false
    }

    fn allows_fuzzing(&self) -> bool {
        false
    }
}
