//! Priority-weighted random policy

use ape_common::Result;
use ape_model::ActionFilter;

use super::{AgentEvent, Selection, StatefulAgent, Strategy};
use crate::device::SnapshotSource;

#[derive(Debug, Default)]
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&mut self, agent: &mut StatefulAgent, _source: &mut dyn SnapshotSource) -> Result<Selection> {
        if let Some(id) = agent.select_from_buffer()? {
            agent.log_event(AgentEvent::UseBuffer);
            return Ok(Selection::Model(id));
        }
        if let Some(id) = agent.randomly_pick(&ActionFilter::All, true)? {
            if agent.validate_action(id)? && agent.model().graph().action(id)?.enabled {
                agent.log_event(AgentEvent::Random);
                return Ok(Selection::Model(id));
            }
        }
        Ok(Selection::Model(agent.handle_null_action()?))
    }

    fn restarts_on_stability(&self) -> bool {
        false
    }
}
