//! Step supervision around a [`StatefulAgent`]
//!
//! Restarts the app on schedule or on request, types text into edit
//! fields, and turns bad states into recovery actions until there are too
//! many of them.

use std::path::Path;

use ape_common::{ActionType, ApeError, Result, UiTree};
use ape_model::{Action, Controller, Model, ModelSnapshot, NamingContext};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, instrument, warn};

use super::{Agent, AgentEvent, RandomStrategy, ReplayStrategy, SataStrategy, StatefulAgent, Strategy};
use crate::config::{AgentKind, ApeConfig};
use crate::device::{Component, Device, SnapshotSource};
use crate::fuzzer::{self, DEFAULT_SCREEN};

/// Longest random text typed into an edit field
const MAX_INPUT_LENGTH: usize = 10;

pub struct ApeAgent {
    inner: StatefulAgent,
    strategy: Box<dyn Strategy>,
    app: Component,

    total_bad_states: u32,
    consecutive_bad_states: u32,
    last_bad_state: Option<u64>,

    last_restart: u64,
    next_restart_threshold: u64,
}

impl ApeAgent {
    pub fn new(inner: StatefulAgent, strategy: Box<dyn Strategy>, app: Component) -> Self {
        let mut agent = Self {
            last_restart: inner.timestamp(),
            inner,
            strategy,
            app,
            total_bad_states: 0,
            consecutive_bad_states: 0,
            last_bad_state: None,
            next_restart_threshold: 0,
        };
        agent.update_restart_threshold();
        agent
    }

    /// Build the configured agent, resuming from a saved model if one exists
    pub fn from_config(config: &ApeConfig) -> Result<Self> {
        let (model, controller) = match config.io.model_path.as_deref().filter(|p| p.exists()) {
            Some(path) => {
                let snapshot = ModelSnapshot::load(path)?;
                (snapshot.model, snapshot.controller)
            }
            None => {
                let naming = &config.naming;
                let ctx = NamingContext::new(naming.use_ancestor_namer, naming.use_patch_namer, naming.base_naming)?;
                (Model::new(ctx, config.model.clone()), Controller::new())
            }
        };
        let settings = &config.agent;
        let strategy: Box<dyn Strategy> = match settings.kind {
            AgentKind::Sata => Box::new(SataStrategy::new(settings.default_epsilon)),
            AgentKind::Random => Box::new(RandomStrategy),
            AgentKind::Replay => {
                let path = settings
                    .replay_log
                    .as_deref()
                    .ok_or_else(|| ApeError::Config("agent.replay_log is required by the replay agent".into()))?;
                Box::new(ReplayStrategy::load(path)?)
            }
        };
        let app = Component::new(settings.package.as_str(), settings.main_activity.as_str());
        let inner = StatefulAgent::new(model, controller, settings.clone());
        info!(agent = strategy.name(), states = inner.model().graph().len(), "agent ready");
        Ok(Self::new(inner, strategy, app))
    }

    pub fn inner(&self) -> &StatefulAgent {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut StatefulAgent {
        &mut self.inner
    }

    pub fn total_bad_states(&self) -> u32 {
        self.total_bad_states
    }

    fn update_restart_threshold(&mut self) {
        let settings = self.inner.settings();
        let (min, max) = (settings.restart_threshold_min, settings.restart_threshold_max);
        self.next_restart_threshold = if max <= min {
            min
        } else {
            self.inner.rng().gen_range(min..=max)
        };
    }

    fn start_action(&mut self) -> Action {
        let p = self.inner.settings().clean_restart_probability;
        let action_type = if self.inner.rng().gen_bool(p) {
            ActionType::EventCleanRestart
        } else {
            ActionType::EventRestart
        };
        Action::start(action_type, self.app.package.as_str(), self.app.class.as_str())
    }

    fn restart(&mut self) -> Action {
        self.inner.log_event(AgentEvent::Restart);
        self.last_restart = self.inner.timestamp();
        self.inner.start_new_episode();
        self.start_action()
    }

    fn check_restart(&mut self, origin: Action) -> Action {
        if !self.inner.settings().check_restart {
            return origin;
        }
        if self.inner.take_restart_request() {
            info!("restart requested");
            return self.restart();
        }
        if self.inner.restart_disabled() {
            return origin;
        }
        let steps = self.inner.timestamp().saturating_sub(self.last_restart);
        if steps > self.next_restart_threshold {
            info!(steps, threshold = self.next_restart_threshold, "scheduled restart");
            self.update_restart_threshold();
            return self.restart();
        }
        origin
    }

    /// Type random text into an empty edit field
    fn check_input(&mut self, mut action: Action) -> Action {
        let Some(payload) = action.model_payload() else {
            return action;
        };
        let Some(node) = payload.node else {
            return action;
        };
        if payload.input_text.is_some() {
            return action;
        }
        let is_edit_text = self
            .inner
            .model()
            .tree(payload.tree)
            .map(|t| t.ui().node(node).is_edit_text())
            .unwrap_or(false);
        if !is_edit_text {
            return action;
        }
        let rate = self.inner.settings().input_rate;
        let rng = self.inner.rng();
        if !rng.gen_bool(rate) {
            return action;
        }
        let len = rng.gen_range(1..=MAX_INPUT_LENGTH);
        let text: String = (0..len).map(|_| rng.sample(Alphanumeric) as char).collect();
        if let Some(payload) = action.model_payload_mut() {
            payload.input_text = Some(text);
        }
        action
    }

    fn handle_bad_state(&mut self, device: &mut dyn Device, error: ApeError) -> Result<Action> {
        let timestamp = self.inner.timestamp();
        warn!(error = %error, step = timestamp, "bad state");
        self.total_bad_states += 1;
        if self.last_bad_state == Some(timestamp.saturating_sub(1)) {
            self.consecutive_bad_states += 1;
        } else {
            self.consecutive_bad_states = 0;
        }
        self.last_bad_state = Some(timestamp);
        self.inner.log_event(AgentEvent::BadState);

        if self.consecutive_bad_states > self.inner.settings().max_consecutive_bad_states {
            warn!(count = self.consecutive_bad_states, "too many consecutive bad states");
            device.stop_top_activity()?;
            self.inner.on_activity_stopped();
        }
        if self.total_bad_states > self.inner.settings().max_bad_states {
            return Err(ApeError::StopTesting("Too many bad states".into()));
        }
        self.inner.start_new_episode();
        Ok(Action::activate())
    }
}

impl Agent for ApeAgent {
    fn name(&self) -> &'static str {
        self.strategy.name()
    }

    #[instrument(level = "debug", skip_all, fields(agent = self.strategy.name()))]
    fn update_state(
        &mut self,
        ui: UiTree,
        source: &mut dyn SnapshotSource,
        device: &mut dyn Device,
    ) -> Result<Action> {
        self.inner.tick();
        let result = match self.inner.step(ui, source, self.strategy.as_mut()) {
            Ok(action) => {
                let action = self.check_restart(action);
                return Ok(self.check_input(action));
            }
            Err(e) if e.is_bad_state() => {
                warn!(error = %e, "bad state, retrieving the screen again");
                match source.snapshot() {
                    Ok(Some(ui)) => self.inner.step(ui, source, self.strategy.as_mut()),
                    Ok(None) => Err(e),
                    Err(other) => Err(other),
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(action) => Ok(action),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.handle_bad_state(device, e),
        }
    }

    fn can_fuzz(&self) -> bool {
        self.strategy.allows_fuzzing() && !self.inner.fuzzing_disabled()
    }

    fn generate_fuzzing_action(&mut self) -> Action {
        self.inner.log_event(AgentEvent::Fuzzing);
        let bounds = self
            .inner
            .root_bounds()
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_SCREEN);
        let events = fuzzer::generate_events(self.inner.rng(), bounds);
        Action::fuzz(events, self.inner.settings().base_throttle)
    }

    fn on_app_started(&mut self, clean: bool) {
        self.inner.on_app_started(clean);
    }

    fn on_activity_stopped(&mut self) {
        self.inner.on_activity_stopped();
    }

    fn start_new_episode(&mut self) {
        self.inner.start_new_episode();
    }

    fn record(&mut self, clock_timestamp: i64, action: Action) {
        let timestamp = self.inner.timestamp();
        self.inner.model_mut().append_to_history(clock_timestamp, timestamp, action);
    }

    fn model(&self) -> &Model {
        self.inner.model()
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir)
    }

    fn tear_down(&mut self) {
        self.inner.model().graph().log_summary();
        info!(
            agent = self.strategy.name(),
            steps = self.inner.timestamp(),
            bad_states = self.total_bad_states,
            counters = ?self.inner.counters(),
            "agent finished"
        );
    }
}
