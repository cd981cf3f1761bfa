//! Exploration loop
//!
//! ```text
//!   snapshot ──► agent.update_state ──► device.perform ──► record
//!      │  (void: retry, then Activate)        │
//!      └──────────── fuzz / screenshot ◄──────┘
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ape_common::{ActionType, AgentError, ApeError, Result, UiTree};
use ape_model::Action;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::action_log::ActionLogWriter;
use crate::agent::Agent;
use crate::config::{ApeConfig, IoSettings};
use crate::device::{Component, CrashReport, Device, SnapshotSource};
use crate::image_queue::ImageWriterQueue;

/// Void snapshots in a row before the top activity is stopped
const MAX_VOID_TREES: u32 = 10;

/// Failed steps in a row before the run is given up
const MAX_FAILED_STEPS: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub steps: u64,
    pub states: usize,
    pub actions_performed: u64,
    pub crashes: u64,
    /// Steps that fell back to activating the app after an error
    pub recovered_errors: u64,
    pub stop_reason: Option<String>,
}

pub struct Explorer<A, S, D> {
    agent: A,
    source: S,
    device: D,
    app: Component,
    io: IoSettings,
    do_fuzzing: bool,
    fuzzing_rate: f64,

    action_log: Option<ActionLogWriter>,
    images: Option<ImageWriterQueue>,
    rng: StdRng,
    stop: Arc<AtomicBool>,

    steps: u64,
    performed: u64,
    crashes: u64,
    recovered_errors: u64,
    void_trees: u32,
    failed_steps: u32,
    /// Digest of the last snapshot, used in screenshot names
    last_digest: Option<String>,
}

impl<A: Agent, S: SnapshotSource, D: Device> Explorer<A, S, D> {
    pub fn new(agent: A, source: S, device: D, config: &ApeConfig) -> Result<Self> {
        let io = config.io.clone();
        fs::create_dir_all(&io.output_dir)?;
        let action_log = Some(ActionLogWriter::create(&io.output_dir.join("action.log"))?);
        let images = if io.take_screenshots {
            fs::create_dir_all(io.output_dir.join("screenshots"))?;
            Some(ImageWriterQueue::new(io.image_writer_count)?)
        } else {
            None
        };
        let rng = match config.agent.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            agent,
            source,
            device,
            app: Component::new(config.agent.package.as_str(), config.agent.main_activity.as_str()),
            io,
            do_fuzzing: config.agent.do_fuzzing,
            fuzzing_rate: config.agent.fuzzing_rate,
            action_log,
            images,
            rng,
            stop: Arc::new(AtomicBool::new(false)),
            steps: 0,
            performed: 0,
            crashes: 0,
            recovered_errors: 0,
            void_trees: 0,
            failed_steps: 0,
            last_digest: None,
        })
    }

    /// Flag checked between steps; set it to stop the loop
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Run at most `max_steps` steps, then save the model
    #[instrument(skip(self), fields(agent = self.agent.name()))]
    pub fn run(&mut self, max_steps: u64) -> Result<RunSummary> {
        info!(max_steps, app = %self.app.package, "exploration started");
        let mut stop_reason = None;

        if !self.app.package.is_empty() {
            let start = Action::start(ActionType::EventStart, self.app.package.as_str(), self.app.class.as_str());
            self.perform(start)?;
        }

        while self.steps < max_steps {
            if self.stop.load(Ordering::Relaxed) {
                stop_reason = Some("interrupted".to_string());
                break;
            }
            match self.step() {
                Ok(()) => self.failed_steps = 0,
                Err(e) if e.is_fatal() => {
                    info!(reason = %e, "exploration stopped");
                    stop_reason = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    self.failed_steps += 1;
                    self.recovered_errors += 1;
                    warn!(error = %e, count = self.failed_steps, "step failed");
                    if self.failed_steps > MAX_FAILED_STEPS {
                        stop_reason = Some(format!("Too many failed steps: {}", e));
                        break;
                    }
                    self.agent.start_new_episode();
                }
            }
        }

        self.finish();
        self.agent.save(&self.io.output_dir)?;
        let summary = RunSummary {
            steps: self.steps,
            states: self.agent.model().graph().len(),
            actions_performed: self.performed,
            crashes: self.crashes,
            recovered_errors: self.recovered_errors,
            stop_reason,
        };
        info!(steps = summary.steps, states = summary.states, "exploration finished");
        Ok(summary)
    }

    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        let action = match self.fetch_snapshot()? {
            Some(ui) => {
                self.void_trees = 0;
                if self.images.is_some() {
                    self.last_digest = Some(ui.digest());
                }
                match self.agent.update_state(ui, &mut self.source, &mut self.device) {
                    Ok(action) => action,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => self.recover(e),
                }
            }
            None => self.handle_void_tree()?,
        };
        self.perform(action)?;

        if self.do_fuzzing && self.agent.can_fuzz() && self.rng.gen_bool(self.fuzzing_rate) {
            let fuzz = self.agent.generate_fuzzing_action();
            self.perform(fuzz)?;
            self.agent.start_new_episode();
        }

        self.capture_screenshot()?;
        Ok(())
    }

    fn fetch_snapshot(&mut self) -> Result<Option<UiTree>> {
        for attempt in 0..self.io.snapshot_retries.max(1) {
            if let Some(ui) = self.source.snapshot()? {
                return Ok(Some(ui));
            }
            debug!(attempt, "void snapshot");
        }
        Ok(None)
    }

    fn handle_void_tree(&mut self) -> Result<Action> {
        self.void_trees += 1;
        let error = AgentError::VoidTree {
            retries: self.io.snapshot_retries,
        };
        warn!(error = %error, count = self.void_trees, "no usable snapshot");
        if self.void_trees > MAX_VOID_TREES {
            self.device.stop_top_activity()?;
            self.agent.on_activity_stopped();
            self.void_trees = 0;
        }
        Ok(Action::activate())
    }

    /// The agent could not pick an action; bring the app back and start over
    fn recover(&mut self, error: ApeError) -> Action {
        warn!(error = %error, step = self.steps, "agent failed, activating the app");
        self.recovered_errors += 1;
        self.agent.start_new_episode();
        Action::activate()
    }

    fn perform(&mut self, action: Action) -> Result<()> {
        let clock = chrono::Utc::now().timestamp_millis();
        debug!(%action, "performing");
        if let Some(log) = self.action_log.as_mut() {
            log.append(clock, &action)?;
        }
        self.device.perform(&action)?;
        self.performed += 1;
        if action.can_start_app() {
            let clean = action.action_type != ActionType::EventRestart;
            self.agent.on_app_started(clean);
        }
        self.agent.record(clock, action);
        if let Some(crash) = self.device.take_crash()? {
            self.record_crash(crash)?;
        }
        Ok(())
    }

    /// Log a crash as a phantom action; the trace starts over
    fn record_crash(&mut self, crash: CrashReport) -> Result<()> {
        warn!(activity = %crash.activity, message = %crash.message, "app crashed");
        self.crashes += 1;
        let clock = chrono::Utc::now().timestamp_millis();
        let action = Action::crash(crash.activity, crash.message);
        if let Some(log) = self.action_log.as_mut() {
            log.append(clock, &action)?;
        }
        self.agent.record(clock, action);
        self.agent.start_new_episode();
        Ok(())
    }

    fn capture_screenshot(&mut self) -> Result<()> {
        let Some(images) = self.images.as_mut() else {
            return Ok(());
        };
        if let Some(bytes) = self.source.screenshot()? {
            let name = match self.last_digest.as_deref() {
                Some(digest) => format!("step-{:06}-{}.png", self.steps, digest),
                None => format!("step-{:06}.png", self.steps),
            };
            let path: PathBuf = self.io.output_dir.join("screenshots").join(name);
            images.add(path, bytes);
        }
        if self.io.flush_images_threshold > 0 && self.steps % self.io.flush_images_threshold == 0 {
            images.flush();
        }
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(images) = self.images.as_mut() {
            images.tear_down();
        }
        self.agent.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ApeAgent, SataStrategy};
    use crate::device::{MockDevice, MockSnapshotSource};
    use crate::testing::{screen, settings, stateful};
    use ape_common::NamingError;
    use ape_model::Model;
    use parking_lot::Mutex;
    use std::path::Path;

    /// Delegates to an [`ApeAgent`] but fails one step with a naming conflict
    struct Conflicting {
        inner: ApeAgent,
        calls: u32,
        fail_at: u32,
    }

    impl Agent for Conflicting {
        fn name(&self) -> &'static str {
            "conflicting"
        }

        fn update_state(
            &mut self,
            ui: UiTree,
            source: &mut dyn SnapshotSource,
            device: &mut dyn Device,
        ) -> Result<Action> {
            self.calls += 1;
            if self.calls == self.fail_at {
                return Err(NamingError::NamingConflict("row already refined".into()).into());
            }
            self.inner.update_state(ui, source, device)
        }

        fn can_fuzz(&self) -> bool {
            self.inner.can_fuzz()
        }

        fn generate_fuzzing_action(&mut self) -> Action {
            self.inner.generate_fuzzing_action()
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
            self.inner.record(clock_timestamp, action);
        }

        fn model(&self) -> &Model {
            self.inner.model()
        }

        fn save(&self, dir: &Path) -> Result<()> {
            self.inner.save(dir)
        }

        fn tear_down(&mut self) {
            self.inner.tear_down();
        }
    }

    fn config(dir: &std::path::Path) -> ApeConfig {
        let mut config = ApeConfig::default();
        config.agent = settings();
        config.io.output_dir = dir.to_path_buf();
        config
    }

    fn ape() -> ApeAgent {
        ApeAgent::new(
            stateful(settings()),
            Box::new(SataStrategy::new(0.05)),
            Component::new("com.example", "com.example.Main"),
        )
    }

    #[test]
    fn test_run_records_every_action() {
        let dir = std::env::temp_dir().join(format!("ape-run-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        let mut n = 0u32;
        source.expect_snapshot().returning(move || {
            n += 1;
            let activity = ["A", "B", "C"][(n % 3) as usize];
            Ok(Some(screen(activity, &["one", "two", "three", "four"])))
        });
        source.expect_screenshot().returning(|| Ok(None));

        let performed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&performed);
        let mut device = MockDevice::new();
        device.expect_perform().returning(move |a| {
            sink.lock().push(a.action_type);
            Ok(())
        });
        device.expect_take_crash().returning(|| Ok(None));

        let mut explorer = Explorer::new(ape(), source, device, &config(&dir)).unwrap();
        let summary = explorer.run(5).unwrap();

        assert_eq!(summary.steps, 5);
        assert!(summary.stop_reason.is_none());
        let performed = performed.lock();
        assert_eq!(performed[0], ActionType::EventStart);
        assert_eq!(performed.len() as u64, summary.actions_performed);
        assert_eq!(explorer.agent().model().history().len(), performed.len());

        let log = std::fs::read_to_string(dir.join("action.log")).unwrap();
        assert_eq!(log.lines().count(), performed.len());
        assert!(dir.join("sataGraph.dot").exists());
        assert!(dir.join("sataModel.bin").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_void_trees_stop_top_activity() {
        let dir = std::env::temp_dir().join(format!("ape-void-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().returning(|| Ok(None));
        source.expect_screenshot().returning(|| Ok(None));
        let mut device = MockDevice::new();
        device.expect_perform().returning(|_| Ok(()));
        device.expect_stop_top_activity().times(1).returning(|| Ok(()));
        device.expect_take_crash().returning(|| Ok(None));

        let mut config = config(&dir);
        config.agent.package = String::new();
        let mut explorer = Explorer::new(ape(), source, device, &config).unwrap();
        let summary = explorer.run(MAX_VOID_TREES as u64 + 1).unwrap();
        assert_eq!(summary.actions_performed, MAX_VOID_TREES as u64 + 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stop_handle_interrupts() {
        let dir = std::env::temp_dir().join(format!("ape-stop-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().never();
        let mut device = MockDevice::new();
        device.expect_perform().returning(|_| Ok(()));
        device.expect_take_crash().returning(|| Ok(None));

        let mut explorer = Explorer::new(ape(), source, device, &config(&dir)).unwrap();
        explorer.stop_handle().store(true, Ordering::Relaxed);
        let summary = explorer.run(100).unwrap();
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.stop_reason.as_deref(), Some("interrupted"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_crash_recorded_as_phantom_action() {
        let dir = std::env::temp_dir().join(format!("ape-crash-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().returning(|| Ok(Some(screen("A", &["one", "two"]))));
        source.expect_screenshot().returning(|| Ok(None));
        let mut device = MockDevice::new();
        device.expect_perform().returning(|_| Ok(()));
        let mut crashed = false;
        device.expect_take_crash().returning(move || {
            if crashed {
                return Ok(None);
            }
            crashed = true;
            Ok(Some(CrashReport {
                activity: "A".into(),
                message: "java.lang.NullPointerException".into(),
            }))
        });

        let mut explorer = Explorer::new(ape(), source, device, &config(&dir)).unwrap();
        let summary = explorer.run(2).unwrap();
        assert_eq!(summary.crashes, 1);

        let history = explorer.agent().model().history();
        assert_eq!(history[0].action.action_type, ActionType::EventStart);
        assert_eq!(history[1].action.action_type, ActionType::PhantomCrash);
        let log = std::fs::read_to_string(dir.join("action.log")).unwrap();
        assert_eq!(log.lines().count(), history.len());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_screenshots_named_by_step_and_digest() {
        let dir = std::env::temp_dir().join(format!("ape-shots-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().returning(|| Ok(Some(screen("A", &["one", "two"]))));
        source.expect_screenshot().returning(|| Ok(Some(vec![0x89, b'P', b'N', b'G'])));
        let mut device = MockDevice::new();
        device.expect_perform().returning(|_| Ok(()));
        device.expect_take_crash().returning(|| Ok(None));

        let mut config = config(&dir);
        config.io.take_screenshots = true;
        config.io.image_writer_count = 1;
        let digest = screen("A", &["one", "two"]).digest();
        let mut explorer = Explorer::new(ape(), source, device, &config).unwrap();
        explorer.run(2).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.join("screenshots"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![format!("step-000001-{}.png", digest), format!("step-000002-{}.png", digest)]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_agent_error_falls_back_to_activate() {
        let dir = std::env::temp_dir().join(format!("ape-conflict-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().returning(|| Ok(Some(screen("A", &["one", "two"]))));
        source.expect_screenshot().returning(|| Ok(None));
        let performed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&performed);
        let mut device = MockDevice::new();
        device.expect_perform().returning(move |a| {
            sink.lock().push(a.action_type);
            Ok(())
        });
        device.expect_take_crash().returning(|| Ok(None));

        let agent = Conflicting {
            inner: ape(),
            calls: 0,
            fail_at: 2,
        };
        let mut explorer = Explorer::new(agent, source, device, &config(&dir)).unwrap();
        let summary = explorer.run(5).unwrap();

        assert_eq!(summary.steps, 5);
        assert_eq!(summary.recovered_errors, 1);
        assert!(summary.stop_reason.is_none());
        let performed = performed.lock();
        assert_eq!(performed.len(), 6);
        assert_eq!(performed[2], ActionType::EventActivate);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failing_device_ends_run_gracefully() {
        let dir = std::env::temp_dir().join(format!("ape-device-{}", uuid::Uuid::new_v4()));
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot().returning(|| Ok(Some(screen("A", &["one"]))));
        source.expect_screenshot().returning(|| Ok(None));
        let mut device = MockDevice::new();
        device
            .expect_perform()
            .returning(|_| Err(AgentError::Device("adb offline".into()).into()));
        device.expect_take_crash().returning(|| Ok(None));

        let mut config = config(&dir);
        config.agent.package = String::new();
        let mut explorer = Explorer::new(ape(), source, device, &config).unwrap();
        let summary = explorer.run(100).unwrap();

        assert_eq!(summary.steps, MAX_FAILED_STEPS as u64 + 1);
        assert_eq!(summary.actions_performed, 0);
        assert!(summary
            .stop_reason
            .as_deref()
            .unwrap_or("")
            .contains("Too many failed steps"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
