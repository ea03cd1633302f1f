pub mod input;
pub mod replication;

use crate::config::SessionConfig;
use crate::event::EventBus;
use crate::scene::SceneDirectory;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

const SLOW_PLUGIN_THRESHOLD_MS: f32 = 4.0;
const SLOW_TICK_THRESHOLD_MS: f32 = 12.0;
const DEFAULT_RUN_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    Unstarted,
    Initialized,
    Running,
    Suspended,
    Stopped,
}

/// How the scheduler drives a plugin once it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Execution {
    /// `step` is called from [`PluginScheduler::tick`].
    Stepped,
    /// `run` loops on a dedicated thread until stopped.
    Threaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(usize);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin '{plugin}' failed to initialize: {reason}")]
    InitFailed { plugin: String, reason: String },
    #[error("plugin '{plugin}' cannot {action} while {state:?}")]
    InvalidTransition {
        plugin: String,
        state: PluginState,
        action: &'static str,
    },
    #[error("no plugin registered as {0:?}")]
    UnknownPlugin(PluginId),
}

impl PluginError {
    pub fn init_failed(plugin: &str, reason: impl std::fmt::Display) -> Self {
        PluginError::InitFailed {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Shared services a plugin may touch. Plugins never reference each other.
#[derive(Clone)]
pub struct PluginContext {
    pub directory: Arc<SceneDirectory>,
    pub events: Arc<EventBus>,
    pub config: Arc<SessionConfig>,
}

impl PluginContext {
    pub fn new(directory: Arc<SceneDirectory>, config: Arc<SessionConfig>) -> Self {
        Self {
            events: Arc::clone(directory.events()),
            directory,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Suspended,
    Stopping,
}

/// Signal shared between the scheduler and a threaded plugin's `run` loop.
pub struct RunControl {
    phase: Mutex<RunPhase>,
    changed: Condvar,
    interval: Duration,
}

impl RunControl {
    pub fn new(interval: Duration) -> Self {
        Self {
            phase: Mutex::new(RunPhase::Running),
            changed: Condvar::new(),
            interval,
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub fn should_stop(&self) -> bool {
        self.phase() == RunPhase::Stopping
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn set(&self, phase: RunPhase) {
        *self.phase.lock() = phase;
        self.changed.notify_all();
    }

    /// Blocks while suspended. Returns `false` once a stop was requested.
    pub fn wait_while_suspended(&self) -> bool {
        let mut phase = self.phase.lock();
        while *phase == RunPhase::Suspended {
            self.changed.wait(&mut phase);
        }
        *phase != RunPhase::Stopping
    }

    /// Sleeps for one interval, waking early on any phase change. Returns
    /// `false` once a stop was requested.
    pub fn pace(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == RunPhase::Running {
            self.changed.wait_for(&mut phase, self.interval);
        }
        *phase != RunPhase::Stopping
    }
}

/// A functional unit driven by the scheduler.
pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    fn execution(&self) -> Execution {
        Execution::Stepped
    }

    /// One-time setup. A failure halts only this plugin.
    fn init(&mut self, context: &PluginContext) -> Result<(), PluginError>;

    fn step(&mut self, _context: &PluginContext, _delta_seconds: f32) {}

    /// Long-lived loop for [`Execution::Threaded`] plugins. The default steps
    /// once per interval and calls the suspend/restart hooks on phase changes.
    fn run(&mut self, context: &PluginContext, control: &RunControl) {
        let mut last = Instant::now();
        let mut suspended = false;
        loop {
            match control.phase() {
                RunPhase::Stopping => break,
                RunPhase::Suspended => {
                    if !suspended {
                        suspended = true;
                        self.suspend(context);
                    }
                    if !control.wait_while_suspended() {
                        break;
                    }
                    continue;
                }
                RunPhase::Running => {
                    if suspended {
                        suspended = false;
                        self.restart(context);
                        last = Instant::now();
                    }
                }
            }

            let now = Instant::now();
            self.step(context, now.duration_since(last).as_secs_f32());
            last = now;

            if !control.pace() {
                break;
            }
        }
    }

    fn suspend(&mut self, _context: &PluginContext) {}

    fn restart(&mut self, _context: &PluginContext) {}

    fn stop(&mut self, _context: &PluginContext) {}
}

#[derive(Debug, Clone, Default)]
pub struct TickProfile {
    plugins: Vec<PluginProfile>,
    total: Duration,
}

impl TickProfile {
    pub fn plugins(&self) -> &[PluginProfile] {
        &self.plugins
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginProfile> {
        self.plugins.iter().find(|profile| profile.name == name)
    }

    pub fn total_ms(&self) -> f32 {
        self.total.as_secs_f64() as f32 * 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct PluginProfile {
    pub name: &'static str,
    pub duration: Duration,
}

impl PluginProfile {
    pub fn duration_ms(&self) -> f32 {
        self.duration.as_secs_f64() as f32 * 1000.0
    }
}

struct PluginSlot {
    name: &'static str,
    execution: Execution,
    state: PluginState,
    plugin: Option<Box<dyn Plugin>>,
    control: Arc<RunControl>,
    worker: Option<JoinHandle<Box<dyn Plugin>>>,
}

/// Drives every registered plugin through
/// `Unstarted -> Initialized -> Running <-> Suspended -> Stopped`.
pub struct PluginScheduler {
    context: PluginContext,
    slots: Vec<PluginSlot>,
    run_interval: Duration,
    last_profile: TickProfile,
}

impl PluginScheduler {
    pub fn new(context: PluginContext) -> Self {
        Self {
            context,
            slots: Vec::new(),
            run_interval: DEFAULT_RUN_INTERVAL,
            last_profile: TickProfile::default(),
        }
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    /// Interval used by threaded plugins' `run` loops started after this call.
    pub fn set_run_interval(&mut self, interval: Duration) {
        self.run_interval = interval.max(Duration::from_millis(1));
    }

    pub fn last_profile(&self) -> &TickProfile {
        &self.last_profile
    }

    pub fn register<P>(&mut self, plugin: P) -> PluginId
    where
        P: Plugin + 'static,
    {
        self.register_boxed(Box::new(plugin))
    }

    pub fn register_boxed(&mut self, plugin: Box<dyn Plugin>) -> PluginId {
        let id = PluginId(self.slots.len());
        log::debug!("[scheduler] registered plugin {} as {:?}", plugin.name(), id);
        self.slots.push(PluginSlot {
            name: plugin.name(),
            execution: plugin.execution(),
            state: PluginState::Unstarted,
            plugin: Some(plugin),
            control: Arc::new(RunControl::new(self.run_interval)),
            worker: None,
        });
        id
    }

    pub fn ids(&self) -> Vec<PluginId> {
        (0..self.slots.len()).map(PluginId).collect()
    }

    pub fn find(&self, name: &str) -> Option<PluginId> {
        self.slots.iter().position(|slot| slot.name == name).map(PluginId)
    }

    pub fn state(&self, id: PluginId) -> Option<PluginState> {
        self.slots.get(id.0).map(|slot| slot.state)
    }

    pub fn name(&self, id: PluginId) -> Option<&'static str> {
        self.slots.get(id.0).map(|slot| slot.name)
    }

    pub fn init(&mut self, id: PluginId) -> Result<(), PluginError> {
        let context = &self.context;
        let slot = self.slots.get_mut(id.0).ok_or(PluginError::UnknownPlugin(id))?;
        expect_state(slot, &[PluginState::Unstarted], "init")?;
        let Some(plugin) = slot.plugin.as_mut() else {
            return Err(invalid(slot, "init"));
        };

        log::info!("[scheduler] initializing {}", slot.name);
        match plugin.init(context) {
            Ok(()) => {
                slot.state = PluginState::Initialized;
                Ok(())
            }
            Err(err) => {
                log::error!("[scheduler] {}; plugin halted", err);
                slot.state = PluginState::Stopped;
                Err(err)
            }
        }
    }

    /// Initializes every unstarted plugin. Failures halt only the failing
    /// plugin and are returned.
    pub fn init_all(&mut self) -> Vec<(PluginId, PluginError)> {
        let mut failures = Vec::new();
        for id in self.ids() {
            if self.state(id) == Some(PluginState::Unstarted) {
                if let Err(err) = self.init(id) {
                    failures.push((id, err));
                }
            }
        }
        failures
    }

    pub fn start(&mut self, id: PluginId) -> Result<(), PluginError> {
        let interval = self.run_interval;
        let context = self.context.clone();
        let slot = self.slots.get_mut(id.0).ok_or(PluginError::UnknownPlugin(id))?;
        expect_state(slot, &[PluginState::Initialized], "start")?;

        if slot.execution == Execution::Threaded {
            let Some(mut plugin) = slot.plugin.take() else {
                return Err(invalid(slot, "start"));
            };
            let control = Arc::new(RunControl::new(interval));
            slot.control = Arc::clone(&control);
            let name = slot.name;
            slot.worker = Some(std::thread::spawn(move || {
                log::debug!("[scheduler] {} run loop started", name);
                plugin.run(&context, &control);
                log::debug!("[scheduler] {} run loop returned", name);
                plugin
            }));
        }

        slot.state = PluginState::Running;
        log::info!("[scheduler] started {} ({:?})", slot.name, slot.execution);
        Ok(())
    }

    pub fn start_all(&mut self) -> Vec<(PluginId, PluginError)> {
        let mut failures = Vec::new();
        for id in self.ids() {
            if self.state(id) == Some(PluginState::Initialized) {
                if let Err(err) = self.start(id) {
                    failures.push((id, err));
                }
            }
        }
        failures
    }

    pub fn suspend(&mut self, id: PluginId) -> Result<(), PluginError> {
        let context = &self.context;
        let slot = self.slots.get_mut(id.0).ok_or(PluginError::UnknownPlugin(id))?;
        expect_state(slot, &[PluginState::Running], "suspend")?;

        match slot.execution {
            Execution::Threaded => slot.control.set(RunPhase::Suspended),
            Execution::Stepped => {
                if let Some(plugin) = slot.plugin.as_mut() {
                    plugin.suspend(context);
                }
            }
        }
        slot.state = PluginState::Suspended;
        log::info!("[scheduler] suspended {}", slot.name);
        Ok(())
    }

    pub fn restart(&mut self, id: PluginId) -> Result<(), PluginError> {
        let context = &self.context;
        let slot = self.slots.get_mut(id.0).ok_or(PluginError::UnknownPlugin(id))?;
        expect_state(slot, &[PluginState::Suspended], "restart")?;

        match slot.execution {
            Execution::Threaded => slot.control.set(RunPhase::Running),
            Execution::Stepped => {
                if let Some(plugin) = slot.plugin.as_mut() {
                    plugin.restart(context);
                }
            }
        }
        slot.state = PluginState::Running;
        log::info!("[scheduler] restarted {}", slot.name);
        Ok(())
    }

    /// Stops a plugin. A threaded plugin's loop is signalled and joined before
    /// its `stop` hook runs.
    pub fn stop(&mut self, id: PluginId) -> Result<(), PluginError> {
        let context = &self.context;
        let slot = self.slots.get_mut(id.0).ok_or(PluginError::UnknownPlugin(id))?;
        expect_state(
            slot,
            &[
                PluginState::Unstarted,
                PluginState::Initialized,
                PluginState::Running,
                PluginState::Suspended,
            ],
            "stop",
        )?;

        if let Some(worker) = slot.worker.take() {
            slot.control.set(RunPhase::Stopping);
            match worker.join() {
                Ok(plugin) => slot.plugin = Some(plugin),
                Err(_) => log::error!("[scheduler] {} run loop panicked", slot.name),
            }
        }

        if slot.state != PluginState::Unstarted {
            if let Some(plugin) = slot.plugin.as_mut() {
                plugin.stop(context);
            }
        }
        slot.state = PluginState::Stopped;
        log::info!("[scheduler] stopped {}", slot.name);
        Ok(())
    }

    /// Stops every plugin that is not stopped yet, newest first.
    pub fn stop_all(&mut self) {
        for id in self.ids().into_iter().rev() {
            if self.state(id) != Some(PluginState::Stopped) {
                if let Err(err) = self.stop(id) {
                    log::warn!("[scheduler] {}", err);
                }
            }
        }
    }

    /// Steps every running stepped plugin once. Plugins step in parallel;
    /// they only share the directory and event bus, which are synchronized.
    pub fn tick(&mut self, delta_seconds: f32) {
        let tick_start = Instant::now();
        let context = &self.context;

        let mut profiles: Vec<PluginProfile> = self
            .slots
            .par_iter_mut()
            .filter(|slot| {
                slot.state == PluginState::Running && slot.execution == Execution::Stepped
            })
            .filter_map(|slot| {
                let plugin = slot.plugin.as_mut()?;
                let start = Instant::now();
                plugin.step(context, delta_seconds);
                Some(PluginProfile {
                    name: slot.name,
                    duration: start.elapsed(),
                })
            })
            .collect();
        profiles.sort_by_key(|profile| profile.name);

        for profile in &profiles {
            if profile.duration_ms() > SLOW_PLUGIN_THRESHOLD_MS {
                log::warn!(
                    "[scheduler] plugin {} took {:.3} ms",
                    profile.name,
                    profile.duration_ms()
                );
            }
        }

        let total = tick_start.elapsed();
        if total.as_secs_f32() * 1000.0 > SLOW_TICK_THRESHOLD_MS {
            log::warn!(
                "[scheduler] tick took {:.3} ms",
                total.as_secs_f64() * 1000.0
            );
        }
        log::trace!(
            "[scheduler] tick {:.3} ms ({} stepped plugins)",
            total.as_secs_f64() * 1000.0,
            profiles.len()
        );

        self.last_profile = TickProfile {
            plugins: profiles,
            total,
        };
    }
}

impl Drop for PluginScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn invalid(slot: &PluginSlot, action: &'static str) -> PluginError {
    PluginError::InvalidTransition {
        plugin: slot.name.to_string(),
        state: slot.state,
        action,
    }
}

fn expect_state(
    slot: &PluginSlot,
    allowed: &[PluginState],
    action: &'static str,
) -> Result<(), PluginError> {
    if allowed.contains(&slot.state) {
        Ok(())
    } else {
        Err(invalid(slot, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> PluginContext {
        let directory = Arc::new(SceneDirectory::new(Arc::new(EventBus::new()), true));
        PluginContext::new(directory, Arc::new(SessionConfig::default()))
    }

    struct Counter {
        name: &'static str,
        execution: Execution,
        fail_init: bool,
        steps: Arc<AtomicUsize>,
        hooks: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Counter {
        fn new(name: &'static str, execution: Execution) -> Self {
            Self {
                name,
                execution,
                fail_init: false,
                steps: Arc::new(AtomicUsize::new(0)),
                hooks: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Plugin for Counter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn execution(&self) -> Execution {
            self.execution
        }

        fn init(&mut self, _context: &PluginContext) -> Result<(), PluginError> {
            if self.fail_init {
                return Err(PluginError::init_failed(self.name, "no device"));
            }
            self.hooks.lock().push("init");
            Ok(())
        }

        fn step(&mut self, _context: &PluginContext, _delta_seconds: f32) {
            self.steps.fetch_add(1, Ordering::SeqCst);
        }

        fn suspend(&mut self, _context: &PluginContext) {
            self.hooks.lock().push("suspend");
        }

        fn restart(&mut self, _context: &PluginContext) {
            self.hooks.lock().push("restart");
        }

        fn stop(&mut self, _context: &PluginContext) {
            self.hooks.lock().push("stop");
        }
    }

    #[test]
    fn stepped_plugin_walks_the_state_machine() {
        let mut scheduler = PluginScheduler::new(context());
        let plugin = Counter::new("counter", Execution::Stepped);
        let steps = Arc::clone(&plugin.steps);
        let hooks = Arc::clone(&plugin.hooks);
        let id = scheduler.register(plugin);

        assert_eq!(scheduler.state(id), Some(PluginState::Unstarted));
        assert!(scheduler.init_all().is_empty());
        assert!(scheduler.start_all().is_empty());
        scheduler.tick(0.016);
        scheduler.suspend(id).expect("suspend");
        scheduler.tick(0.016);
        scheduler.restart(id).expect("restart");
        scheduler.tick(0.016);
        scheduler.stop(id).expect("stop");

        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(*hooks.lock(), vec!["init", "suspend", "restart", "stop"]);
        assert_eq!(scheduler.state(id), Some(PluginState::Stopped));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut scheduler = PluginScheduler::new(context());
        let id = scheduler.register(Counter::new("counter", Execution::Stepped));

        assert!(matches!(
            scheduler.start(id),
            Err(PluginError::InvalidTransition { action: "start", .. })
        ));
        scheduler.init(id).expect("init");
        assert!(matches!(
            scheduler.init(id),
            Err(PluginError::InvalidTransition { action: "init", .. })
        ));
        assert!(scheduler.suspend(id).is_err());
        scheduler.stop(id).expect("stop");
        assert!(scheduler.stop(id).is_err());
        assert_eq!(
            scheduler.state(PluginId(7)),
            None
        );
        assert_eq!(
            scheduler.init(PluginId(7)),
            Err(PluginError::UnknownPlugin(PluginId(7)))
        );
    }

    #[test]
    fn init_failure_halts_only_that_plugin() {
        let mut scheduler = PluginScheduler::new(context());
        let mut broken = Counter::new("broken", Execution::Stepped);
        broken.fail_init = true;
        let healthy = Counter::new("healthy", Execution::Stepped);
        let healthy_steps = Arc::clone(&healthy.steps);
        let broken_id = scheduler.register(broken);
        let healthy_id = scheduler.register(healthy);

        let failures = scheduler.init_all();
        scheduler.start_all();
        scheduler.tick(0.016);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, broken_id);
        assert_eq!(scheduler.state(broken_id), Some(PluginState::Stopped));
        assert_eq!(scheduler.state(healthy_id), Some(PluginState::Running));
        assert_eq!(healthy_steps.load(Ordering::SeqCst), 1);
        assert!(scheduler.last_profile().plugin("healthy").is_some());
    }

    #[test]
    fn threaded_plugin_observes_stop() {
        let mut scheduler = PluginScheduler::new(context());
        scheduler.set_run_interval(Duration::from_millis(1));
        let plugin = Counter::new("worker", Execution::Threaded);
        let steps = Arc::clone(&plugin.steps);
        let hooks = Arc::clone(&plugin.hooks);
        let id = scheduler.register(plugin);
        scheduler.init(id).expect("init");
        scheduler.start(id).expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while steps.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.tick(0.016);
        scheduler.stop(id).expect("stop");

        assert!(steps.load(Ordering::SeqCst) > 0);
        assert_eq!(hooks.lock().last().copied(), Some("stop"));
        assert!(scheduler.last_profile().plugins().is_empty());
    }
}
