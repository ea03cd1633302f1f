use crate::config::SessionConfig;
use crate::event::EventBus;
use crate::network::transport::PacketLink;
use crate::network::PeerId;
use crate::plugin::replication::{ReplicationHandle, ReplicationPlugin};
use crate::plugin::{Plugin, PluginContext, PluginError, PluginId, PluginScheduler, TickProfile};
use crate::scene::SceneDirectory;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const DEFAULT_MAX_FRAMES: u32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("participant is not networked; no replication plugin to attach {0:?} to")]
    NotNetworked(PeerId),
}

/// Owns one participant's scene, event bus and plugins.
pub struct Engine {
    scheduler: PluginScheduler,
    replication: Option<ReplicationHandle>,
    target_frame_time: f32,
    max_frames: u32,
    frames: u64,
    total_time: f32,
    started: bool,
}

impl Engine {
    pub fn new(config: SessionConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let directory = Arc::new(SceneDirectory::new(
            events,
            config.participant.is_authoritative(),
        ));
        let networked = config.participant.is_networked();
        let context = PluginContext::new(directory, Arc::new(config));

        let mut engine = Self {
            scheduler: PluginScheduler::new(context),
            replication: None,
            target_frame_time: 1.0 / 60.0,
            max_frames: DEFAULT_MAX_FRAMES,
            frames: 0,
            total_time: 0.0,
            started: false,
        };

        if networked {
            let plugin = ReplicationPlugin::new();
            engine.replication = Some(plugin.handle());
            engine.add_plugin(plugin);
        }
        engine
    }

    pub fn add_plugin<P>(&mut self, plugin: P) -> PluginId
    where
        P: Plugin + 'static,
    {
        self.scheduler.register(plugin)
    }

    /// Hands a link to the replication plugin. Takes effect on its next pass.
    pub fn attach_peer<L>(&self, peer: PeerId, link: L) -> Result<(), EngineError>
    where
        L: PacketLink + 'static,
    {
        let handle = self
            .replication
            .as_ref()
            .ok_or(EngineError::NotNetworked(peer))?;
        log::info!("[engine] attaching peer {:?}", peer);
        handle.attach(peer, link);
        Ok(())
    }

    pub fn detach_peer(&self, peer: PeerId) {
        if let Some(handle) = &self.replication {
            handle.detach(peer);
        }
    }

    pub fn replication(&self) -> Option<&ReplicationHandle> {
        self.replication.as_ref()
    }

    pub fn configure_max_frames(&mut self, frames: u32) {
        self.max_frames = frames.max(1);
    }

    /// Initializes and starts every registered plugin. Plugins that fail to
    /// initialize are halted and reported; the rest keep going.
    pub fn start(&mut self) -> Vec<(PluginId, PluginError)> {
        let mut failures = self.scheduler.init_all();
        failures.extend(self.scheduler.start_all());
        for (id, err) in &failures {
            log::warn!("[engine] plugin {:?} unavailable: {}", id, err);
        }
        self.started = true;
        failures
    }

    /// Advances stepped plugins by one frame.
    pub fn step_frame(&mut self, delta_seconds: f32) {
        if !self.started {
            self.start();
        }
        self.scheduler.tick(delta_seconds);
        self.frames += 1;
        self.total_time += delta_seconds;
        log::debug!(
            "[engine] frame {} avg {:.4}s tick {:.3} ms entities {}",
            self.frames,
            self.total_time / self.frames as f32,
            self.scheduler.last_profile().total_ms(),
            self.directory().len()
        );
    }

    pub fn run(&mut self) {
        let mut last_frame = Instant::now();
        for _ in 0..self.max_frames {
            let now = Instant::now();
            let raw_delta = now.duration_since(last_frame).as_secs_f32();
            let delta_seconds = if raw_delta == 0.0 {
                self.target_frame_time
            } else {
                raw_delta
            };
            last_frame = now;

            self.step_frame(delta_seconds);
        }
    }

    /// Stops every plugin, newest first.
    pub fn shutdown(&mut self) {
        self.scheduler.stop_all();
        log::info!("[engine] shut down after {} frames", self.frames);
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_profile(&self) -> &TickProfile {
        self.scheduler.last_profile()
    }

    pub fn context(&self) -> &PluginContext {
        self.scheduler.context()
    }

    pub fn directory(&self) -> &Arc<SceneDirectory> {
        &self.scheduler.context().directory
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.scheduler.context().events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.scheduler.context().config
    }

    pub fn scheduler(&self) -> &PluginScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut PluginScheduler {
        &mut self.scheduler
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantRole;
    use crate::network::transport::LoopbackLink;
    use crate::plugin::PluginState;

    #[test]
    fn networked_participants_get_replication() {
        let host = Engine::new(SessionConfig::for_role(ParticipantRole::Host));
        assert!(host.replication().is_some());
        assert!(host.scheduler().find("replication").is_some());
        assert!(host.directory().local_is_host());

        let local = Engine::default();
        assert!(local.replication().is_none());
        let (link, _other) = LoopbackLink::pair();
        assert!(matches!(
            local.attach_peer(PeerId(9), link),
            Err(EngineError::NotNetworked(PeerId(9)))
        ));
    }

    #[test]
    fn run_starts_plugins_and_counts_frames() {
        let mut engine = Engine::new(SessionConfig::for_role(ParticipantRole::Guest));
        engine.configure_max_frames(0);
        engine.run();
        assert_eq!(engine.frames(), 1);
        assert!(!engine.directory().local_is_host());

        let id = engine.scheduler().find("replication").expect("replication");
        assert_eq!(engine.scheduler().state(id), Some(PluginState::Running));
        engine.shutdown();
        assert_eq!(engine.scheduler().state(id), Some(PluginState::Stopped));
    }
}
