use super::{Execution, Plugin, PluginContext, PluginError};
use crate::network::replication::ReplicaManager;
use crate::network::transport::{PacketLink, TransportError};
use crate::network::PeerId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

enum LinkCommand {
    Attach(PeerId, Box<dyn PacketLink>),
    Detach(PeerId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub sync_passes: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub frame_issues: u64,
    pub entities_created: u64,
    pub entities_destroyed: u64,
}

/// Cloneable handle for attaching peer links to a running [`ReplicationPlugin`].
#[derive(Clone, Default)]
pub struct ReplicationHandle {
    commands: Arc<Mutex<Vec<LinkCommand>>>,
    stats: Arc<Mutex<ReplicationStats>>,
}

impl ReplicationHandle {
    pub fn attach<L>(&self, peer: PeerId, link: L)
    where
        L: PacketLink + 'static,
    {
        self.commands
            .lock()
            .push(LinkCommand::Attach(peer, Box::new(link)));
    }

    pub fn detach(&self, peer: PeerId) {
        self.commands.lock().push(LinkCommand::Detach(peer));
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.lock().clone()
    }
}

/// Runs the replica protocol once per sync interval: drain every link, apply
/// what arrived, then send each peer its delta.
pub struct ReplicationPlugin {
    handle: ReplicationHandle,
    execution: Execution,
    manager: Option<ReplicaManager>,
    links: BTreeMap<PeerId, Box<dyn PacketLink>>,
    since_sync: f32,
}

impl Default for ReplicationPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationPlugin {
    pub fn new() -> Self {
        Self {
            handle: ReplicationHandle::default(),
            execution: Execution::Stepped,
            manager: None,
            links: BTreeMap::new(),
            since_sync: 0.0,
        }
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    pub fn handle(&self) -> ReplicationHandle {
        self.handle.clone()
    }

    fn drain_commands(&mut self) {
        let commands = std::mem::take(&mut *self.handle.commands.lock());
        for command in commands {
            match command {
                LinkCommand::Attach(peer, link) => {
                    if let Some(manager) = self.manager.as_mut() {
                        manager.peer_connected(peer);
                    }
                    self.links.insert(peer, link);
                }
                LinkCommand::Detach(peer) => self.disconnect(peer),
            }
        }
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.links.remove(&peer);
        if let Some(manager) = self.manager.as_mut() {
            let removed = manager.peer_disconnected(peer);
            self.handle.stats.lock().entities_destroyed += removed.len() as u64;
        }
    }

    /// One full receive/apply/send pass over every attached link.
    pub fn sync(&mut self) {
        self.drain_commands();
        let Some(manager) = self.manager.as_mut() else {
            return;
        };
        let mut stats = ReplicationStats::default();
        let mut lost = Vec::new();

        for (peer, link) in self.links.iter_mut() {
            loop {
                match link.try_recv() {
                    Ok(Some(bytes)) => {
                        stats.packets_received += 1;
                        match manager.apply(*peer, &bytes) {
                            Ok(report) => {
                                stats.frame_issues += report.issues.len() as u64;
                                stats.entities_created += report.created.len() as u64;
                                stats.entities_destroyed += report.destroyed.len() as u64;
                            }
                            Err(_) => stats.packets_dropped += 1,
                        }
                    }
                    Ok(None) => break,
                    Err(TransportError::Disconnected) => {
                        lost.push(*peer);
                        break;
                    }
                    Err(err) => {
                        log::warn!("[replica] receive from {:?} failed: {}", peer, err);
                        break;
                    }
                }
            }
        }

        for (peer, link) in self.links.iter_mut() {
            if lost.contains(peer) {
                continue;
            }
            let packet = match manager.serialize_for(*peer) {
                Ok(packet) if packet.is_empty() => continue,
                Ok(packet) => packet,
                Err(err) => {
                    log::warn!("[replica] {}", err);
                    continue;
                }
            };
            let sent = packet
                .encode()
                .map_err(|err| TransportError::Serialization(err.to_string()))
                .and_then(|bytes| link.send(bytes));
            match sent {
                Ok(()) => stats.packets_sent += 1,
                Err(TransportError::Disconnected) => lost.push(*peer),
                Err(err) => log::warn!("[replica] send to {:?} failed: {}", peer, err),
            }
        }

        {
            let mut total = self.handle.stats.lock();
            total.sync_passes += 1;
            total.packets_sent += stats.packets_sent;
            total.packets_received += stats.packets_received;
            total.packets_dropped += stats.packets_dropped;
            total.frame_issues += stats.frame_issues;
            total.entities_created += stats.entities_created;
            total.entities_destroyed += stats.entities_destroyed;
        }

        for peer in lost {
            log::info!("[replica] link to {:?} closed", peer);
            self.disconnect(peer);
        }
    }
}

impl Plugin for ReplicationPlugin {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn execution(&self) -> Execution {
        self.execution
    }

    fn init(&mut self, context: &PluginContext) -> Result<(), PluginError> {
        self.manager = Some(ReplicaManager::new(Arc::clone(&context.directory)));
        log::info!(
            "[replica] session '{}' as {:?}, sync every {} ms",
            context.config.session_name,
            context.config.participant,
            context.config.sync_interval_ms
        );
        Ok(())
    }

    fn step(&mut self, context: &PluginContext, delta_seconds: f32) {
        self.since_sync += delta_seconds;
        if self.since_sync < context.config.sync_interval().as_secs_f32() {
            return;
        }
        self.since_sync = 0.0;
        self.sync();
    }

    fn stop(&mut self, _context: &PluginContext) {
        // flush whatever changed since the last pass
        self.sync();
        let peers: Vec<PeerId> = self.links.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer);
        }
        self.manager = None;
    }
}
