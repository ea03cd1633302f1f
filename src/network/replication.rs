use super::waitlist::RelationWaitlist;
use super::{DeltaFrame, NetworkSession, PeerId, ReplicaMessage, ReplicaPacket, WireField};
use crate::event::{EventGroup, SubscriptionId};
use crate::scene::entity::{EntityCell, RelationLink};
use crate::scene::{EntityType, FieldId, FieldValue, SceneDirectory, SceneError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed delta for '{entity}': {reason}")]
    MalformedDelta { entity: String, reason: String },
    #[error("'{subject}' {field:?} refers to '{target}', which is not known yet")]
    UnresolvedReference {
        subject: String,
        field: FieldId,
        target: String,
    },
    #[error("'{entity}' carries field {field:?} unknown to the local schema")]
    StaleApply { entity: String, field: FieldId },
    #[error("peer {peer:?} may not {action} host entity '{entity}'")]
    AuthorityViolation {
        peer: PeerId,
        entity: String,
        action: &'static str,
    },
    #[error("peer {0:?} is not connected")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// What we last told (or heard from) one peer about one entity.
#[derive(Debug, Clone)]
struct EntitySnapshot {
    entity_type: EntityType,
    fields: HashMap<FieldId, FieldValue>,
}

#[derive(Debug, Default)]
struct PeerReplica {
    snapshots: HashMap<String, EntitySnapshot>,
    schema_warned: bool,
}

/// Outcome of applying one packet. Per-frame problems are collected in
/// `issues` instead of failing the packet.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub sequence: u64,
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    pub applied_fields: usize,
    pub deferred: usize,
    pub issues: Vec<ReplicaError>,
}

/// Per-participant side of the replica protocol.
///
/// Keeps one snapshot per peer and entity. Absence of a snapshot means the
/// peer has never heard of the entity from us, so the next pass sends full
/// state. Applying a delta from a peer updates that peer's snapshot, which
/// stops the change from echoing back while still relaying it to every other
/// peer.
pub struct ReplicaManager {
    directory: Arc<SceneDirectory>,
    session: NetworkSession,
    peers: BTreeMap<PeerId, PeerReplica>,
    origins: Arc<Mutex<HashMap<String, PeerId>>>,
    waitlist: Arc<Mutex<RelationWaitlist>>,
    subscriptions: Vec<SubscriptionId>,
}

impl ReplicaManager {
    pub fn new(directory: Arc<SceneDirectory>) -> Self {
        let waitlist = Arc::new(Mutex::new(RelationWaitlist::new()));
        let origins: Arc<Mutex<HashMap<String, PeerId>>> = Arc::new(Mutex::new(HashMap::new()));

        let events = Arc::clone(directory.events());
        let subscriptions = EventGroup::ordered()
            .into_iter()
            .map(|group| {
                let directory = Arc::downgrade(&directory);
                let waitlist = Arc::clone(&waitlist);
                let origins = Arc::clone(&origins);
                events.subscribe(group, move |event| {
                    let Some(directory) = directory.upgrade() else {
                        return;
                    };
                    if event.kind.is_create() {
                        resolve_waiting(&directory, &waitlist, &event.subject);
                    } else if event.kind.is_delete() {
                        waitlist.lock().forget_subject(&event.subject);
                        origins.lock().remove(&event.subject);
                        park_dependents(&directory, &waitlist, &event.subject);
                    }
                })
            })
            .collect();

        Self {
            directory,
            session: NetworkSession::new(),
            peers: BTreeMap::new(),
            origins,
            waitlist,
            subscriptions,
        }
    }

    pub fn directory(&self) -> &Arc<SceneDirectory> {
        &self.directory
    }

    pub fn peer_connected(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        log::info!("[replica] peer {:?} connected", peer);
        self.peers.insert(peer, PeerReplica::default());
        true
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Forgets the peer. On the host, entities the peer created are destroyed
    /// locally; the removal reaches the remaining peers on their next pass.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Vec<String> {
        if self.peers.remove(&peer).is_none() {
            return Vec::new();
        }
        log::info!("[replica] peer {:?} disconnected", peer);
        if !self.directory.local_is_host() {
            return Vec::new();
        }

        let mut orphaned: Vec<String> = self
            .origins
            .lock()
            .iter()
            .filter(|(_, origin)| **origin == peer)
            .map(|(name, _)| name.clone())
            .collect();
        orphaned.sort();

        orphaned.retain(|name| {
            let guest_owned = self
                .directory
                .cell(name)
                .is_some_and(|cell| !cell.is_host_created());
            guest_owned && self.directory.destroy(name)
        });
        self.origins.lock().retain(|_, origin| *origin != peer);

        if !orphaned.is_empty() {
            log::info!(
                "[replica] cleaned up {} entities created by peer {:?}",
                orphaned.len(),
                peer
            );
        }
        orphaned
    }

    /// Number of relations still waiting for their target to appear.
    pub fn pending_relations(&self) -> usize {
        self.waitlist.lock().len()
    }

    /// Peer whose delta created `name` locally, if it came from the network.
    pub fn origin_of(&self, name: &str) -> Option<PeerId> {
        self.origins.lock().get(name).copied()
    }

    /// Serialization pass for one peer. Snapshots advance as if the packet
    /// was delivered; the link below is reliable and ordered.
    pub fn serialize_for(&mut self, peer: PeerId) -> Result<ReplicaPacket, ReplicaError> {
        let replica = self
            .peers
            .get_mut(&peer)
            .ok_or(ReplicaError::UnknownPeer(peer))?;
        let mut messages = Vec::new();
        let mut live = HashSet::new();

        for cell in self.directory.cells() {
            live.insert(cell.name().to_string());

            let snapshot = replica.snapshots.get(cell.name());
            if snapshot.is_some_and(|snapshot| snapshot.entity_type != cell.entity_type()) {
                // same name, new entity: the peer still holds the old one
                messages.push(ReplicaMessage::Destroy {
                    entity_name: cell.name().to_string(),
                });
                replica.snapshots.remove(cell.name());
            }

            let first_sync = !replica.snapshots.contains_key(cell.name());
            let snapshot = replica
                .snapshots
                .entry(cell.name().to_string())
                .or_insert_with(|| EntitySnapshot {
                    entity_type: cell.entity_type(),
                    fields: HashMap::new(),
                });

            let mut fields = Vec::new();
            for (field, value) in cell.fields() {
                if snapshot.fields.get(&field) == Some(&value) {
                    continue;
                }
                if !value.is_finite() {
                    // JSON would carry it as null; keep it out of the snapshot
                    log::warn!(
                        "[replica] not sending non-finite {} of '{}'",
                        field.label(),
                        cell.name()
                    );
                    continue;
                }
                match serde_json::to_value(&value) {
                    Ok(encoded) => {
                        fields.push(WireField {
                            field,
                            value: encoded,
                        });
                        snapshot.fields.insert(field, value);
                    }
                    Err(err) => log::warn!(
                        "[replica] could not encode {} of '{}': {}",
                        field.label(),
                        cell.name(),
                        err
                    ),
                }
            }

            if first_sync || !fields.is_empty() {
                messages.push(ReplicaMessage::Delta(DeltaFrame {
                    entity_name: cell.name().to_string(),
                    entity_type: cell.entity_type(),
                    host_created: cell.is_host_created(),
                    first_sync,
                    fields,
                }));
            }
        }

        let mut gone: Vec<String> = replica
            .snapshots
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();
        gone.sort();
        for name in gone {
            replica.snapshots.remove(&name);
            messages.push(ReplicaMessage::Destroy { entity_name: name });
        }

        if !messages.is_empty() {
            log::trace!("[replica] {} messages queued for peer {:?}", messages.len(), peer);
        }
        Ok(self.session.craft_packet(messages))
    }

    /// Decodes and applies a packet received from `peer`. Only an unreadable
    /// packet envelope is an error; the link stays usable either way.
    pub fn apply(&mut self, peer: PeerId, bytes: &[u8]) -> Result<ApplyReport, ReplicaError> {
        let encoded = ReplicaPacket::decode(bytes).map_err(|err| {
            log::warn!("[replica] dropping unreadable packet from {:?}: {}", peer, err);
            ReplicaError::Codec(err)
        })?;

        if self.peer_connected(peer) {
            log::debug!("[replica] first packet from {:?} registered the peer", peer);
        }
        let local_hash = super::schema::schema_hash();
        if let Some(replica) = self.peers.get_mut(&peer) {
            if encoded.schema_hash != local_hash && !replica.schema_warned {
                replica.schema_warned = true;
                log::warn!(
                    "[replica] peer {:?} schema {:#x} differs from local {:#x}; unknown fields will be skipped",
                    peer,
                    encoded.schema_hash,
                    local_hash
                );
            }
        }

        let mut report = ApplyReport {
            sequence: encoded.sequence,
            ..ApplyReport::default()
        };
        for message in encoded.into_messages() {
            match message {
                Ok(message) => self.apply_message(peer, message, &mut report),
                Err(err) => {
                    log::warn!("[replica] dropping unreadable frame from {:?}: {}", peer, err);
                    report.issues.push(ReplicaError::MalformedDelta {
                        entity: String::new(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Applies an already decoded packet, as used by in-process links.
    pub fn apply_packet(&mut self, peer: PeerId, packet: ReplicaPacket) -> ApplyReport {
        self.peer_connected(peer);
        let mut report = ApplyReport {
            sequence: packet.sequence,
            ..ApplyReport::default()
        };
        for message in packet.messages {
            self.apply_message(peer, message, &mut report);
        }
        report
    }

    fn apply_message(&mut self, peer: PeerId, message: ReplicaMessage, report: &mut ApplyReport) {
        let result = match message {
            ReplicaMessage::Delta(frame) => self.apply_delta(peer, frame, report),
            ReplicaMessage::Destroy { entity_name } => {
                self.apply_destroy(peer, &entity_name, report)
            }
        };
        if let Err(err) = result {
            match &err {
                ReplicaError::MalformedDelta { .. } | ReplicaError::AuthorityViolation { .. } => {
                    log::warn!("[replica] {}", err)
                }
                _ => log::debug!("[replica] {}", err),
            }
            report.issues.push(err);
        }
    }

    fn apply_delta(
        &mut self,
        peer: PeerId,
        frame: DeltaFrame,
        report: &mut ApplyReport,
    ) -> Result<(), ReplicaError> {
        let fields = decode_fields(&frame, report)?;

        let cell = match self.directory.cell(&frame.entity_name) {
            Some(cell) if cell.entity_type() != frame.entity_type => {
                return Err(ReplicaError::MalformedDelta {
                    entity: frame.entity_name,
                    reason: format!(
                        "declared {:?} but local entity is {:?}",
                        frame.entity_type,
                        cell.entity_type()
                    ),
                });
            }
            Some(cell) => cell,
            None => {
                if self.directory.local_is_host() && frame.host_created {
                    return Err(ReplicaError::AuthorityViolation {
                        peer,
                        entity: frame.entity_name,
                        action: "create",
                    });
                }
                self.create_remote(peer, &frame, report)?
            }
        };

        let mut applied = Vec::with_capacity(fields.len());
        let mut rejected = Vec::new();
        for (field, value) in fields {
            let outcome = match &value {
                FieldValue::Reference(target) => {
                    self.apply_relation(&cell, field, target.as_deref(), report)
                }
                _ => cell.apply_value(field, value.clone()).map_err(ReplicaError::from),
            };
            match outcome {
                Ok(()) => applied.push((field, value)),
                Err(err) => {
                    log::warn!("[replica] rejected {} of '{}': {}", field.label(), cell.name(), err);
                    rejected.push(field);
                    report.issues.push(err);
                }
            }
        }

        report.applied_fields += applied.len();
        let local_is_host = self.directory.local_is_host();
        if let Some(replica) = self.peers.get_mut(&peer) {
            let snapshot = replica
                .snapshots
                .entry(frame.entity_name)
                .or_insert_with(|| EntitySnapshot {
                    entity_type: frame.entity_type,
                    fields: HashMap::new(),
                });
            snapshot.fields.extend(applied);
            if local_is_host {
                // the host's own value goes back on the next pass
                for field in rejected {
                    snapshot.fields.remove(&field);
                }
            }
        }
        Ok(())
    }

    fn create_remote(
        &self,
        peer: PeerId,
        frame: &DeltaFrame,
        report: &mut ApplyReport,
    ) -> Result<Arc<EntityCell>, ReplicaError> {
        match self
            .directory
            .create(&frame.entity_name, frame.entity_type, frame.host_created)
        {
            Ok(_) => {
                if !frame.host_created {
                    self.origins.lock().insert(frame.entity_name.clone(), peer);
                }
                report.created.push(frame.entity_name.clone());
            }
            // lost a race with a concurrent local create; the check below
            // decides whether the winner is usable
            Err(SceneError::DuplicateName(_)) => {}
            Err(err) => return Err(err.into()),
        }
        match self.directory.cell(&frame.entity_name) {
            Some(cell) if cell.entity_type() == frame.entity_type => Ok(cell),
            _ => Err(ReplicaError::MalformedDelta {
                entity: frame.entity_name.clone(),
                reason: "entity vanished or changed type while applying".to_string(),
            }),
        }
    }

    fn apply_relation(
        &self,
        cell: &Arc<EntityCell>,
        field: FieldId,
        target: Option<&str>,
        report: &mut ApplyReport,
    ) -> Result<(), ReplicaError> {
        self.waitlist.lock().cancel(cell.name(), field);

        let Some(target) = target else {
            return Ok(cell.link(field, None, None)?);
        };

        if let Some(target_cell) = self.directory.cell(target) {
            return match cell.link(field, Some(target.to_string()), Some(&target_cell)) {
                Err(SceneError::HierarchyCycle { .. }) if !self.directory.local_is_host() => {
                    yield_to_host(cell, &target_cell)?;
                    Ok(cell.link(field, Some(target.to_string()), Some(&target_cell))?)
                }
                result => Ok(result?),
            };
        }

        cell.link(field, Some(target.to_string()), None)?;
        self.waitlist.lock().queue(cell.name(), field, target);
        report.deferred += 1;
        log::debug!(
            "[replica] {}",
            ReplicaError::UnresolvedReference {
                subject: cell.name().to_string(),
                field,
                target: target.to_string(),
            }
        );

        // the target may have been created between the lookup and the queue
        if self.directory.contains(target) {
            resolve_waiting(&self.directory, &self.waitlist, target);
        }
        Ok(())
    }

    fn apply_destroy(
        &mut self,
        peer: PeerId,
        name: &str,
        report: &mut ApplyReport,
    ) -> Result<(), ReplicaError> {
        let forget = |peers: &mut BTreeMap<PeerId, PeerReplica>| {
            if let Some(replica) = peers.get_mut(&peer) {
                replica.snapshots.remove(name);
            }
        };

        let Some(cell) = self.directory.cell(name) else {
            forget(&mut self.peers);
            return Ok(());
        };

        if self.directory.local_is_host() && cell.is_host_created() {
            // resend full state so the guest gets the entity back
            forget(&mut self.peers);
            return Err(ReplicaError::AuthorityViolation {
                peer,
                entity: name.to_string(),
                action: "destroy",
            });
        }

        drop(cell);
        forget(&mut self.peers);
        if self.directory.destroy(name) {
            report.destroyed.push(name.to_string());
        }
        Ok(())
    }
}

impl Drop for ReplicaManager {
    fn drop(&mut self) {
        let events = self.directory.events();
        for id in self.subscriptions.drain(..) {
            events.unsubscribe(id);
        }
    }
}

/// Validates every carried field before anything is applied, so a malformed
/// frame leaves no partial state behind. Unknown field ids are skipped.
fn decode_fields(
    frame: &DeltaFrame,
    report: &mut ApplyReport,
) -> Result<Vec<(FieldId, FieldValue)>, ReplicaError> {
    let mut fields = Vec::with_capacity(frame.fields.len());
    for WireField { field, value } in &frame.fields {
        if frame.entity_type.field_event(*field).is_none() {
            let stale = ReplicaError::StaleApply {
                entity: frame.entity_name.clone(),
                field: *field,
            };
            log::debug!("[replica] {}", stale);
            report.issues.push(stale);
            continue;
        }
        let decoded: FieldValue =
            serde_json::from_value(value.clone()).map_err(|err| ReplicaError::MalformedDelta {
                entity: frame.entity_name.clone(),
                reason: format!("{}: {}", field.label(), err),
            })?;
        if !decoded.fits(frame.entity_type, *field) {
            return Err(ReplicaError::MalformedDelta {
                entity: frame.entity_name.clone(),
                reason: format!(
                    "{} does not accept the supplied value for {:?}",
                    field.label(),
                    frame.entity_type
                ),
            });
        }
        fields.push((*field, decoded));
    }
    Ok(fields)
}

/// Clears the local parent link that makes `target` a descendant of `cell`,
/// so a parent sent by the host can be applied.
fn yield_to_host(cell: &Arc<EntityCell>, target: &Arc<EntityCell>) -> Result<(), SceneError> {
    let chain = std::iter::once(Arc::clone(target)).chain(target.ancestors());
    for ancestor in chain {
        let parent = ancestor.read(|state| state.parent().and_then(RelationLink::target));
        if parent.is_some_and(|parent| Arc::ptr_eq(&parent, cell)) {
            log::info!(
                "[replica] dropping local parent of '{}' in favor of host parent for '{}'",
                ancestor.name(),
                cell.name()
            );
            return ancestor.link(FieldId::PARENT_NODE, None, None);
        }
    }
    Ok(())
}

/// Requeues relations that pointed at a destroyed entity, so they link
/// again if an entity with that name comes back.
fn park_dependents(directory: &SceneDirectory, waitlist: &Mutex<RelationWaitlist>, target: &str) {
    let mut dependents = Vec::new();
    for cell in directory.cells() {
        for field in [FieldId::PARENT_NODE, FieldId::MATERIAL] {
            let names_target = cell.read(|state| {
                state.relation(field).and_then(RelationLink::name) == Some(target)
            });
            if names_target {
                dependents.push((cell.name().to_string(), field));
            }
        }
    }
    if dependents.is_empty() {
        return;
    }
    let mut waitlist = waitlist.lock();
    for (subject, field) in dependents {
        waitlist.queue(&subject, field, target);
    }
}

/// Links every relation waiting on `target`. Must not be called with the
/// waitlist lock held, since linking publishes events.
fn resolve_waiting(directory: &SceneDirectory, waitlist: &Mutex<RelationWaitlist>, target: &str) {
    let pending = waitlist.lock().take_waiting_on(target);
    if pending.is_empty() {
        return;
    }
    let Some(target_cell) = directory.cell(target) else {
        let mut waitlist = waitlist.lock();
        for relation in pending {
            waitlist.queue(&relation.subject, relation.field, &relation.target);
        }
        return;
    };

    for relation in pending {
        let Some(subject) = directory.cell(&relation.subject) else {
            continue;
        };
        let still_named = subject.read(|state| {
            state.relation(relation.field).and_then(RelationLink::name) == Some(target)
        });
        if !still_named {
            continue;
        }
        match subject.link(relation.field, Some(target.to_string()), Some(&target_cell)) {
            Ok(()) => log::debug!(
                "[replica] resolved {} of '{}' to '{}'",
                relation.field.label(),
                relation.subject,
                target
            ),
            Err(err) => log::warn!(
                "[replica] could not resolve {} of '{}': {}",
                relation.field.label(),
                relation.subject,
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::scene::{CylinderParameters, GeometryParameters, Vector3};

    const HOST: PeerId = PeerId(1);
    const GUEST: PeerId = PeerId(2);
    const OTHER_GUEST: PeerId = PeerId(3);

    fn participant(is_host: bool) -> ReplicaManager {
        let directory = Arc::new(SceneDirectory::new(Arc::new(EventBus::new()), is_host));
        ReplicaManager::new(directory)
    }

    fn transfer(
        from: &mut ReplicaManager,
        from_id: PeerId,
        to: &mut ReplicaManager,
        to_id: PeerId,
    ) -> ApplyReport {
        from.peer_connected(to_id);
        let bytes = from
            .serialize_for(to_id)
            .expect("serialize")
            .encode()
            .expect("encode");
        to.apply(from_id, &bytes).expect("apply")
    }

    fn build_room(replica: &ReplicaManager) {
        let directory = replica.directory();
        let room = directory.create_node("room1").expect("room");
        let cyl = directory
            .create_entity("cyl1", EntityType::GeometryCylinder)
            .expect("cyl")
            .as_geometry()
            .expect("geometry");
        cyl.set_parent_node(&room).expect("parent");
        cyl.set_cylinder_parameters(2.0, 5.0, 1.0).expect("params");
    }

    fn cylinder_of(replica: &ReplicaManager, name: &str) -> CylinderParameters {
        match replica
            .directory()
            .get(name)
            .and_then(|h| h.as_geometry())
            .expect("cylinder")
            .parameters()
            .expect("parameters")
        {
            GeometryParameters::Cylinder(params) => params,
            other => panic!("expected cylinder parameters, got {other:?}"),
        }
    }

    #[test]
    fn room_and_cylinder_reach_the_guest() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);

        let report = transfer(&mut host, HOST, &mut guest, GUEST);

        assert_eq!(report.created.len(), 2);
        let params = cylinder_of(&guest, "cyl1");
        assert_eq!(params.radius, 2.0);
        assert_eq!(params.height, 5.0);
        let cyl = guest.directory().get("cyl1").expect("cyl1");
        assert_eq!(cyl.parent_node_name().as_deref(), Some("room1"));
        assert!(cyl.parent_node().is_some());
        assert_eq!(cyl.is_host_created(), Ok(true));
    }

    #[test]
    fn out_of_order_parent_is_resolved_when_it_arrives() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        host.peer_connected(GUEST);
        let packet = host.serialize_for(GUEST).expect("serialize");

        let (cyl_first, room_later): (Vec<_>, Vec<_>) = packet
            .messages
            .into_iter()
            .partition(|m| m.entity_name() == "cyl1");
        let first = guest.apply_packet(
            HOST,
            ReplicaPacket {
                messages: cyl_first,
                ..ReplicaPacket::default()
            },
        );
        assert_eq!(first.deferred, 1);
        assert_eq!(guest.pending_relations(), 1);
        let cyl = guest.directory().get("cyl1").expect("cyl1");
        assert!(cyl.parent_node().is_none());
        assert_eq!(cyl.parent_node_name().as_deref(), Some("room1"));

        guest.apply_packet(
            HOST,
            ReplicaPacket {
                messages: room_later,
                ..ReplicaPacket::default()
            },
        );

        assert_eq!(guest.pending_relations(), 0);
        assert_eq!(
            cyl.parent_node().map(|p| p.name().to_string()).as_deref(),
            Some("room1")
        );
    }

    #[test]
    fn applying_the_same_packet_twice_is_idempotent() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        host.peer_connected(GUEST);
        let bytes = host.serialize_for(GUEST).expect("serialize").encode().expect("encode");

        guest.apply(HOST, &bytes).expect("first");
        let before = guest.directory().get("cyl1").expect("cyl").fields().expect("fields");
        let second = guest.apply(HOST, &bytes).expect("second");
        let after = guest.directory().get("cyl1").expect("cyl").fields().expect("fields");

        assert!(second.created.is_empty());
        assert_eq!(before, after);
        assert_eq!(guest.directory().len(), 2);
    }

    #[test]
    fn only_changed_fields_are_sent_after_first_sync() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        transfer(&mut host, HOST, &mut guest, GUEST);

        let quiet = host.serialize_for(GUEST).expect("serialize");
        assert!(quiet.is_empty());

        host.directory()
            .get_node("room1")
            .expect("room")
            .set_position(Vector3::new(1.0, 2.0, 3.0))
            .expect("move");
        let packet = host.serialize_for(GUEST).expect("serialize");
        assert_eq!(packet.messages.len(), 1);
        match &packet.messages[0] {
            ReplicaMessage::Delta(frame) => {
                assert!(!frame.first_sync);
                assert_eq!(frame.fields.len(), 1);
                assert_eq!(frame.fields[0].field, FieldId::POSITION);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn applied_changes_do_not_echo_back_but_relay_to_others() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        host.peer_connected(OTHER_GUEST);
        let _ = host.serialize_for(OTHER_GUEST).expect("prime other guest");
        transfer(&mut host, HOST, &mut guest, GUEST);
        transfer(&mut guest, GUEST, &mut host, HOST);

        guest
            .directory()
            .get_node("room1")
            .expect("room")
            .set_scale(Vector3::new(2.0, 2.0, 2.0))
            .expect("scale");
        transfer(&mut guest, GUEST, &mut host, HOST);

        assert!(host.serialize_for(GUEST).expect("serialize").is_empty());
        let relay = host.serialize_for(OTHER_GUEST).expect("serialize");
        assert_eq!(relay.messages.len(), 1);
        assert_eq!(relay.messages[0].entity_name(), "room1");
    }

    #[test]
    fn unknown_fields_are_skipped_as_stale() {
        let mut guest = participant(false);
        let raw = br#"{"sequence":1,"timestamp_ms":0,"schema_hash":7,"messages":[
            {"Delta":{"entity_name":"n","entity_type":"Node","host_created":true,"first_sync":true,
              "fields":[{"field":999,"value":{"Scalar":1.0}},
                        {"field":10,"value":{"Vector":{"x":1.0,"y":0.0,"z":0.0}}}]}}
        ]}"#;

        let report = guest.apply(HOST, raw).expect("apply");

        assert!(matches!(report.issues[0], ReplicaError::StaleApply { .. }));
        assert_eq!(report.applied_fields, 1);
        let node = guest.directory().get_node("n").expect("node");
        assert_eq!(node.position(), Ok(Vector3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn malformed_frame_is_dropped_without_losing_the_rest() {
        let mut guest = participant(false);
        let raw = br#"{"sequence":1,"timestamp_ms":0,"schema_hash":0,"messages":[
            {"Delta":{"entity_name":"bad","entity_type":"Node","host_created":true,"first_sync":true,
              "fields":[{"field":10,"value":{"Flag":true}}]}},
            {"Delta":{"entity_name":"good","entity_type":"Node","host_created":true,"first_sync":true,
              "fields":[]}}
        ]}"#;

        let report = guest.apply(HOST, raw).expect("apply");

        assert!(matches!(report.issues[0], ReplicaError::MalformedDelta { .. }));
        assert!(!guest.directory().contains("bad"));
        assert!(guest.directory().contains("good"));
        assert!(guest.apply(HOST, b"not json").is_err());
    }

    #[test]
    fn destroy_propagates_to_peers() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        transfer(&mut host, HOST, &mut guest, GUEST);

        assert!(host.directory().destroy("cyl1"));
        let report = transfer(&mut host, HOST, &mut guest, GUEST);

        assert_eq!(report.destroyed, vec!["cyl1".to_string()]);
        assert!(!guest.directory().contains("cyl1"));
    }

    #[test]
    fn host_refuses_guest_destroy_of_host_entity() {
        let mut host = participant(true);
        let mut guest = participant(false);
        build_room(&host);
        transfer(&mut host, HOST, &mut guest, GUEST);
        transfer(&mut guest, GUEST, &mut host, HOST);

        guest.directory().destroy("room1");
        let report = transfer(&mut guest, GUEST, &mut host, HOST);
        assert!(matches!(
            report.issues[0],
            ReplicaError::AuthorityViolation { action: "destroy", .. }
        ));
        assert!(host.directory().contains("room1"));

        transfer(&mut host, HOST, &mut guest, GUEST);
        assert!(guest.directory().contains("room1"));
        let cyl = guest.directory().get("cyl1").expect("cyl1");
        assert_eq!(
            cyl.parent_node().map(|p| p.name().to_string()).as_deref(),
            Some("room1")
        );
    }

    #[test]
    fn host_cleans_up_after_a_departed_guest() {
        let mut host = participant(true);
        let mut guest = participant(false);
        guest.directory().create_node("guest_avatar").expect("avatar");
        transfer(&mut guest, GUEST, &mut host, HOST);
        assert_eq!(host.origin_of("guest_avatar"), Some(GUEST));

        let removed = host.peer_disconnected(GUEST);

        assert_eq!(removed, vec!["guest_avatar".to_string()]);
        assert!(!host.directory().contains("guest_avatar"));
    }

    fn parent_frame(child: &str, parent: &str) -> ReplicaPacket {
        ReplicaPacket {
            messages: vec![ReplicaMessage::Delta(DeltaFrame {
                entity_name: child.into(),
                entity_type: EntityType::Node,
                host_created: true,
                first_sync: false,
                fields: vec![WireField {
                    field: FieldId::PARENT_NODE,
                    value: serde_json::to_value(FieldValue::Reference(Some(parent.into())))
                        .expect("json"),
                }],
            })],
            ..ReplicaPacket::default()
        }
    }

    #[test]
    fn guest_gives_way_to_a_host_parent_that_would_cycle() {
        let mut host = participant(true);
        let mut guest = participant(false);
        let a = host.directory().create_node("a").expect("a");
        let b = host.directory().create_node("b").expect("b");
        b.set_parent_node(&a).expect("b under a");
        transfer(&mut host, HOST, &mut guest, GUEST);

        // the guest independently puts a under b, then hears b is under a
        let guest_a = guest.directory().get_node("a").expect("a");
        let guest_b = guest.directory().get_node("b").expect("b");
        guest_b.clear_parent_node().expect("clear");
        guest_a.set_parent_node(&guest_b).expect("a under b");

        let report = guest.apply_packet(HOST, parent_frame("b", "a"));

        assert!(report.issues.is_empty(), "{:?}", report.issues);
        assert_eq!(guest_b.parent_node_name().as_deref(), Some("a"));
        assert_eq!(guest_a.parent_node_name(), None);
    }

    #[test]
    fn host_rejects_a_guest_cycle_and_resends_its_parent() {
        let mut host = participant(true);
        let mut guest = participant(false);
        let a = host.directory().create_node("a").expect("a");
        let b = host.directory().create_node("b").expect("b");
        b.set_parent_node(&a).expect("b under a");
        transfer(&mut host, HOST, &mut guest, GUEST);
        transfer(&mut guest, GUEST, &mut host, HOST);

        let report = host.apply_packet(GUEST, parent_frame("a", "b"));
        assert!(matches!(
            report.issues[0],
            ReplicaError::Scene(SceneError::HierarchyCycle { .. })
        ));

        let resend = host.serialize_for(GUEST).expect("serialize");
        assert_eq!(resend.messages.len(), 1);
        match &resend.messages[0] {
            ReplicaMessage::Delta(frame) => {
                assert_eq!(frame.entity_name, "a");
                assert_eq!(frame.fields[0].field, FieldId::PARENT_NODE);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_reparenting_converges_on_the_host_hierarchy() {
        for host_speaks_first in [true, false] {
            let mut host = participant(true);
            let mut guest = participant(false);
            host.directory().create_node("a").expect("a");
            host.directory().create_node("b").expect("b");
            transfer(&mut host, HOST, &mut guest, GUEST);
            transfer(&mut guest, GUEST, &mut host, HOST);

            let host_a = host.directory().get_node("a").expect("a");
            let host_b = host.directory().get_node("b").expect("b");
            host_b.set_parent_node(&host_a).expect("b under a");
            let guest_a = guest.directory().get_node("a").expect("a");
            let guest_b = guest.directory().get_node("b").expect("b");
            guest_a.set_parent_node(&guest_b).expect("a under b");

            for _ in 0..3 {
                if host_speaks_first {
                    transfer(&mut host, HOST, &mut guest, GUEST);
                    transfer(&mut guest, GUEST, &mut host, HOST);
                } else {
                    transfer(&mut guest, GUEST, &mut host, HOST);
                    transfer(&mut host, HOST, &mut guest, GUEST);
                }
            }

            for directory in [host.directory(), guest.directory()] {
                let a = directory.get_node("a").expect("a");
                let b = directory.get_node("b").expect("b");
                assert_eq!(a.parent_node_name(), None, "host first: {host_speaks_first}");
                assert_eq!(b.parent_node_name().as_deref(), Some("a"));
            }
            assert!(host.serialize_for(GUEST).expect("serialize").is_empty());
            assert!(guest.serialize_for(HOST).expect("serialize").is_empty());
        }
    }

    #[test]
    fn guest_may_not_claim_host_authority_for_a_new_entity() {
        let mut host = participant(true);
        let frame = ReplicaMessage::Delta(DeltaFrame {
            entity_name: "forged".into(),
            entity_type: EntityType::Node,
            host_created: true,
            first_sync: true,
            fields: Vec::new(),
        });

        let report = host.apply_packet(
            GUEST,
            ReplicaPacket {
                messages: vec![frame],
                ..ReplicaPacket::default()
            },
        );

        assert!(matches!(
            report.issues[0],
            ReplicaError::AuthorityViolation { action: "create", .. }
        ));
        assert!(!host.directory().contains("forged"));
    }

    #[test]
    fn out_of_order_material_is_resolved_when_it_arrives() {
        let mut host = participant(true);
        let mut guest = participant(false);
        let paint = host
            .directory()
            .create_entity("paint", EntityType::MaterialManual)
            .expect("paint")
            .as_material()
            .expect("material");
        let ball = host
            .directory()
            .create_entity("ball", EntityType::GeometrySphere)
            .expect("ball")
            .as_geometry()
            .expect("geometry");
        ball.set_material(&paint).expect("material");
        host.peer_connected(GUEST);
        let packet = host.serialize_for(GUEST).expect("serialize");

        let (ball_first, paint_later): (Vec<_>, Vec<_>) = packet
            .messages
            .into_iter()
            .partition(|m| m.entity_name() == "ball");
        let first = guest.apply_packet(
            HOST,
            ReplicaPacket {
                messages: ball_first,
                ..ReplicaPacket::default()
            },
        );
        assert_eq!(first.deferred, 1);
        let ball = guest
            .directory()
            .get("ball")
            .and_then(|h| h.as_geometry())
            .expect("ball");
        assert!(ball.material().is_none());
        assert_eq!(ball.material_name().as_deref(), Some("paint"));

        guest.apply_packet(
            HOST,
            ReplicaPacket {
                messages: paint_later,
                ..ReplicaPacket::default()
            },
        );

        assert_eq!(guest.pending_relations(), 0);
        assert_eq!(
            ball.material().map(|m| m.name().to_string()).as_deref(),
            Some("paint")
        );
    }

    #[test]
    fn relation_to_the_wrong_kind_of_entity_is_rejected() {
        let mut guest = participant(false);
        guest
            .directory()
            .create("paint", EntityType::MaterialManual, true)
            .expect("paint");
        let frame = ReplicaMessage::Delta(DeltaFrame {
            entity_name: "ball".into(),
            entity_type: EntityType::GeometrySphere,
            host_created: true,
            first_sync: true,
            fields: vec![WireField {
                field: FieldId::PARENT_NODE,
                value: serde_json::to_value(FieldValue::Reference(Some("paint".into())))
                    .expect("json"),
            }],
        });

        let report = guest.apply_packet(
            HOST,
            ReplicaPacket {
                messages: vec![frame],
                ..ReplicaPacket::default()
            },
        );

        assert!(matches!(
            report.issues[0],
            ReplicaError::Scene(SceneError::TypeMismatch { .. })
        ));
        let ball = guest.directory().get("ball").expect("ball");
        assert_eq!(ball.parent_node_name(), None);
    }

    #[test]
    fn refused_non_finite_value_does_not_hold_back_other_fields() {
        let mut host = participant(true);
        let mut guest = participant(false);
        let camera = host
            .directory()
            .create_entity("cam", EntityType::Camera)
            .expect("camera")
            .as_camera()
            .expect("camera handle");
        transfer(&mut host, HOST, &mut guest, GUEST);

        assert!(camera.set_aspect_ratio(f32::INFINITY).is_err());
        camera.set_near_clip_distance(0.5).expect("near clip");
        let report = transfer(&mut host, HOST, &mut guest, GUEST);

        assert!(report.issues.is_empty(), "{:?}", report.issues);
        let on_guest = guest
            .directory()
            .get("cam")
            .and_then(|h| h.as_camera())
            .expect("camera");
        assert_eq!(on_guest.near_clip_distance(), Ok(0.5));
        assert_eq!(on_guest.aspect_ratio(), Ok(4.0 / 3.0));
    }

    #[test]
    fn non_finite_values_from_the_wire_are_malformed() {
        let value = FieldValue::Scalar(f32::NAN);
        assert!(!value.fits(EntityType::Camera, FieldId::ASPECT_RATIO));

        let mut guest = participant(false);
        let raw = br#"{"sequence":1,"timestamp_ms":0,"schema_hash":0,"messages":[
            {"Delta":{"entity_name":"cam","entity_type":"Camera","host_created":true,"first_sync":true,
              "fields":[{"field":43,"value":{"Scalar":null}},{"field":40,"value":{"Scalar":0.5}}]}}
        ]}"#;
        let report = guest.apply(HOST, raw).expect("apply");

        assert!(matches!(report.issues[0], ReplicaError::MalformedDelta { .. }));
        assert!(!guest.directory().contains("cam"));
    }
}
