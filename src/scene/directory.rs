use super::entity::{EntityCell, EntityType, RelationLink};
use super::handle::{EntityHandle, NodeHandle};
use super::{SceneError, SceneServices};
use crate::event::{Event, EventBus};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Result of a name lookup that keeps "never existed" apart from "destroyed".
#[derive(Debug, Clone)]
pub enum Lookup {
    Live(EntityHandle),
    Destroyed,
    Unknown,
}

impl Lookup {
    pub fn handle(self) -> Option<EntityHandle> {
        match self {
            Lookup::Live(handle) => Some(handle),
            Lookup::Destroyed | Lookup::Unknown => None,
        }
    }
}

/// Names remembered as destroyed. Only the most recent ones are kept; older
/// names fall back to `Lookup::Unknown`.
const MAX_TOMBSTONES: usize = 4096;

struct Tombstones {
    names: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Tombstones {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            names: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, name: &str) {
        if !self.names.insert(name.to_string()) {
            return;
        }
        self.order.push_back(name.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.names.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, name: &str) {
        if self.names.remove(name) {
            self.order.retain(|entry| entry != name);
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

struct DirectoryInner {
    entities: HashMap<String, Arc<EntityCell>>,
    by_type: HashMap<EntityType, BTreeSet<String>>,
    tombstones: Tombstones,
}

impl Default for DirectoryInner {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            by_type: HashMap::new(),
            tombstones: Tombstones::with_capacity(MAX_TOMBSTONES),
        }
    }
}

/// Name-indexed registry of live entities. The directory is the only owner of
/// entity storage; callers receive weak handles.
pub struct SceneDirectory {
    services: Arc<SceneServices>,
    local_is_host: bool,
    inner: RwLock<DirectoryInner>,
}

impl SceneDirectory {
    pub fn new(events: Arc<EventBus>, local_is_host: bool) -> Self {
        Self {
            services: SceneServices::new(events),
            local_is_host,
            inner: RwLock::new(DirectoryInner::default()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.services.events()
    }

    pub fn local_is_host(&self) -> bool {
        self.local_is_host
    }

    /// Creates an entity authored by this participant.
    pub fn create_entity(
        &self,
        name: &str,
        entity_type: EntityType,
    ) -> Result<EntityHandle, SceneError> {
        self.create(name, entity_type, self.local_is_host)
    }

    pub fn create_node(&self, name: &str) -> Result<NodeHandle, SceneError> {
        let handle = self.create_entity(name, EntityType::Node)?;
        handle
            .as_node()
            .ok_or_else(|| SceneError::ExpiredHandle(name.to_string()))
    }

    pub fn create(
        &self,
        name: &str,
        entity_type: EntityType,
        host_created: bool,
    ) -> Result<EntityHandle, SceneError> {
        let cell = {
            let mut inner = self.inner.write();
            if inner.entities.contains_key(name) {
                log::warn!("[directory] rejected duplicate entity name '{name}'");
                return Err(SceneError::DuplicateName(name.to_string()));
            }
            let cell = EntityCell::new(
                name.to_string(),
                entity_type,
                host_created,
                Arc::clone(&self.services),
            );
            inner.entities.insert(name.to_string(), Arc::clone(&cell));
            inner
                .by_type
                .entry(entity_type)
                .or_default()
                .insert(name.to_string());
            inner.tombstones.remove(name);
            cell
        };

        log::debug!(
            "[directory] created {} '{}' (host created: {})",
            entity_type.label(),
            name,
            host_created
        );
        let handle = EntityHandle::from_cell(&cell);
        self.events()
            .publish(&Event::new(name, entity_type.create_event()));
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<EntityHandle> {
        self.cell(name).map(|cell| EntityHandle::from_cell(&cell))
    }

    pub fn get_node(&self, name: &str) -> Option<NodeHandle> {
        self.get(name).and_then(|handle| handle.as_node())
    }

    pub fn lookup(&self, name: &str) -> Lookup {
        let inner = self.inner.read();
        if let Some(cell) = inner.entities.get(name) {
            Lookup::Live(EntityHandle::from_cell(cell))
        } else if inner.tombstones.contains(name) {
            Lookup::Destroyed
        } else {
            Lookup::Unknown
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().entities.contains_key(name)
    }

    /// Removes an entity. Destroying an absent name is a no-op and returns
    /// `false`.
    pub fn destroy(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.entities.remove(name);
            if let Some(cell) = &removed {
                if let Some(names) = inner.by_type.get_mut(&cell.entity_type()) {
                    names.remove(name);
                }
                inner.tombstones.insert(name);
            }
            removed
        };

        match removed {
            Some(cell) => {
                log::debug!("[directory] destroyed {} '{}'", cell.entity_type().label(), name);
                let kind = cell.entity_type().delete_event();
                drop(cell);
                self.events().publish(&Event::new(name, kind));
                true
            }
            None => false,
        }
    }

    pub fn entities_of_type(&self, entity_type: EntityType) -> Vec<EntityHandle> {
        let inner = self.inner.read();
        inner
            .by_type
            .get(&entity_type)
            .into_iter()
            .flatten()
            .filter_map(|name| inner.entities.get(name))
            .map(EntityHandle::from_cell)
            .collect()
    }

    /// Entities whose parent relation currently resolves to `parent`.
    pub fn children_of(&self, parent: &str) -> Vec<EntityHandle> {
        let mut children: Vec<EntityHandle> = self
            .cells()
            .into_iter()
            .filter(|cell| {
                cell.read(|state| {
                    state
                        .parent()
                        .filter(|link| link.is_resolved())
                        .and_then(RelationLink::name)
                        == Some(parent)
                })
            })
            .map(|cell| EntityHandle::from_cell(&cell))
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        children
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().entities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn cell(&self, name: &str) -> Option<Arc<EntityCell>> {
        self.inner.read().entities.get(name).cloned()
    }

    /// Snapshot of every live entity, sorted by name for deterministic passes.
    pub(crate) fn cells(&self) -> Vec<Arc<EntityCell>> {
        let mut cells: Vec<Arc<EntityCell>> =
            self.inner.read().entities.values().cloned().collect();
        cells.sort_by(|a, b| a.name().cmp(b.name()));
        cells
    }
}
