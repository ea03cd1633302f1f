use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const MAX_DISPATCH_DEPTH: u32 = 32;

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Restores the dispatch depth on drop, including while unwinding out of a
/// panicking handler.
struct DepthGuard(u32);

impl DepthGuard {
    fn enter(depth: u32) -> Self {
        DISPATCH_DEPTH.with(|d| d.set(depth + 1));
        DepthGuard(depth)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(self.0));
    }
}

/// Coarse category used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventGroup {
    Node,
    Geometry,
    Material,
    Light,
    Camera,
}

impl EventGroup {
    pub const fn ordered() -> [EventGroup; 5] {
        [
            EventGroup::Node,
            EventGroup::Geometry,
            EventGroup::Material,
            EventGroup::Light,
            EventGroup::Camera,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NodeCreate,
    NodeDelete,
    NodeParent,
    NodePosition,
    NodeOrientation,
    NodeScale,
    NodeVisibility,
    GeometryCreate,
    GeometryDelete,
    GeometryParameters,
    GeometryParent,
    GeometryMaterial,
    MaterialCreate,
    MaterialDelete,
    MaterialDiffuse,
    MaterialSpecular,
    MaterialAmbient,
    MaterialEmissive,
    LightCreate,
    LightDelete,
    LightKind,
    LightDiffuse,
    LightSpecular,
    LightParent,
    CameraCreate,
    CameraDelete,
    CameraParent,
    CameraNearClip,
    CameraFarClip,
    CameraFieldOfView,
    CameraAspectRatio,
}

impl EventType {
    pub fn group(self) -> EventGroup {
        use EventType::*;
        match self {
            NodeCreate | NodeDelete | NodeParent | NodePosition | NodeOrientation | NodeScale
            | NodeVisibility => EventGroup::Node,
            GeometryCreate | GeometryDelete | GeometryParameters | GeometryParent
            | GeometryMaterial => EventGroup::Geometry,
            MaterialCreate | MaterialDelete | MaterialDiffuse | MaterialSpecular
            | MaterialAmbient | MaterialEmissive => EventGroup::Material,
            LightCreate | LightDelete | LightKind | LightDiffuse | LightSpecular | LightParent => {
                EventGroup::Light
            }
            CameraCreate | CameraDelete | CameraParent | CameraNearClip | CameraFarClip
            | CameraFieldOfView | CameraAspectRatio => EventGroup::Camera,
        }
    }

    pub fn is_create(self) -> bool {
        matches!(
            self,
            EventType::NodeCreate
                | EventType::GeometryCreate
                | EventType::MaterialCreate
                | EventType::LightCreate
                | EventType::CameraCreate
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            EventType::NodeDelete
                | EventType::GeometryDelete
                | EventType::MaterialDelete
                | EventType::LightDelete
                | EventType::CameraDelete
        )
    }
}

/// Fire-and-forget notification about a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub subject: String,
    pub group: EventGroup,
    pub kind: EventType,
}

impl Event {
    pub fn new(subject: impl Into<String>, kind: EventType) -> Self {
        Self {
            subject: subject.into(),
            group: kind.group(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
    active: Arc<AtomicBool>,
}

/// Grouped publish/subscribe dispatcher.
///
/// Dispatch is synchronous on the publishing thread and walks a snapshot of the
/// group's subscriptions, so handlers may publish, subscribe or unsubscribe
/// without holding any bus lock. A subscription removed mid-pass is skipped for
/// the remainder of that pass.
pub struct EventBus {
    next_id: AtomicU64,
    groups: RwLock<HashMap<EventGroup, Vec<Subscription>>>,
    owners: RwLock<HashMap<SubscriptionId, EventGroup>>,
    published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            groups: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, group: EventGroup, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            id,
            handler: Arc::new(handler),
            active: Arc::new(AtomicBool::new(true)),
        };
        self.groups
            .write()
            .entry(group)
            .or_default()
            .push(subscription);
        self.owners.write().insert(id, group);
        log::debug!("[events] subscription {:?} added to {:?}", id, group);
        id
    }

    /// Removes a subscription. Returns `false` when the id was unknown or
    /// already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(group) = self.owners.write().remove(&id) else {
            return false;
        };

        let mut groups = self.groups.write();
        if let Some(subscriptions) = groups.get_mut(&group) {
            if let Some(position) = subscriptions.iter().position(|sub| sub.id == id) {
                let removed = subscriptions.remove(position);
                removed.active.store(false, Ordering::Release);
            }
            if subscriptions.is_empty() {
                groups.remove(&group);
            }
        }
        log::debug!("[events] subscription {:?} removed from {:?}", id, group);
        true
    }

    pub fn publish(&self, event: &Event) {
        let depth = DISPATCH_DEPTH.with(|depth| depth.get());
        if depth >= MAX_DISPATCH_DEPTH {
            log::error!(
                "[events] dropping {:?} for '{}': re-entrant dispatch depth {} exceeded",
                event.kind,
                event.subject,
                MAX_DISPATCH_DEPTH
            );
            return;
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        let snapshot = match self.groups.read().get(&event.group) {
            Some(subscriptions) => subscriptions.clone(),
            None => return,
        };

        let _depth = DepthGuard::enter(depth);
        for subscription in &snapshot {
            if subscription.active.load(Ordering::Acquire) {
                (subscription.handler)(event);
            }
        }
    }

    pub fn subscriber_count(&self, group: EventGroup) -> usize {
        self.groups.read().get(&group).map_or(0, Vec::len)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
