use super::{Execution, Plugin, PluginContext, PluginError};
use crate::event::{EventGroup, EventType, SubscriptionId};
use crate::scene::{EntityType, NodeHandle, SceneError, TransformSpace, Vector3};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const TRANSLATE_STEP: f32 = 5.0;
const VERTICAL_STEP: f32 = 1.0;
const ROTATE_STEP: f32 = 0.017;
const NAME_TAG_OFFSET: Vector3 = Vector3::new(0.0, 1.0, 0.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    PageUp,
    PageDown,
    Left,
    Right,
    Up,
    Down,
    Numpad4,
    Numpad6,
}

impl Key {
    pub const ALL: [Key; 12] = [
        Key::W,
        Key::A,
        Key::S,
        Key::D,
        Key::PageUp,
        Key::PageDown,
        Key::Left,
        Key::Right,
        Key::Up,
        Key::Down,
        Key::Numpad4,
        Key::Numpad6,
    ];
}

enum Motion {
    Translate(Vector3),
    Rotate(f32, Vector3, TransformSpace),
}

fn motion_for(key: Key) -> Motion {
    match key {
        Key::W => Motion::Translate(Vector3::new(0.0, 0.0, -TRANSLATE_STEP)),
        Key::S => Motion::Translate(Vector3::new(0.0, 0.0, TRANSLATE_STEP)),
        Key::A => Motion::Translate(Vector3::new(-TRANSLATE_STEP, 0.0, 0.0)),
        Key::D => Motion::Translate(Vector3::new(TRANSLATE_STEP, 0.0, 0.0)),
        Key::PageUp => Motion::Translate(Vector3::new(0.0, VERTICAL_STEP, 0.0)),
        Key::PageDown => Motion::Translate(Vector3::new(0.0, -VERTICAL_STEP, 0.0)),
        Key::Left => Motion::Rotate(ROTATE_STEP, Vector3::UNIT_Y, TransformSpace::World),
        Key::Right => Motion::Rotate(-ROTATE_STEP, Vector3::UNIT_Y, TransformSpace::World),
        Key::Up => Motion::Rotate(ROTATE_STEP, Vector3::UNIT_X, TransformSpace::Local),
        Key::Down => Motion::Rotate(-ROTATE_STEP, Vector3::UNIT_X, TransformSpace::Local),
        Key::Numpad4 => Motion::Rotate(ROTATE_STEP, Vector3::UNIT_Z, TransformSpace::World),
        Key::Numpad6 => Motion::Rotate(-ROTATE_STEP, Vector3::UNIT_Z, TransformSpace::World),
    }
}

/// Device collaborator sampled once per step.
pub trait KeySource: Send {
    /// Keys currently held down.
    fn capture(&mut self) -> HashSet<Key>;
}

/// Key state shared between whoever feeds input and the plugin.
#[derive(Debug, Clone, Default)]
pub struct SharedKeyboard {
    held: Arc<Mutex<HashSet<Key>>>,
}

impl SharedKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self, key: Key) {
        self.held.lock().insert(key);
    }

    pub fn release(&self, key: Key) {
        self.held.lock().remove(&key);
    }

    pub fn release_all(&self) {
        self.held.lock().clear();
    }
}

impl KeySource for SharedKeyboard {
    fn capture(&mut self) -> HashSet<Key> {
        self.held.lock().clone()
    }
}

/// Moves this participant's user node from keyboard state and attaches the
/// participant's cameras to it.
pub struct UserInputPlugin {
    keys: Box<dyn KeySource>,
    execution: Execution,
    user_node: Option<NodeHandle>,
    camera_subscription: Option<SubscriptionId>,
}

impl UserInputPlugin {
    pub fn new<K>(keys: K) -> Self
    where
        K: KeySource + 'static,
    {
        Self {
            keys: Box::new(keys),
            execution: Execution::Stepped,
            user_node: None,
            camera_subscription: None,
        }
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    pub fn user_node(&self) -> Option<&NodeHandle> {
        self.user_node.as_ref()
    }

    fn create_user_node(&self, context: &PluginContext) -> Result<NodeHandle, SceneError> {
        let user_name = &context.config.unique_user_name;
        let node = match context.directory.create_node(user_name) {
            Ok(node) => node,
            Err(SceneError::DuplicateName(_)) => context
                .directory
                .get_node(user_name)
                .ok_or_else(|| SceneError::DuplicateName(user_name.clone()))?,
            Err(err) => return Err(err),
        };

        if context.config.participant.is_networked() {
            let tag_name = format!("{user_name}_tag");
            let tag = context
                .directory
                .create_entity(&tag_name, EntityType::GeometryText)?;
            if let Some(tag) = tag.as_geometry() {
                tag.set_caption(user_name.as_str())?;
                tag.set_offset(NAME_TAG_OFFSET)?;
                tag.set_parent_node(&node)?;
            }
        }
        Ok(node)
    }
}

impl Plugin for UserInputPlugin {
    fn name(&self) -> &'static str {
        "user_input"
    }

    fn execution(&self) -> Execution {
        self.execution
    }

    fn init(&mut self, context: &PluginContext) -> Result<(), PluginError> {
        let node = self
            .create_user_node(context)
            .map_err(|err| PluginError::init_failed(self.name(), err))?;
        log::info!("[input] user node '{}' ready", node.name());

        // only this participant's cameras follow the user node
        let own_prefix = context.config.scoped_name("");
        let directory = Arc::downgrade(&context.directory);
        let anchor = node.clone();
        let subscription = context.events.subscribe(EventGroup::Camera, move |event| {
            if event.kind != EventType::CameraCreate || !event.subject.starts_with(&own_prefix) {
                return;
            }
            let Some(camera) = directory.upgrade().and_then(|d| d.get(&event.subject)) else {
                return;
            };
            match camera.set_parent_node(&anchor) {
                Ok(()) => log::debug!(
                    "[input] camera '{}' attached to '{}'",
                    event.subject,
                    anchor.name()
                ),
                Err(err) => log::warn!("[input] could not attach camera '{}': {}", event.subject, err),
            }
        });

        self.camera_subscription = Some(subscription);
        self.user_node = Some(node);
        Ok(())
    }

    fn step(&mut self, _context: &PluginContext, _delta_seconds: f32) {
        let Some(node) = &self.user_node else {
            return;
        };
        let held = self.keys.capture();
        for key in Key::ALL.into_iter().filter(|key| held.contains(key)) {
            let result = match motion_for(key) {
                Motion::Translate(offset) => node.translate(offset, TransformSpace::Local),
                Motion::Rotate(radians, axis, space) => node.rotate(radians, axis, space),
            };
            if let Err(err) = result {
                log::debug!("[input] {:?} ignored: {}", key, err);
            }
        }
    }

    fn suspend(&mut self, _context: &PluginContext) {
        log::debug!("[input] suspended");
    }

    fn stop(&mut self, context: &PluginContext) {
        if let Some(id) = self.camera_subscription.take() {
            context.events.unsubscribe(id);
        }
    }
}
