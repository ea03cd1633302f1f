pub mod directory;
pub mod entity;
mod handle;
pub mod math;

pub use directory::{Lookup, SceneDirectory};
pub use entity::{
    BoxParameters, CylinderParameters, EntityType, FieldId, FieldValue, FileParameters,
    GeometryParameters, LightKind, PlaneParameters, SphereParameters, TextParameters,
    TransformSpace, TubeParameters,
};
pub use handle::{
    CameraHandle, EntityHandle, GeometryHandle, LightHandle, MaterialHandle, NodeHandle,
};
pub use math::{Color, Quaternion, Vector3};

use crate::event::EventBus;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("entity name '{0}' already exists")]
    DuplicateName(String),
    #[error("entity '{0}' has been destroyed")]
    ExpiredHandle(String),
    #[error("setting parent of '{subject}' to '{parent}' would create a cycle")]
    HierarchyCycle { subject: String, parent: String },
    #[error("entity '{entity}' of type {entity_type:?} does not accept {detail}")]
    TypeMismatch {
        entity: String,
        entity_type: EntityType,
        detail: String,
    },
    #[error("entity '{entity}' rejects a non-finite {field}")]
    NonFinite { entity: String, field: String },
    #[error("entity '{entity}' of type {entity_type:?} has no field {field:?}")]
    UnknownField {
        entity: String,
        entity_type: EntityType,
        field: FieldId,
    },
}

/// Process-scoped collaborators shared by the directory and every entity it
/// creates.
pub struct SceneServices {
    events: Arc<EventBus>,
    hierarchy: Mutex<()>,
}

impl SceneServices {
    pub fn new(events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            events,
            hierarchy: Mutex::new(()),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
