use super::math::{Color, Quaternion, Vector3};
use super::{SceneError, SceneServices};
use crate::event::{Event, EventGroup, EventType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Upper bound on ancestor walks. A well-formed hierarchy never gets close.
const MAX_HIERARCHY_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    GeometryBox,
    GeometryCylinder,
    GeometryTube,
    GeometrySphere,
    GeometryPlane,
    GeometryText,
    GeometryFile,
    MaterialManual,
    Light,
    Camera,
}

impl EntityType {
    pub const fn all() -> [EntityType; 11] {
        [
            EntityType::Node,
            EntityType::GeometryBox,
            EntityType::GeometryCylinder,
            EntityType::GeometryTube,
            EntityType::GeometrySphere,
            EntityType::GeometryPlane,
            EntityType::GeometryText,
            EntityType::GeometryFile,
            EntityType::MaterialManual,
            EntityType::Light,
            EntityType::Camera,
        ]
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityType::Node => "Node",
            EntityType::GeometryBox => "BoxGeometry",
            EntityType::GeometryCylinder => "CylinderGeometry",
            EntityType::GeometryTube => "TubeGeometry",
            EntityType::GeometrySphere => "SphereGeometry",
            EntityType::GeometryPlane => "PlaneGeometry",
            EntityType::GeometryText => "TextGeometry",
            EntityType::GeometryFile => "FileGeometry",
            EntityType::MaterialManual => "ManualMaterial",
            EntityType::Light => "Light",
            EntityType::Camera => "Camera",
        }
    }

    pub fn is_geometry(self) -> bool {
        self.group() == EventGroup::Geometry
    }

    pub fn group(self) -> EventGroup {
        match self {
            EntityType::Node => EventGroup::Node,
            EntityType::MaterialManual => EventGroup::Material,
            EntityType::Light => EventGroup::Light,
            EntityType::Camera => EventGroup::Camera,
            _ => EventGroup::Geometry,
        }
    }

    pub fn create_event(self) -> EventType {
        match self.group() {
            EventGroup::Node => EventType::NodeCreate,
            EventGroup::Geometry => EventType::GeometryCreate,
            EventGroup::Material => EventType::MaterialCreate,
            EventGroup::Light => EventType::LightCreate,
            EventGroup::Camera => EventType::CameraCreate,
        }
    }

    pub fn delete_event(self) -> EventType {
        match self.group() {
            EventGroup::Node => EventType::NodeDelete,
            EventGroup::Geometry => EventType::GeometryDelete,
            EventGroup::Material => EventType::MaterialDelete,
            EventGroup::Light => EventType::LightDelete,
            EventGroup::Camera => EventType::CameraDelete,
        }
    }

    /// Replicated fields of this type paired with the event fired when each
    /// one changes, in wire order.
    pub fn field_table(self) -> &'static [(FieldId, EventType)] {
        const NODE: &[(FieldId, EventType)] = &[
            (FieldId::PARENT_NODE, EventType::NodeParent),
            (FieldId::POSITION, EventType::NodePosition),
            (FieldId::ORIENTATION, EventType::NodeOrientation),
            (FieldId::SCALE, EventType::NodeScale),
            (FieldId::VISIBLE, EventType::NodeVisibility),
        ];
        const GEOMETRY: &[(FieldId, EventType)] = &[
            (FieldId::PARENT_NODE, EventType::GeometryParent),
            (FieldId::MATERIAL, EventType::GeometryMaterial),
            (FieldId::PARAMETERS, EventType::GeometryParameters),
        ];
        const MATERIAL: &[(FieldId, EventType)] = &[
            (FieldId::DIFFUSE, EventType::MaterialDiffuse),
            (FieldId::SPECULAR, EventType::MaterialSpecular),
            (FieldId::AMBIENT, EventType::MaterialAmbient),
            (FieldId::EMISSIVE, EventType::MaterialEmissive),
        ];
        const LIGHT: &[(FieldId, EventType)] = &[
            (FieldId::PARENT_NODE, EventType::LightParent),
            (FieldId::LIGHT_KIND, EventType::LightKind),
            (FieldId::DIFFUSE, EventType::LightDiffuse),
            (FieldId::SPECULAR, EventType::LightSpecular),
        ];
        const CAMERA: &[(FieldId, EventType)] = &[
            (FieldId::PARENT_NODE, EventType::CameraParent),
            (FieldId::NEAR_CLIP, EventType::CameraNearClip),
            (FieldId::FAR_CLIP, EventType::CameraFarClip),
            (FieldId::FIELD_OF_VIEW, EventType::CameraFieldOfView),
            (FieldId::ASPECT_RATIO, EventType::CameraAspectRatio),
        ];

        match self.group() {
            EventGroup::Node => NODE,
            EventGroup::Geometry => GEOMETRY,
            EventGroup::Material => MATERIAL,
            EventGroup::Light => LIGHT,
            EventGroup::Camera => CAMERA,
        }
    }

    pub fn field_event(self, field: FieldId) -> Option<EventType> {
        self.field_table()
            .iter()
            .find(|(id, _)| *id == field)
            .map(|(_, event)| *event)
    }
}

/// Wire identifier of a replicated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u16);

impl FieldId {
    pub const PARENT_NODE: FieldId = FieldId(1);
    pub const MATERIAL: FieldId = FieldId(2);
    pub const PARAMETERS: FieldId = FieldId(3);
    pub const POSITION: FieldId = FieldId(10);
    pub const ORIENTATION: FieldId = FieldId(11);
    pub const SCALE: FieldId = FieldId(12);
    pub const VISIBLE: FieldId = FieldId(13);
    pub const DIFFUSE: FieldId = FieldId(20);
    pub const SPECULAR: FieldId = FieldId(21);
    pub const AMBIENT: FieldId = FieldId(22);
    pub const EMISSIVE: FieldId = FieldId(23);
    pub const LIGHT_KIND: FieldId = FieldId(30);
    pub const NEAR_CLIP: FieldId = FieldId(40);
    pub const FAR_CLIP: FieldId = FieldId(41);
    pub const FIELD_OF_VIEW: FieldId = FieldId(42);
    pub const ASPECT_RATIO: FieldId = FieldId(43);

    pub fn label(self) -> &'static str {
        match self {
            FieldId::PARENT_NODE => "parent_node",
            FieldId::MATERIAL => "material",
            FieldId::PARAMETERS => "parameters",
            FieldId::POSITION => "position",
            FieldId::ORIENTATION => "orientation",
            FieldId::SCALE => "scale",
            FieldId::VISIBLE => "visible",
            FieldId::DIFFUSE => "diffuse",
            FieldId::SPECULAR => "specular",
            FieldId::AMBIENT => "ambient",
            FieldId::EMISSIVE => "emissive",
            FieldId::LIGHT_KIND => "light_kind",
            FieldId::NEAR_CLIP => "near_clip",
            FieldId::FAR_CLIP => "far_clip",
            FieldId::FIELD_OF_VIEW => "field_of_view",
            FieldId::ASPECT_RATIO => "aspect_ratio",
            _ => "unknown",
        }
    }

    pub fn is_relation(self) -> bool {
        self == FieldId::PARENT_NODE || self == FieldId::MATERIAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxParameters {
    pub dimensions: Vector3,
}

impl Default for BoxParameters {
    fn default() -> Self {
        Self {
            dimensions: Vector3::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CylinderParameters {
    pub radius: f32,
    pub height: f32,
    pub tile: f32,
}

impl Default for CylinderParameters {
    fn default() -> Self {
        Self {
            radius: 1.0,
            height: 1.0,
            tile: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TubeParameters {
    pub height: f32,
    pub tile: f32,
}

impl Default for TubeParameters {
    fn default() -> Self {
        Self {
            height: 1.0,
            tile: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphereParameters {
    pub radius: f32,
    pub tile: f32,
}

impl Default for SphereParameters {
    fn default() -> Self {
        Self {
            radius: 1.0,
            tile: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaneParameters {
    pub subdivision: [f32; 2],
    pub size: [f32; 2],
    pub tile: [f32; 2],
}

impl Default for PlaneParameters {
    fn default() -> Self {
        Self {
            subdivision: [1.0, 1.0],
            size: [1.0, 1.0],
            tile: [1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextParameters {
    pub caption: String,
    pub offset: Vector3,
    pub visible: bool,
}

impl Default for TextParameters {
    fn default() -> Self {
        Self {
            caption: String::new(),
            offset: Vector3::ZERO,
            visible: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileParameters {
    pub file_name: String,
}

/// Type-specific parameter block of a geometry, compared as a whole to detect
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeometryParameters {
    Box(BoxParameters),
    Cylinder(CylinderParameters),
    Tube(TubeParameters),
    Sphere(SphereParameters),
    Plane(PlaneParameters),
    Text(TextParameters),
    File(FileParameters),
}

impl GeometryParameters {
    pub fn default_for(entity_type: EntityType) -> Option<Self> {
        let parameters = match entity_type {
            EntityType::GeometryBox => GeometryParameters::Box(BoxParameters::default()),
            EntityType::GeometryCylinder => {
                GeometryParameters::Cylinder(CylinderParameters::default())
            }
            EntityType::GeometryTube => GeometryParameters::Tube(TubeParameters::default()),
            EntityType::GeometrySphere => GeometryParameters::Sphere(SphereParameters::default()),
            EntityType::GeometryPlane => GeometryParameters::Plane(PlaneParameters::default()),
            EntityType::GeometryText => GeometryParameters::Text(TextParameters::default()),
            EntityType::GeometryFile => GeometryParameters::File(FileParameters::default()),
            _ => return None,
        };
        Some(parameters)
    }

    pub fn is_finite(&self) -> bool {
        match self {
            GeometryParameters::Box(p) => p.dimensions.is_finite(),
            GeometryParameters::Cylinder(p) => {
                p.radius.is_finite() && p.height.is_finite() && p.tile.is_finite()
            }
            GeometryParameters::Tube(p) => p.height.is_finite() && p.tile.is_finite(),
            GeometryParameters::Sphere(p) => p.radius.is_finite() && p.tile.is_finite(),
            GeometryParameters::Plane(p) => p
                .subdivision
                .iter()
                .chain(&p.size)
                .chain(&p.tile)
                .all(|v| v.is_finite()),
            GeometryParameters::Text(p) => p.offset.is_finite(),
            GeometryParameters::File(_) => true,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            GeometryParameters::Box(_) => EntityType::GeometryBox,
            GeometryParameters::Cylinder(_) => EntityType::GeometryCylinder,
            GeometryParameters::Tube(_) => EntityType::GeometryTube,
            GeometryParameters::Sphere(_) => EntityType::GeometrySphere,
            GeometryParameters::Plane(_) => EntityType::GeometryPlane,
            GeometryParameters::Text(_) => EntityType::GeometryText,
            GeometryParameters::File(_) => EntityType::GeometryFile,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LightKind {
    #[default]
    Point,
    Directional,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformSpace {
    #[default]
    Local,
    Parent,
    World,
}

/// Current value of a replicated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Reference(Option<String>),
    Vector(Vector3),
    Rotation(Quaternion),
    Color(Color),
    Scalar(f32),
    Flag(bool),
    Light(LightKind),
    Parameters(GeometryParameters),
}

impl FieldValue {
    /// False when any float inside the value is NaN or infinite. JSON has no
    /// encoding for those.
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Vector(v) => v.is_finite(),
            FieldValue::Rotation(q) => q.is_finite(),
            FieldValue::Color(c) => c.is_finite(),
            FieldValue::Scalar(s) => s.is_finite(),
            FieldValue::Parameters(p) => p.is_finite(),
            FieldValue::Reference(_) | FieldValue::Flag(_) | FieldValue::Light(_) => true,
        }
    }

    /// Whether this value can be stored in `field` of an `entity_type` entity.
    pub fn fits(&self, entity_type: EntityType, field: FieldId) -> bool {
        if entity_type.field_event(field).is_none() || !self.is_finite() {
            return false;
        }
        match (field, self) {
            (FieldId::PARENT_NODE | FieldId::MATERIAL, FieldValue::Reference(_)) => true,
            (FieldId::POSITION | FieldId::SCALE, FieldValue::Vector(_)) => true,
            (FieldId::ORIENTATION, FieldValue::Rotation(_)) => true,
            (FieldId::VISIBLE, FieldValue::Flag(_)) => true,
            (
                FieldId::DIFFUSE | FieldId::SPECULAR | FieldId::AMBIENT | FieldId::EMISSIVE,
                FieldValue::Color(_),
            ) => true,
            (FieldId::LIGHT_KIND, FieldValue::Light(_)) => true,
            (
                FieldId::NEAR_CLIP
                | FieldId::FAR_CLIP
                | FieldId::FIELD_OF_VIEW
                | FieldId::ASPECT_RATIO,
                FieldValue::Scalar(_),
            ) => true,
            (FieldId::PARAMETERS, FieldValue::Parameters(parameters)) => {
                parameters.entity_type() == entity_type
            }
            _ => false,
        }
    }
}

/// Non-owning relation to another entity, identified by name.
///
/// The name survives even when the target is not (yet) alive locally, so the
/// relation can be resolved later and is replicated faithfully meanwhile.
#[derive(Debug, Clone, Default)]
pub(crate) struct RelationLink {
    name: Option<String>,
    target: Weak<EntityCell>,
}

impl RelationLink {
    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn target(&self) -> Option<Arc<EntityCell>> {
        self.target.upgrade()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.name.is_some() && self.target.strong_count() > 0
    }

    fn assign(&mut self, name: Option<String>, target: Option<&Arc<EntityCell>>) {
        self.name = name;
        self.target = target.map(Arc::downgrade).unwrap_or_default();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub(crate) parent: RelationLink,
    pub(crate) position: Vector3,
    pub(crate) orientation: Quaternion,
    pub(crate) scale: Vector3,
    pub(crate) visible: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct GeometryState {
    pub(crate) parent: RelationLink,
    pub(crate) material: RelationLink,
    pub(crate) parameters: GeometryParameters,
}

#[derive(Debug, Clone)]
pub(crate) struct MaterialState {
    pub(crate) diffuse: Color,
    pub(crate) specular: Color,
    pub(crate) ambient: Color,
    pub(crate) emissive: Color,
}

#[derive(Debug, Clone)]
pub(crate) struct LightState {
    pub(crate) parent: RelationLink,
    pub(crate) kind: LightKind,
    pub(crate) diffuse: Color,
    pub(crate) specular: Color,
}

#[derive(Debug, Clone)]
pub(crate) struct CameraState {
    pub(crate) parent: RelationLink,
    pub(crate) near_clip: f32,
    pub(crate) far_clip: f32,
    pub(crate) field_of_view: f32,
    pub(crate) aspect_ratio: f32,
}

#[derive(Debug, Clone)]
pub(crate) enum EntityState {
    Node(NodeState),
    Geometry(GeometryState),
    Material(MaterialState),
    Light(LightState),
    Camera(CameraState),
}

impl EntityState {
    fn new(entity_type: EntityType) -> Self {
        if let Some(parameters) = GeometryParameters::default_for(entity_type) {
            return EntityState::Geometry(GeometryState {
                parent: RelationLink::default(),
                material: RelationLink::default(),
                parameters,
            });
        }

        match entity_type {
            EntityType::MaterialManual => EntityState::Material(MaterialState {
                diffuse: Color::WHITE,
                specular: Color::BLACK,
                ambient: Color::BLACK,
                emissive: Color::BLACK,
            }),
            EntityType::Light => EntityState::Light(LightState {
                parent: RelationLink::default(),
                kind: LightKind::Point,
                diffuse: Color::WHITE,
                specular: Color::WHITE,
            }),
            EntityType::Camera => EntityState::Camera(CameraState {
                parent: RelationLink::default(),
                near_clip: 1.0,
                far_clip: 10_000.0,
                field_of_view: std::f32::consts::FRAC_PI_3,
                aspect_ratio: 4.0 / 3.0,
            }),
            _ => EntityState::Node(NodeState {
                parent: RelationLink::default(),
                position: Vector3::ZERO,
                orientation: Quaternion::IDENTITY,
                scale: Vector3::ONE,
                visible: true,
            }),
        }
    }

    pub(crate) fn parent(&self) -> Option<&RelationLink> {
        match self {
            EntityState::Node(state) => Some(&state.parent),
            EntityState::Geometry(state) => Some(&state.parent),
            EntityState::Light(state) => Some(&state.parent),
            EntityState::Camera(state) => Some(&state.parent),
            EntityState::Material(_) => None,
        }
    }

    fn relation_mut(&mut self, field: FieldId) -> Option<&mut RelationLink> {
        match (self, field) {
            (EntityState::Node(state), FieldId::PARENT_NODE) => Some(&mut state.parent),
            (EntityState::Geometry(state), FieldId::PARENT_NODE) => Some(&mut state.parent),
            (EntityState::Geometry(state), FieldId::MATERIAL) => Some(&mut state.material),
            (EntityState::Light(state), FieldId::PARENT_NODE) => Some(&mut state.parent),
            (EntityState::Camera(state), FieldId::PARENT_NODE) => Some(&mut state.parent),
            _ => None,
        }
    }

    pub(crate) fn relation(&self, field: FieldId) -> Option<&RelationLink> {
        match (self, field) {
            (EntityState::Geometry(state), FieldId::MATERIAL) => Some(&state.material),
            (_, FieldId::PARENT_NODE) => self.parent(),
            _ => None,
        }
    }

    fn field(&self, field: FieldId) -> Option<FieldValue> {
        if field.is_relation() {
            return self
                .relation(field)
                .map(|link| FieldValue::Reference(link.name.clone()));
        }

        let value = match (self, field) {
            (EntityState::Node(node), FieldId::POSITION) => FieldValue::Vector(node.position),
            (EntityState::Node(node), FieldId::ORIENTATION) => {
                FieldValue::Rotation(node.orientation)
            }
            (EntityState::Node(node), FieldId::SCALE) => FieldValue::Vector(node.scale),
            (EntityState::Node(node), FieldId::VISIBLE) => FieldValue::Flag(node.visible),
            (EntityState::Geometry(geometry), FieldId::PARAMETERS) => {
                FieldValue::Parameters(geometry.parameters.clone())
            }
            (EntityState::Material(material), FieldId::DIFFUSE) => {
                FieldValue::Color(material.diffuse)
            }
            (EntityState::Material(material), FieldId::SPECULAR) => {
                FieldValue::Color(material.specular)
            }
            (EntityState::Material(material), FieldId::AMBIENT) => {
                FieldValue::Color(material.ambient)
            }
            (EntityState::Material(material), FieldId::EMISSIVE) => {
                FieldValue::Color(material.emissive)
            }
            (EntityState::Light(light), FieldId::LIGHT_KIND) => FieldValue::Light(light.kind),
            (EntityState::Light(light), FieldId::DIFFUSE) => FieldValue::Color(light.diffuse),
            (EntityState::Light(light), FieldId::SPECULAR) => FieldValue::Color(light.specular),
            (EntityState::Camera(camera), FieldId::NEAR_CLIP) => {
                FieldValue::Scalar(camera.near_clip)
            }
            (EntityState::Camera(camera), FieldId::FAR_CLIP) => {
                FieldValue::Scalar(camera.far_clip)
            }
            (EntityState::Camera(camera), FieldId::FIELD_OF_VIEW) => {
                FieldValue::Scalar(camera.field_of_view)
            }
            (EntityState::Camera(camera), FieldId::ASPECT_RATIO) => {
                FieldValue::Scalar(camera.aspect_ratio)
            }
            _ => return None,
        };
        Some(value)
    }

    /// Writes a plain value field. Returns `false` when the value type
    /// does not fit the field.
    fn set_value(&mut self, field: FieldId, value: FieldValue) -> bool {
        match (self, field, value) {
            (EntityState::Node(node), FieldId::POSITION, FieldValue::Vector(v)) => {
                node.position = v
            }
            (EntityState::Node(node), FieldId::ORIENTATION, FieldValue::Rotation(q)) => {
                node.orientation = q
            }
            (EntityState::Node(node), FieldId::SCALE, FieldValue::Vector(v)) => node.scale = v,
            (EntityState::Node(node), FieldId::VISIBLE, FieldValue::Flag(flag)) => {
                node.visible = flag
            }
            (EntityState::Geometry(geometry), FieldId::PARAMETERS, FieldValue::Parameters(p)) => {
                if p.entity_type() != geometry.parameters.entity_type() {
                    return false;
                }
                geometry.parameters = p;
            }
            (EntityState::Material(material), FieldId::DIFFUSE, FieldValue::Color(c)) => {
                material.diffuse = c
            }
            (EntityState::Material(material), FieldId::SPECULAR, FieldValue::Color(c)) => {
                material.specular = c
            }
            (EntityState::Material(material), FieldId::AMBIENT, FieldValue::Color(c)) => {
                material.ambient = c
            }
            (EntityState::Material(material), FieldId::EMISSIVE, FieldValue::Color(c)) => {
                material.emissive = c
            }
            (EntityState::Light(light), FieldId::LIGHT_KIND, FieldValue::Light(kind)) => {
                light.kind = kind
            }
            (EntityState::Light(light), FieldId::DIFFUSE, FieldValue::Color(c)) => {
                light.diffuse = c
            }
            (EntityState::Light(light), FieldId::SPECULAR, FieldValue::Color(c)) => {
                light.specular = c
            }
            (EntityState::Camera(camera), FieldId::NEAR_CLIP, FieldValue::Scalar(s)) => {
                camera.near_clip = s
            }
            (EntityState::Camera(camera), FieldId::FAR_CLIP, FieldValue::Scalar(s)) => {
                camera.far_clip = s
            }
            (EntityState::Camera(camera), FieldId::FIELD_OF_VIEW, FieldValue::Scalar(s)) => {
                camera.field_of_view = s
            }
            (EntityState::Camera(camera), FieldId::ASPECT_RATIO, FieldValue::Scalar(s)) => {
                camera.aspect_ratio = s
            }
            _ => return false,
        }
        true
    }
}

/// Shared storage of one live entity. Only the directory holds strong
/// references; everything handed out to plugins is weak.
pub struct EntityCell {
    name: String,
    entity_type: EntityType,
    host_created: bool,
    state: RwLock<EntityState>,
    services: Arc<SceneServices>,
}

impl std::fmt::Debug for EntityCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCell")
            .field("name", &self.name)
            .field("entity_type", &self.entity_type)
            .field("host_created", &self.host_created)
            .finish()
    }
}

impl EntityCell {
    pub(crate) fn new(
        name: String,
        entity_type: EntityType,
        host_created: bool,
        services: Arc<SceneServices>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            entity_type,
            host_created,
            state: RwLock::new(EntityState::new(entity_type)),
            services,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn is_host_created(&self) -> bool {
        self.host_created
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&EntityState) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutates local state under the entity lock, then publishes `kind` once
    /// the lock is released.
    pub(crate) fn update<R>(
        &self,
        kind: EventType,
        f: impl FnOnce(&mut EntityState) -> Result<R, SceneError>,
    ) -> Result<R, SceneError> {
        let result = {
            let mut state = self.state.write();
            f(&mut state)?
        };
        self.publish(kind);
        Ok(result)
    }

    pub(crate) fn publish(&self, kind: EventType) {
        self.services.events().publish(&Event::new(self.name.clone(), kind));
    }

    pub(crate) fn mismatch(&self, detail: impl Into<String>) -> SceneError {
        SceneError::TypeMismatch {
            entity: self.name.clone(),
            entity_type: self.entity_type,
            detail: detail.into(),
        }
    }

    pub(crate) fn non_finite(&self, field: &str) -> SceneError {
        SceneError::NonFinite {
            entity: self.name.clone(),
            field: field.to_string(),
        }
    }

    fn event_for(&self, field: FieldId) -> Result<EventType, SceneError> {
        self.entity_type
            .field_event(field)
            .ok_or(SceneError::UnknownField {
                entity: self.name.clone(),
                entity_type: self.entity_type,
                field,
            })
    }

    /// Current values of every replicated field, in wire order.
    pub fn fields(&self) -> Vec<(FieldId, FieldValue)> {
        let state = self.state.read();
        self.entity_type
            .field_table()
            .iter()
            .filter_map(|(field, _)| state.field(*field).map(|value| (*field, value)))
            .collect()
    }

    pub fn field(&self, field: FieldId) -> Option<FieldValue> {
        self.state.read().field(field)
    }

    /// Replaces a non-relation field and fires its event.
    pub(crate) fn apply_value(&self, field: FieldId, value: FieldValue) -> Result<(), SceneError> {
        let kind = self.event_for(field)?;
        if field.is_relation() {
            return Err(self.mismatch(format!("a direct value for relation {}", field.label())));
        }
        if !value.is_finite() {
            return Err(self.non_finite(field.label()));
        }
        self.update(kind, |state| {
            if state.set_value(field, value) {
                Ok(())
            } else {
                Err(self.mismatch(format!("the supplied value for {}", field.label())))
            }
        })
    }

    /// Points a relation at `target` (or clears it). The hierarchy lock is held
    /// across the cycle check and the assignment so concurrent reparenting
    /// cannot interleave into a loop.
    pub(crate) fn link(
        self: &Arc<Self>,
        field: FieldId,
        name: Option<String>,
        target: Option<&Arc<EntityCell>>,
    ) -> Result<(), SceneError> {
        let kind = self.event_for(field)?;
        if !field.is_relation() {
            return Err(self.mismatch(format!("a relation for {}", field.label())));
        }

        if let Some(target) = target {
            let expected = if field == FieldId::MATERIAL {
                EntityType::MaterialManual
            } else {
                EntityType::Node
            };
            if target.entity_type != expected {
                return Err(self.mismatch(format!(
                    "{:?} '{}' as {}",
                    target.entity_type,
                    target.name,
                    field.label()
                )));
            }
        }

        {
            let _hierarchy = self.services.hierarchy.lock();
            if field == FieldId::PARENT_NODE {
                if let Some(parent) = target {
                    if self.is_ancestor_or_self_of(parent) {
                        return Err(SceneError::HierarchyCycle {
                            subject: self.name.clone(),
                            parent: parent.name.clone(),
                        });
                    }
                }
            }

            let mut state = self.state.write();
            match state.relation_mut(field) {
                Some(link) => link.assign(name, target),
                None => return Err(self.mismatch(field.label())),
            }
        }

        self.publish(kind);
        Ok(())
    }

    /// Walks up from `candidate` looking for `self`.
    fn is_ancestor_or_self_of(self: &Arc<Self>, candidate: &Arc<EntityCell>) -> bool {
        let mut current = Some(Arc::clone(candidate));
        let mut hops = 0usize;
        while let Some(cell) = current {
            if Arc::ptr_eq(&cell, self) {
                return true;
            }
            hops += 1;
            if hops > MAX_HIERARCHY_DEPTH {
                log::error!(
                    "[scene] ancestor walk from '{}' exceeded {} hops",
                    candidate.name,
                    MAX_HIERARCHY_DEPTH
                );
                return true;
            }
            current = cell.read(|state| state.parent().and_then(RelationLink::target));
        }
        false
    }

    /// Strong references from `self` up to the root, nearest parent first.
    pub(crate) fn ancestors(&self) -> Vec<Arc<EntityCell>> {
        let mut chain = Vec::new();
        let mut current = self.read(|state| state.parent().and_then(RelationLink::target));
        while let Some(cell) = current {
            if chain.len() >= MAX_HIERARCHY_DEPTH {
                break;
            }
            current = cell.read(|state| state.parent().and_then(RelationLink::target));
            chain.push(cell);
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    fn services() -> Arc<SceneServices> {
        SceneServices::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn field_table_covers_every_type() {
        for entity_type in EntityType::all() {
            let cell = EntityCell::new("e".into(), entity_type, true, services());
            let fields = cell.fields();
            assert_eq!(fields.len(), entity_type.field_table().len(), "{entity_type:?}");
        }
    }

    #[test]
    fn mismatched_parameter_block_is_rejected() {
        let cell = EntityCell::new("cyl".into(), EntityType::GeometryCylinder, true, services());
        let err = cell
            .apply_value(
                FieldId::PARAMETERS,
                FieldValue::Parameters(GeometryParameters::Tube(TubeParameters::default())),
            )
            .unwrap_err();
        assert!(matches!(err, SceneError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_field_for_type_is_reported() {
        let cell = EntityCell::new("mat".into(), EntityType::MaterialManual, true, services());
        let err = cell
            .apply_value(FieldId::POSITION, FieldValue::Vector(Vector3::ONE))
            .unwrap_err();
        assert!(matches!(err, SceneError::UnknownField { .. }));
    }

    #[test]
    fn value_fit_follows_field_and_type() {
        let cylinder = FieldValue::Parameters(GeometryParameters::Cylinder(
            CylinderParameters::default(),
        ));
        assert!(cylinder.fits(EntityType::GeometryCylinder, FieldId::PARAMETERS));
        assert!(!cylinder.fits(EntityType::GeometryTube, FieldId::PARAMETERS));
        assert!(FieldValue::Scalar(1.0).fits(EntityType::Camera, FieldId::NEAR_CLIP));
        assert!(!FieldValue::Scalar(1.0).fits(EntityType::Node, FieldId::POSITION));
        assert!(!FieldValue::Vector(Vector3::ONE).fits(EntityType::MaterialManual, FieldId::POSITION));
    }

    #[test]
    fn self_parenting_is_a_cycle() {
        let node = EntityCell::new("n".into(), EntityType::Node, true, services());
        let err = node
            .link(FieldId::PARENT_NODE, Some("n".into()), Some(&node))
            .unwrap_err();
        assert!(matches!(err, SceneError::HierarchyCycle { .. }));
    }
}
