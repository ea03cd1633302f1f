use super::entity::{
    EntityCell, EntityState, EntityType, FieldId, FieldValue, GeometryParameters, LightKind,
    RelationLink, TextParameters, TransformSpace,
};
use super::math::{Color, Quaternion, Vector3};
use super::SceneError;
use crate::event::EventType;
use std::sync::{Arc, Weak};

/// Weak, name-carrying reference to an entity. Holding a handle never keeps the
/// entity alive; every operation on a destroyed entity fails with
/// [`SceneError::ExpiredHandle`] and changes nothing.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    name: String,
    entity_type: EntityType,
    cell: Weak<EntityCell>,
}

impl EntityHandle {
    pub(crate) fn from_cell(cell: &Arc<EntityCell>) -> Self {
        Self {
            name: cell.name().to_string(),
            entity_type: cell.entity_type(),
            cell: Arc::downgrade(cell),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }

    pub fn is_host_created(&self) -> Result<bool, SceneError> {
        Ok(self.cell()?.is_host_created())
    }

    pub(crate) fn cell(&self) -> Result<Arc<EntityCell>, SceneError> {
        self.cell
            .upgrade()
            .ok_or_else(|| SceneError::ExpiredHandle(self.name.clone()))
    }

    pub fn fields(&self) -> Result<Vec<(FieldId, FieldValue)>, SceneError> {
        Ok(self.cell()?.fields())
    }

    pub fn parent_node(&self) -> Option<NodeHandle> {
        let cell = self.cell.upgrade()?;
        let parent = cell.read(|state| state.parent().and_then(RelationLink::target))?;
        Some(NodeHandle(EntityHandle::from_cell(&parent)))
    }

    /// Name of the parent relation, which may be set while the parent itself
    /// has not arrived yet.
    pub fn parent_node_name(&self) -> Option<String> {
        let cell = self.cell.upgrade()?;
        cell.read(|state| state.parent().and_then(|link| link.name().map(str::to_string)))
    }

    /// Sets the parent node. A parent handle that no longer resolves clears the
    /// relation instead of storing a dangling reference.
    pub fn set_parent_node(&self, parent: &NodeHandle) -> Result<(), SceneError> {
        let cell = self.cell()?;
        match parent.0.cell.upgrade() {
            Some(target) => {
                cell.link(FieldId::PARENT_NODE, Some(target.name().to_string()), Some(&target))
            }
            None => cell.link(FieldId::PARENT_NODE, None, None),
        }
    }

    pub fn clear_parent_node(&self) -> Result<(), SceneError> {
        self.cell()?.link(FieldId::PARENT_NODE, None, None)
    }

    pub fn as_node(&self) -> Option<NodeHandle> {
        (self.entity_type == EntityType::Node).then(|| NodeHandle(self.clone()))
    }

    pub fn as_geometry(&self) -> Option<GeometryHandle> {
        self.entity_type
            .is_geometry()
            .then(|| GeometryHandle(self.clone()))
    }

    pub fn as_material(&self) -> Option<MaterialHandle> {
        (self.entity_type == EntityType::MaterialManual).then(|| MaterialHandle(self.clone()))
    }

    pub fn as_light(&self) -> Option<LightHandle> {
        (self.entity_type == EntityType::Light).then(|| LightHandle(self.clone()))
    }

    pub fn as_camera(&self) -> Option<CameraHandle> {
        (self.entity_type == EntityType::Camera).then(|| CameraHandle(self.clone()))
    }

    fn set_value(&self, field: FieldId, value: FieldValue) -> Result<(), SceneError> {
        self.cell()?.apply_value(field, value)
    }

    fn value<R>(&self, read: impl FnOnce(&EntityState) -> Option<R>) -> Result<R, SceneError> {
        let cell = self.cell()?;
        cell.read(read)
            .ok_or_else(|| cell.mismatch("this accessor"))
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.cell.ptr_eq(&other.cell)
    }
}

macro_rules! typed_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name(EntityHandle);

        impl std::ops::Deref for $name {
            type Target = EntityHandle;

            fn deref(&self) -> &EntityHandle {
                &self.0
            }
        }

        impl From<$name> for EntityHandle {
            fn from(handle: $name) -> EntityHandle {
                handle.0
            }
        }
    };
}

typed_handle!(NodeHandle);
typed_handle!(GeometryHandle);
typed_handle!(MaterialHandle);
typed_handle!(LightHandle);
typed_handle!(CameraHandle);

impl NodeHandle {
    pub fn entity(&self) -> &EntityHandle {
        &self.0
    }

    pub fn position(&self) -> Result<Vector3, SceneError> {
        self.value(|state| match state {
            EntityState::Node(node) => Some(node.position),
            _ => None,
        })
    }

    pub fn orientation(&self) -> Result<Quaternion, SceneError> {
        self.value(|state| match state {
            EntityState::Node(node) => Some(node.orientation),
            _ => None,
        })
    }

    pub fn scale(&self) -> Result<Vector3, SceneError> {
        self.value(|state| match state {
            EntityState::Node(node) => Some(node.scale),
            _ => None,
        })
    }

    pub fn is_visible(&self) -> Result<bool, SceneError> {
        self.value(|state| match state {
            EntityState::Node(node) => Some(node.visible),
            _ => None,
        })
    }

    pub fn set_position(&self, position: Vector3) -> Result<(), SceneError> {
        self.set_value(FieldId::POSITION, FieldValue::Vector(position))
    }

    pub fn set_orientation(&self, orientation: Quaternion) -> Result<(), SceneError> {
        self.set_value(
            FieldId::ORIENTATION,
            FieldValue::Rotation(orientation.normalized()),
        )
    }

    pub fn set_scale(&self, scale: Vector3) -> Result<(), SceneError> {
        self.set_value(FieldId::SCALE, FieldValue::Vector(scale))
    }

    pub fn set_visible(&self, visible: bool) -> Result<(), SceneError> {
        self.set_value(FieldId::VISIBLE, FieldValue::Flag(visible))
    }

    /// Orientation of this node composed with all of its ancestors.
    pub fn derived_orientation(&self) -> Result<Quaternion, SceneError> {
        let cell = self.cell()?;
        let local = self.orientation()?;
        Ok(cell
            .ancestors()
            .iter()
            .fold(local, |acc, ancestor| node_orientation(ancestor) * acc))
    }

    /// World-space position after applying every ancestor transform.
    pub fn derived_position(&self) -> Result<Vector3, SceneError> {
        let cell = self.cell()?;
        let mut position = self.position()?;
        for ancestor in cell.ancestors() {
            let (parent_position, parent_orientation, parent_scale) = ancestor.read(|state| {
                match state {
                    EntityState::Node(node) => (node.position, node.orientation, node.scale),
                    _ => (Vector3::ZERO, Quaternion::IDENTITY, Vector3::ONE),
                }
            });
            let scaled = Vector3::new(
                position.x * parent_scale.x,
                position.y * parent_scale.y,
                position.z * parent_scale.z,
            );
            position = parent_position + parent_orientation.rotate(scaled);
        }
        Ok(position)
    }

    pub fn translate(&self, offset: Vector3, space: TransformSpace) -> Result<(), SceneError> {
        let cell = self.cell()?;
        let delta = match space {
            TransformSpace::Local => self.orientation()?.rotate(offset),
            TransformSpace::Parent => offset,
            TransformSpace::World => {
                let parent_orientation = cell
                    .ancestors()
                    .iter()
                    .rev()
                    .fold(Quaternion::IDENTITY, |acc, ancestor| {
                        acc * node_orientation(ancestor)
                    });
                parent_orientation.conjugate().rotate(offset)
            }
        };
        cell.update(EventType::NodePosition, |state| match state {
            EntityState::Node(node) => {
                let moved = node.position + delta;
                if !moved.is_finite() {
                    return Err(cell.non_finite("translation"));
                }
                node.position = moved;
                Ok(())
            }
            _ => Err(cell.mismatch("translation")),
        })
    }

    pub fn rotate(&self, radians: f32, axis: Vector3, space: TransformSpace) -> Result<(), SceneError> {
        let cell = self.cell()?;
        let rotation = Quaternion::from_axis_angle(axis, radians);
        let derived = match space {
            TransformSpace::World => Some(self.derived_orientation()?),
            _ => None,
        };
        if !rotation.is_finite() {
            return Err(cell.non_finite("rotation"));
        }
        cell.update(EventType::NodeOrientation, |state| match state {
            EntityState::Node(node) => {
                node.orientation = match (space, derived) {
                    (TransformSpace::Local, _) => node.orientation * rotation,
                    (TransformSpace::Parent, _) => rotation * node.orientation,
                    (TransformSpace::World, Some(derived)) => {
                        node.orientation * derived.conjugate() * rotation * derived
                    }
                    (TransformSpace::World, None) => rotation * node.orientation,
                }
                .normalized();
                Ok(())
            }
            _ => Err(cell.mismatch("rotation")),
        })
    }
}

fn node_orientation(cell: &Arc<EntityCell>) -> Quaternion {
    cell.read(|state| match state {
        EntityState::Node(node) => node.orientation,
        _ => Quaternion::IDENTITY,
    })
}

impl GeometryHandle {
    pub fn parameters(&self) -> Result<GeometryParameters, SceneError> {
        self.value(|state| match state {
            EntityState::Geometry(geometry) => Some(geometry.parameters.clone()),
            _ => None,
        })
    }

    pub fn set_parameters(&self, parameters: GeometryParameters) -> Result<(), SceneError> {
        self.set_value(FieldId::PARAMETERS, FieldValue::Parameters(parameters))
    }

    pub fn set_cylinder_parameters(
        &self,
        radius: f32,
        height: f32,
        tile: f32,
    ) -> Result<(), SceneError> {
        self.set_parameters(GeometryParameters::Cylinder(super::CylinderParameters {
            radius,
            height,
            tile,
        }))
    }

    pub fn set_caption(&self, caption: impl Into<String>) -> Result<(), SceneError> {
        let caption = caption.into();
        self.update_text(|text| text.caption = caption)
    }

    pub fn set_offset(&self, offset: Vector3) -> Result<(), SceneError> {
        if !offset.is_finite() {
            return Err(self.cell()?.non_finite("text offset"));
        }
        self.update_text(|text| text.offset = offset)
    }

    pub fn set_text_visible(&self, visible: bool) -> Result<(), SceneError> {
        self.update_text(|text| text.visible = visible)
    }

    fn update_text(&self, edit: impl FnOnce(&mut TextParameters)) -> Result<(), SceneError> {
        let cell = self.cell()?;
        cell.update(EventType::GeometryParameters, |state| match state {
            EntityState::Geometry(geometry) => match &mut geometry.parameters {
                GeometryParameters::Text(text) => {
                    edit(text);
                    Ok(())
                }
                _ => Err(cell.mismatch("text parameters")),
            },
            _ => Err(cell.mismatch("text parameters")),
        })
    }

    pub fn material(&self) -> Option<MaterialHandle> {
        let cell = self.cell.upgrade()?;
        let material = cell.read(|state| {
            state
                .relation(FieldId::MATERIAL)
                .and_then(RelationLink::target)
        })?;
        Some(MaterialHandle(EntityHandle::from_cell(&material)))
    }

    pub fn material_name(&self) -> Option<String> {
        let cell = self.cell.upgrade()?;
        cell.read(|state| {
            state
                .relation(FieldId::MATERIAL)
                .and_then(|link| link.name().map(str::to_string))
        })
    }

    /// Sets the material. An expired material handle clears the relation.
    pub fn set_material(&self, material: &MaterialHandle) -> Result<(), SceneError> {
        let cell = self.cell()?;
        match material.0.cell.upgrade() {
            Some(target) => {
                cell.link(FieldId::MATERIAL, Some(target.name().to_string()), Some(&target))
            }
            None => cell.link(FieldId::MATERIAL, None, None),
        }
    }
}

impl MaterialHandle {
    fn color(&self, field: FieldId) -> Result<Color, SceneError> {
        match self.cell()?.field(field) {
            Some(FieldValue::Color(color)) => Ok(color),
            _ => Err(self.cell()?.mismatch(field.label())),
        }
    }

    pub fn diffuse_color(&self) -> Result<Color, SceneError> {
        self.color(FieldId::DIFFUSE)
    }

    pub fn specular_color(&self) -> Result<Color, SceneError> {
        self.color(FieldId::SPECULAR)
    }

    pub fn ambient_color(&self) -> Result<Color, SceneError> {
        self.color(FieldId::AMBIENT)
    }

    pub fn emissive_color(&self) -> Result<Color, SceneError> {
        self.color(FieldId::EMISSIVE)
    }

    pub fn set_diffuse_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::DIFFUSE, FieldValue::Color(color))
    }

    pub fn set_specular_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::SPECULAR, FieldValue::Color(color))
    }

    pub fn set_ambient_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::AMBIENT, FieldValue::Color(color))
    }

    pub fn set_emissive_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::EMISSIVE, FieldValue::Color(color))
    }
}

impl LightHandle {
    pub fn light_kind(&self) -> Result<LightKind, SceneError> {
        self.value(|state| match state {
            EntityState::Light(light) => Some(light.kind),
            _ => None,
        })
    }

    pub fn set_light_kind(&self, kind: LightKind) -> Result<(), SceneError> {
        self.set_value(FieldId::LIGHT_KIND, FieldValue::Light(kind))
    }

    pub fn diffuse_color(&self) -> Result<Color, SceneError> {
        self.value(|state| match state {
            EntityState::Light(light) => Some(light.diffuse),
            _ => None,
        })
    }

    pub fn specular_color(&self) -> Result<Color, SceneError> {
        self.value(|state| match state {
            EntityState::Light(light) => Some(light.specular),
            _ => None,
        })
    }

    pub fn set_diffuse_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::DIFFUSE, FieldValue::Color(color))
    }

    pub fn set_specular_color(&self, color: Color) -> Result<(), SceneError> {
        self.set_value(FieldId::SPECULAR, FieldValue::Color(color))
    }
}

impl CameraHandle {
    fn scalar(&self, field: FieldId) -> Result<f32, SceneError> {
        match self.cell()?.field(field) {
            Some(FieldValue::Scalar(value)) => Ok(value),
            _ => Err(self.cell()?.mismatch(field.label())),
        }
    }

    pub fn near_clip_distance(&self) -> Result<f32, SceneError> {
        self.scalar(FieldId::NEAR_CLIP)
    }

    pub fn far_clip_distance(&self) -> Result<f32, SceneError> {
        self.scalar(FieldId::FAR_CLIP)
    }

    pub fn field_of_view(&self) -> Result<f32, SceneError> {
        self.scalar(FieldId::FIELD_OF_VIEW)
    }

    pub fn aspect_ratio(&self) -> Result<f32, SceneError> {
        self.scalar(FieldId::ASPECT_RATIO)
    }

    pub fn set_near_clip_distance(&self, distance: f32) -> Result<(), SceneError> {
        self.set_value(FieldId::NEAR_CLIP, FieldValue::Scalar(distance))
    }

    pub fn set_far_clip_distance(&self, distance: f32) -> Result<(), SceneError> {
        self.set_value(FieldId::FAR_CLIP, FieldValue::Scalar(distance))
    }

    pub fn set_field_of_view(&self, radians: f32) -> Result<(), SceneError> {
        self.set_value(FieldId::FIELD_OF_VIEW, FieldValue::Scalar(radians))
    }

    pub fn set_aspect_ratio(&self, ratio: f32) -> Result<(), SceneError> {
        self.set_value(FieldId::ASPECT_RATIO, FieldValue::Scalar(ratio))
    }
}
