//! Scene Contract
//!
//! The renderer does not own entity storage. It consumes a [`World`] through
//! typed component lookups and learns about membership changes through the
//! `on_component_added` / `on_component_removed` callbacks of
//! [`GraphicsModule`](crate::module::GraphicsModule).
//!
//! [`SceneStore`] is a small thread-safe implementation used by tests and
//! the demo application.

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::assets::{Material, Mesh};

/// Entities are plain integers; the renderer keeps no pointers into the scene.
pub type Entity = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Transform,
    Renderable,
    Camera,
    Light,
}

// ============================================================================
// Components
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    #[must_use]
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Orientation whose forward axis (-Z) points along `direction`.
    #[must_use]
    pub fn looking_along(position: Vec3, direction: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::from_rotation_arc(Vec3::NEG_Z, direction.normalize()),
            scale: Vec3::ONE,
        }
    }

    #[must_use]
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    #[must_use]
    pub fn forward(&self) -> Vec3 {
        (self.rotation * Vec3::NEG_Z).normalize()
    }

    #[must_use]
    pub fn up(&self) -> Vec3 {
        (self.rotation * Vec3::Y).normalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov_y: 45f32.to_radians(),
            near: 0.1,
            far: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    /// Spot cone angles in radians, measured from the axis.
    pub inner_cutoff: f32,
    pub outer_cutoff: f32,
}

impl Light {
    #[must_use]
    pub fn directional(color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightKind::Directional,
            color,
            intensity,
            inner_cutoff: 0.0,
            outer_cutoff: 0.0,
        }
    }

    #[must_use]
    pub fn point(color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightKind::Point,
            ..Self::directional(color, intensity)
        }
    }

    #[must_use]
    pub fn spot(color: Vec3, intensity: f32, inner_cutoff: f32, outer_cutoff: f32) -> Self {
        Self {
            kind: LightKind::Spot,
            color,
            intensity,
            inner_cutoff,
            outer_cutoff,
        }
    }

    #[must_use]
    pub fn casts_shadow(&self) -> bool {
        matches!(self.kind, LightKind::Directional | LightKind::Spot)
    }
}

#[derive(Debug, Clone)]
pub struct Renderable {
    /// `None` or an empty mesh draws the default mesh.
    pub mesh: Option<Arc<Mesh>>,
    pub material: Arc<Material>,
}

// ============================================================================
// World contract
// ============================================================================

/// Typed component lookup consumed by the renderer.
pub trait World: Send + Sync {
    fn transform(&self, entity: Entity) -> Option<Transform>;
    fn camera(&self, entity: Entity) -> Option<Camera>;
    fn light(&self, entity: Entity) -> Option<Light>;
    fn renderable(&self, entity: Entity) -> Option<Renderable>;

    /// Stable numeric id of a component kind.
    fn component_id(&self, kind: ComponentKind) -> u32 {
        kind as u32
    }
}

// ============================================================================
// SceneStore
// ============================================================================

#[derive(Default)]
struct StoreInner {
    next_entity: Entity,
    transforms: FxHashMap<Entity, Transform>,
    cameras: FxHashMap<Entity, Camera>,
    lights: FxHashMap<Entity, Light>,
    renderables: FxHashMap<Entity, Renderable>,
}

#[derive(Default)]
pub struct SceneStore {
    inner: RwLock<StoreInner>,
}

impl SceneStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self) -> Entity {
        let mut inner = self.inner.write();
        let entity = inner.next_entity;
        inner.next_entity += 1;
        entity
    }

    pub fn set_transform(&self, entity: Entity, transform: Transform) {
        self.inner.write().transforms.insert(entity, transform);
    }

    pub fn set_camera(&self, entity: Entity, camera: Camera) {
        self.inner.write().cameras.insert(entity, camera);
    }

    pub fn set_light(&self, entity: Entity, light: Light) {
        self.inner.write().lights.insert(entity, light);
    }

    pub fn set_renderable(&self, entity: Entity, renderable: Renderable) {
        self.inner.write().renderables.insert(entity, renderable);
    }

    pub fn remove(&self, entity: Entity, kind: ComponentKind) {
        let mut inner = self.inner.write();
        match kind {
            ComponentKind::Transform => {
                inner.transforms.remove(&entity);
            }
            ComponentKind::Renderable => {
                inner.renderables.remove(&entity);
            }
            ComponentKind::Camera => {
                inner.cameras.remove(&entity);
            }
            ComponentKind::Light => {
                inner.lights.remove(&entity);
            }
        }
    }
}

impl World for SceneStore {
    fn transform(&self, entity: Entity) -> Option<Transform> {
        self.inner.read().transforms.get(&entity).copied()
    }

    fn camera(&self, entity: Entity) -> Option<Camera> {
        self.inner.read().cameras.get(&entity).copied()
    }

    fn light(&self, entity: Entity) -> Option<Light> {
        self.inner.read().lights.get(&entity).copied()
    }

    fn renderable(&self, entity: Entity) -> Option<Renderable> {
        self.inner.read().renderables.get(&entity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looking_along_sets_forward() {
        let dir = Vec3::new(1.0, -1.0, 0.0).normalize();
        let t = Transform::looking_along(Vec3::ZERO, dir);
        assert!(t.forward().abs_diff_eq(dir, 1e-5));
    }

    #[test]
    fn store_round_trips_components() {
        let store = SceneStore::new();
        let e = store.spawn();
        store.set_camera(e, Camera::default());
        assert!(store.camera(e).is_some());
        store.remove(e, ComponentKind::Camera);
        assert!(store.camera(e).is_none());
        assert_ne!(store.spawn(), e);
    }
}
