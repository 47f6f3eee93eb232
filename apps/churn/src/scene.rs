use basalt::prelude::*;
use rand::{rngs::SmallRng, Rng};
use std::{collections::HashMap, sync::Arc};

const WORLD_EXTENT: f32 = 50.0;

pub struct Entity {
    pub mesh: usize,
    pub position: Vec3,
    pub velocity: Vec3,
    pub angle: f32,
    pub spin: f32,
    pub casts_shadow: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Versions {
    geometry: u64,
    transforms: u64,
}

/// Procedural scene of boxes drifting around, with meshes that get reloaded now and then.
pub struct Scene {
    meshes: Vec<GeometryDesc>,
    entities: Vec<Entity>,
    versions: Versions,
    seen: HashMap<String, Versions>,
}

fn random_mesh(rng: &mut SmallRng) -> Mesh {
    let extent = Vec3::new(rng.gen_range(0.2..2.0), rng.gen_range(0.2..2.0), rng.gen_range(0.2..2.0));
    let mut mesh = Mesh::default().with_box(-extent, extent);
    if rng.gen_bool(0.5) {
        let y = extent.y + 0.5;
        mesh = mesh.with_quad(
            Vec3::new(-extent.x, y, -extent.z),
            Vec3::new(extent.x, y, -extent.z),
            Vec3::new(extent.x, y, extent.z),
            Vec3::new(-extent.x, y, extent.z),
        );
    }
    mesh
}

fn random_entity(rng: &mut SmallRng, mesh_count: usize) -> Entity {
    Entity {
        mesh: rng.gen_range(0..mesh_count),
        position: Vec3::new(
            rng.gen_range(-WORLD_EXTENT..WORLD_EXTENT),
            0.0,
            rng.gen_range(-WORLD_EXTENT..WORLD_EXTENT),
        ),
        velocity: Vec3::new(rng.gen_range(-5.0..5.0), 0.0, rng.gen_range(-5.0..5.0)),
        angle: 0.0,
        spin: rng.gen_range(-1.0..1.0),
        casts_shadow: rng.gen_bool(0.75),
    }
}

impl Scene {
    pub fn new(rng: &mut SmallRng, mesh_count: u32, entity_count: u32) -> Self {
        let meshes = (0..mesh_count.max(1))
            .map(|id| GeometryDesc::new(GeometryId(id), Arc::new(random_mesh(rng))))
            .collect::<Vec<_>>();
        let entities = (0..entity_count).map(|_| random_entity(rng, meshes.len())).collect();
        Self {
            meshes,
            entities,
            versions: Versions::default(),
            seen: HashMap::new(),
        }
    }

    pub fn meshes(&self) -> &[GeometryDesc] {
        &self.meshes
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn animate(&mut self, dt: f32) {
        for entity in self.entities.iter_mut() {
            entity.position += entity.velocity * dt;
            for (p, v) in [
                (&mut entity.position.x, &mut entity.velocity.x),
                (&mut entity.position.z, &mut entity.velocity.z),
            ] {
                if p.abs() > WORLD_EXTENT {
                    *p = p.clamp(-WORLD_EXTENT, WORLD_EXTENT);
                    *v = -*v;
                }
            }
            entity.angle += entity.spin * dt;
        }
        self.versions.transforms += 1;
    }

    /// Replaces one mesh with a new allocation under the same id.
    pub fn reload_mesh(&mut self, rng: &mut SmallRng) -> GeometryId {
        let index = rng.gen_range(0..self.meshes.len());
        let id = self.meshes[index].id;
        self.meshes[index] = GeometryDesc::new(id, Arc::new(random_mesh(rng)));
        self.versions.geometry += 1;
        id
    }

    pub fn spawn_entity(&mut self, rng: &mut SmallRng) {
        let entity = random_entity(rng, self.meshes.len());
        self.entities.push(entity);
        self.versions.geometry += 1;
    }

    pub fn remove_entity(&mut self, rng: &mut SmallRng) {
        if !self.entities.is_empty() {
            let index = rng.gen_range(0..self.entities.len());
            self.entities.swap_remove(index);
            self.versions.geometry += 1;
        }
    }

    fn instance(&self, index: usize, entity: &Entity) -> InstanceDesc {
        let transform = Similarity3::new(entity.position, Rotor3::from_rotation_xz(entity.angle), 1.0);
        let mask = if entity.casts_shadow { 0xff } else { 0x01 };
        InstanceDesc::new(self.meshes[entity.mesh].clone(), transform)
            .with_custom_index(index as u32)
            .with_mask(mask)
            .with_flags(InstanceFlags::FORCE_OPAQUE)
    }
}

impl SceneSource for Scene {
    fn changes(&mut self, set: &str) -> SceneChanges {
        let current = self.versions;
        let seen = self.seen.insert(set.to_owned(), current).unwrap_or_default();
        SceneChanges {
            geometry_changed: seen.geometry != current.geometry,
            transform_only_changed: seen.transforms != current.transforms,
        }
    }

    fn snapshot(&mut self, set: &str) -> Vec<InstanceDesc> {
        let shadow_only = set == "shadow";
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| !shadow_only || entity.casts_shadow)
            .map(|(index, entity)| self.instance(index, entity))
            .collect()
    }
}
