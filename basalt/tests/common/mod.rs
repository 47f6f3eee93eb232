#![allow(dead_code)]

use basalt::prelude::*;
use std::{collections::HashMap, sync::Arc};

pub fn box_mesh(size: f32) -> Arc<Mesh> {
    Arc::new(Mesh::default().with_box(Vec3::zero(), Vec3::broadcast(size)))
}

/// Scene source driven directly by the test. Every set sees every change once.
pub struct TestScene {
    pub geometries: Vec<GeometryDesc>,
    pub placements: Vec<(usize, Vec3)>,
    pub snapshots: u32,
    history: Vec<SceneChanges>,
    seen: HashMap<String, usize>,
}

impl TestScene {
    pub fn new(geometry_count: u32, uses: &[usize]) -> Self {
        Self {
            geometries: (0..geometry_count)
                .map(|id| GeometryDesc::new(GeometryId(id), box_mesh(1.0 + id as f32)))
                .collect(),
            placements: uses
                .iter()
                .enumerate()
                .map(|(i, &g)| (g, Vec3::new(3.0 * i as f32, 0.0, 0.0)))
                .collect(),
            snapshots: 0,
            history: Vec::new(),
            seen: HashMap::new(),
        }
    }

    pub fn move_all(&mut self, offset: Vec3) {
        for (_, position) in &mut self.placements {
            *position += offset;
        }
        self.history.push(SceneChanges {
            geometry_changed: false,
            transform_only_changed: true,
        });
    }

    /// Same id, new mesh allocation.
    pub fn reload(&mut self, index: usize) {
        let id = self.geometries[index].id;
        let mesh = Arc::new((*self.geometries[index].mesh).clone());
        self.geometries[index] = GeometryDesc::new(id, mesh);
        self.history.push(SceneChanges {
            geometry_changed: true,
            transform_only_changed: false,
        });
    }

    pub fn instances(&self) -> Vec<InstanceDesc> {
        self.placements
            .iter()
            .enumerate()
            .map(|(i, &(g, position))| {
                InstanceDesc::new(
                    self.geometries[g].clone(),
                    Similarity3::new(position, Rotor3::identity(), 1.0),
                )
                .with_custom_index(i as u32)
            })
            .collect()
    }
}

impl SceneSource for TestScene {
    fn changes(&mut self, set: &str) -> SceneChanges {
        let seen = self.seen.entry(set.to_owned()).or_insert(0);
        let mut changes = SceneChanges::NONE;
        for change in &self.history[*seen..] {
            changes.geometry_changed |= change.geometry_changed;
            changes.transform_only_changed |= change.transform_only_changed;
        }
        *seen = self.history.len();
        changes
    }

    fn snapshot(&mut self, _set: &str) -> Vec<InstanceDesc> {
        self.snapshots += 1;
        self.instances()
    }
}

pub fn config(cooldown_frames: u32) -> AccelConfig {
    AccelConfig {
        registry_capacity: 64,
        frames_in_flight: 2,
        cooldown_frames: Some(cooldown_frames),
        failure_cooldown_frames: 2,
        ..Default::default()
    }
}

pub fn inline_system(backend: &Arc<HostBackend>, cooldown_frames: u32) -> AccelSystem {
    AccelSystem::new(config(cooldown_frames), backend.clone(), Arc::new(InlineWorkerPool)).unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
