use crate::{
    atomic_slot::AtomicSlot, backend::BuildBackend, bottom::BottomStructure, error::AccelError, geometry::*,
    resource::*,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// What `collect_unreferenced` decided may now be destroyed.
#[derive(Debug)]
pub enum Reclaim {
    /// No slot points at this structure and nothing else holds it.
    Structure(Arc<BottomStructure>),
    /// The structure handle is still registered but now lives in a different buffer.
    Buffer(BufferHandle),
}

impl Reclaim {
    pub fn destroy(self, backend: &dyn BuildBackend) {
        match self {
            Reclaim::Structure(structure) => structure.destroy(backend),
            Reclaim::Buffer(buffer) => backend.destroy_buffer(buffer),
        }
    }
}

/// Current bottom structure per geometry id.
///
/// Reads and writes are single atomic operations per slot. Replaced structures are not
/// destroyed here: `register` hands them back, and once they have passed through a frame's
/// deferred queue they come back via `retire` to wait until nothing references them.
pub struct Registry {
    slots: Box<[AtomicSlot<BottomStructure>]>,
    candidates: Mutex<Vec<Arc<BottomStructure>>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicSlot::empty()).collect(),
            candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn check_capacity(&self, id: GeometryId) -> Result<(), AccelError> {
        if id.index() < self.slots.len() {
            Ok(())
        } else {
            Err(AccelError::CapacityExceeded {
                id,
                capacity: self.slots.len(),
            })
        }
    }

    /// Returns the current structure for `id` only if it was built from this exact mesh.
    pub fn lookup(&self, id: GeometryId, mesh: &Arc<Mesh>) -> Option<Arc<BottomStructure>> {
        self.slots
            .get(id.index())?
            .load()
            .filter(|structure| structure.is_built_from(mesh))
    }

    pub fn get(&self, id: GeometryId) -> Option<Arc<BottomStructure>> {
        self.slots.get(id.index())?.load()
    }

    /// Installs `structure` at its geometry id and returns whatever it replaced.
    pub fn register(&self, structure: Arc<BottomStructure>) -> Result<Option<Arc<BottomStructure>>, AccelError> {
        let id = structure.id;
        let slot = self.slots.get(id.index()).ok_or_else(|| {
            log::error!("geometry {} does not fit registry capacity {}", id, self.slots.len());
            AccelError::CapacityExceeded {
                id,
                capacity: self.slots.len(),
            }
        })?;
        Ok(slot.swap(Some(structure)))
    }

    pub fn retire(&self, structure: Arc<BottomStructure>) {
        self.candidates.lock().push(structure);
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn collect_unreferenced(&self) -> Vec<Reclaim> {
        let mut candidates = self.candidates.lock();
        let mut reclaimed = Vec::new();
        candidates.retain(|candidate| {
            // register only ever places a structure at its own id
            match self.slots.get(candidate.id.index()).and_then(|slot| slot.load()) {
                Some(current) if Arc::ptr_eq(&current, candidate) => true,
                Some(current) if current.handle == candidate.handle => {
                    if current.buffer != candidate.buffer {
                        reclaimed.push(Reclaim::Buffer(candidate.buffer));
                    }
                    false
                }
                _ => {
                    if Arc::strong_count(candidate) == 1 {
                        reclaimed.push(Reclaim::Structure(Arc::clone(candidate)));
                        false
                    } else {
                        true
                    }
                }
            }
        });
        if !reclaimed.is_empty() {
            log::debug!(
                "reclaimed {} bottom structure resources, {} candidates remain",
                reclaimed.len(),
                candidates.len()
            );
        }
        reclaimed
    }

    /// Empties every slot and the candidate list for teardown.
    pub fn drain(&self) -> Vec<Reclaim> {
        let mut reclaimed = Vec::new();
        let mut registered = Vec::new();
        for slot in self.slots.iter() {
            if let Some(structure) = slot.take() {
                registered.push((structure.handle, structure.buffer));
                reclaimed.push(Reclaim::Structure(structure));
            }
        }
        for candidate in self.candidates.lock().drain(..) {
            match registered.iter().find(|(handle, _)| *handle == candidate.handle) {
                Some((_, buffer)) if *buffer != candidate.buffer => reclaimed.push(Reclaim::Buffer(candidate.buffer)),
                Some(_) => {}
                None => reclaimed.push(Reclaim::Structure(candidate)),
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::BottomBuild, maths::*};
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use rayon::prelude::*;
    use std::time::Duration;

    fn mesh() -> Arc<Mesh> {
        Arc::new(Mesh::default().with_box(Vec3::zero(), Vec3::one()))
    }

    fn structure(id: u32, mesh: &Arc<Mesh>) -> Arc<BottomStructure> {
        let geometry = GeometryDesc::new(GeometryId(id), Arc::clone(mesh));
        let build = BottomBuild {
            handle: AccelHandle::new(u64::from(id)),
            buffer: BufferHandle::new(u64::from(id)),
            device_address: DeviceAddress(0x1000 + u64::from(id)),
        };
        Arc::new(BottomStructure::new(&geometry, build, Duration::ZERO))
    }

    #[test]
    fn lookup_with_other_mesh_misses() {
        let registry = Registry::new(4);
        let a = mesh();
        let b = mesh();
        registry.register(structure(1, &a)).unwrap();
        assert!(registry.lookup(GeometryId(1), &a).is_some());
        assert!(registry.lookup(GeometryId(1), &b).is_none());
        assert!(registry.lookup(GeometryId(2), &a).is_none());
        assert!(registry.lookup(GeometryId(9), &a).is_none());
    }

    #[test]
    fn out_of_range_register_is_capacity_error() {
        let registry = Registry::new(2);
        let m = mesh();
        let err = registry.register(structure(2, &m)).unwrap_err();
        assert_eq!(
            err,
            AccelError::CapacityExceeded {
                id: GeometryId(2),
                capacity: 2
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn replaced_structure_is_collected_once_unreferenced() {
        let registry = Registry::new(4);
        let m = mesh();
        let first = structure(0, &m);
        assert!(registry.register(Arc::clone(&first)).unwrap().is_none());
        let old = registry.register(structure(0, &m)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&old, &first));

        registry.retire(old);
        assert!(registry.collect_unreferenced().is_empty(), "test still holds a reference");
        assert_eq!(registry.pending_candidates(), 1);

        drop(first);
        let reclaimed = registry.collect_unreferenced();
        assert_eq!(reclaimed.len(), 1);
        assert!(matches!(&reclaimed[0], Reclaim::Structure(s) if s.id == GeometryId(0)));
        assert_eq!(registry.pending_candidates(), 0);
    }

    #[test]
    fn candidate_still_registered_is_kept() {
        let registry = Registry::new(4);
        let m = mesh();
        let s = structure(3, &m);
        registry.register(Arc::clone(&s)).unwrap();
        registry.retire(s);
        assert!(registry.collect_unreferenced().is_empty());
        assert_eq!(registry.pending_candidates(), 1);
    }

    #[test]
    fn rebuffered_handle_reclaims_only_the_old_buffer() {
        let registry = Registry::new(4);
        let m = mesh();
        let original = structure(1, &m);
        let moved = Arc::new(original.with_buffer(BufferHandle::new(77)));
        registry.register(Arc::clone(&original)).unwrap();
        let old = registry.register(moved).unwrap().unwrap();
        drop(original);
        registry.retire(old);

        let reclaimed = registry.collect_unreferenced();
        assert_eq!(reclaimed.len(), 1);
        assert!(matches!(reclaimed[0], Reclaim::Buffer(b) if b.raw() == 1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_returns_everything_once() {
        let registry = Registry::new(8);
        let m = mesh();
        for id in 0..4 {
            registry.register(structure(id, &m)).unwrap();
        }
        let old = registry.register(structure(2, &m)).unwrap().unwrap();
        registry.retire(old);
        let reclaimed = registry.drain();
        assert_eq!(reclaimed.len(), 5);
        assert!(registry.is_empty());
        assert_eq!(registry.pending_candidates(), 0);
    }

    #[test]
    fn concurrent_register_and_lookup() {
        let registry = Registry::new(16);
        let meshes: Vec<_> = (0..16).map(|_| mesh()).collect();
        let replaced: usize = (0..4_000u64)
            .into_par_iter()
            .map(|seed| {
                let mut rng = SmallRng::seed_from_u64(seed);
                let id = rng.gen_range(0..16u32);
                let m = &meshes[id as usize];
                if rng.gen_bool(0.25) {
                    usize::from(registry.register(structure(id, m)).unwrap().is_some())
                } else {
                    if let Some(found) = registry.lookup(GeometryId(id), m) {
                        assert_eq!(found.id, GeometryId(id));
                    }
                    0
                }
            })
            .sum();
        let live = registry.len();
        assert!(live <= 16);
        assert!(replaced + live > 0);
    }
}
