use crate::{
    backend::BuildBackend,
    bottom::{submit_bottom_worker, BottomStructure, BottomTarget},
    error::AccelError,
    geometry::*,
    lifecycle::LifecycleManager,
    registry::Registry,
    task::*,
};
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};
use strum::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a worker needs, captured explicitly at submission time.
#[derive(Clone)]
pub struct BuildContext {
    pub backend: Arc<dyn BuildBackend>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub pool: Arc<dyn WorkerPool>,
    pub dependency_timeout: Duration,
    pub(crate) outstanding_bottoms: Arc<AtomicUsize>,
    pub(crate) outstanding_tops: Arc<AtomicUsize>,
}

impl BuildContext {
    pub fn new(
        backend: Arc<dyn BuildBackend>,
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        pool: Arc<dyn WorkerPool>,
        dependency_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            lifecycle,
            pool,
            dependency_timeout,
            outstanding_bottoms: Arc::new(AtomicUsize::new(0)),
            outstanding_tops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bottom-structure workers submitted but not yet finished.
    pub fn outstanding_bottoms(&self) -> usize {
        self.outstanding_bottoms.load(Ordering::Acquire)
    }

    /// Top-structure workers submitted but not yet finished.
    pub fn outstanding_tops(&self) -> usize {
        self.outstanding_tops.load(Ordering::Acquire)
    }
}

/// Holds one count on a worker counter from submission until the work item is dropped,
/// whether or not the pool ever ran it.
pub(crate) struct Outstanding(Arc<AtomicUsize>);

impl Outstanding {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub type SlotResult = Result<Arc<BottomStructure>, AccelError>;

/// Per-geometry results of one job, shared with the bottom-structure workers it spawned.
pub struct JobSlots {
    job: JobId,
    slots: Box<[OnceLock<SlotResult>]>,
    filled: AtomicU32,
    signal: CompletionSignal,
}

impl JobSlots {
    fn new(job: JobId, expected: usize) -> Self {
        Self {
            job,
            slots: (0..expected).map(|_| OnceLock::new()).collect(),
            filled: AtomicU32::new(0),
            signal: CompletionSignal::new(),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn expected(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn filled(&self) -> u32 {
        self.filled.load(Ordering::Acquire)
    }

    /// Returns false if the slot was already filled.
    pub fn fill(&self, index: usize, result: SlotResult) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if slot.set(result).is_err() {
            return false;
        }
        self.filled.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Fill from a worker thread. Always wakes the job, even if the fill was rejected,
    /// so that a waiting job never sleeps past the work it was told about.
    pub fn fill_and_notify(&self, index: usize, result: SlotResult) -> bool {
        let filled = self.fill(index, result);
        self.signal.notify_one();
        filled
    }

    pub fn get(&self, index: usize) -> Option<&SlotResult> {
        self.slots.get(index)?.get()
    }

    fn wait(&self, count: usize, timeout: Duration) -> usize {
        self.signal.wait_for(count, timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum JobState {
    Created,
    ResolvingDependencies,
    AllCached,
    BuildingMissing,
    Assembling,
    Published,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum RebuildKind {
    /// At least one geometry had to be built.
    Full,
    /// Every geometry was cached; only the instance list was rebuilt.
    Reassemble,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: JobId,
    pub set: String,
    pub kind: RebuildKind,
    pub instance_count: u32,
    pub unique_geometries: u32,
    pub cached: u32,
    pub spawned: u32,
    pub generation: u32,
    pub resolve_time: Duration,
    pub wait_time: Duration,
    pub build_time: Duration,
}

/// One top-structure build, from dependency resolution to an assembled instance list.
pub struct TopStructureJob {
    id: JobId,
    set: String,
    state: JobState,
    instances: Vec<InstanceDesc>,
    geometries: Vec<GeometryDesc>,
    slot_of: HashMap<GeometryId, usize>,
    slots: Arc<JobSlots>,
    mesh_conflicts: u32,
    cached: u32,
    spawned: u32,
    resolve_time: Duration,
    wait_time: Duration,
}

impl TopStructureJob {
    pub fn new(id: JobId, set: impl Into<String>, instances: Vec<InstanceDesc>) -> Self {
        let set = set.into();
        let mut geometries: Vec<GeometryDesc> = Vec::new();
        let mut slot_of: HashMap<GeometryId, usize> = HashMap::new();
        let mut mesh_conflicts = 0;
        for instance in &instances {
            let geometry = &instance.geometry;
            match slot_of.entry(geometry.id) {
                Entry::Occupied(entry) => {
                    let first = &geometries[*entry.get()];
                    if !Arc::ptr_eq(&first.mesh, &geometry.mesh) {
                        // one slot per id, so this instance will reference the first mesh's structure
                        log::error!(
                            "job {} ({}): geometry {} is used with two different meshes",
                            id,
                            set,
                            geometry.id
                        );
                        mesh_conflicts += 1;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(geometries.len());
                    geometries.push(geometry.clone());
                }
            }
        }
        let slots = Arc::new(JobSlots::new(id, geometries.len()));
        Self {
            id,
            set,
            state: JobState::Created,
            instances,
            geometries,
            slot_of,
            slots,
            mesh_conflicts,
            cached: 0,
            spawned: 0,
            resolve_time: Duration::ZERO,
            wait_time: Duration::ZERO,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn set(&self) -> &str {
        &self.set
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// One id per instance, duplicates included.
    pub fn required_geometry_ids(&self) -> impl Iterator<Item = GeometryId> + '_ {
        self.instances.iter().map(|instance| instance.geometry_id())
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn unique_geometry_count(&self) -> u32 {
        self.geometries.len() as u32
    }

    pub fn slots(&self) -> &Arc<JobSlots> {
        &self.slots
    }

    /// Instances whose geometry id was already taken by a different mesh in this snapshot.
    pub fn mesh_conflicts(&self) -> u32 {
        self.mesh_conflicts
    }

    pub fn spawned(&self) -> u32 {
        self.spawned
    }

    pub fn cached(&self) -> u32 {
        self.cached
    }

    pub fn kind(&self) -> RebuildKind {
        if self.spawned == 0 {
            RebuildKind::Reassemble
        } else {
            RebuildKind::Full
        }
    }

    fn transition(&mut self, next: JobState) {
        log::debug!("job {} ({}): {} -> {}", self.id, self.set, self.state, next);
        self.state = next;
    }

    pub fn abandon(&mut self, err: &AccelError) {
        log::warn!("job {} ({}) abandoned in state {}: {}", self.id, self.set, self.state, err);
        self.transition(JobState::Abandoned);
    }

    /// Fills every slot that the registry can satisfy and submits a worker for each one it cannot.
    /// Returns the number of workers submitted.
    pub fn resolve_dependencies(&mut self, ctx: &BuildContext) -> Result<u32, AccelError> {
        let start = Instant::now();
        self.transition(JobState::ResolvingDependencies);

        for geometry in &self.geometries {
            ctx.registry.check_capacity(geometry.id)?;
        }

        let mut missing = Vec::new();
        for (index, geometry) in self.geometries.iter().enumerate() {
            match ctx.registry.lookup(geometry.id, &geometry.mesh) {
                Some(structure) => {
                    self.slots.fill(index, Ok(structure));
                    self.cached += 1;
                }
                None => missing.push(index),
            }
        }

        if missing.is_empty() {
            self.transition(JobState::AllCached);
        } else {
            self.transition(JobState::BuildingMissing);
            for index in missing {
                let geometry = self.geometries[index].clone();
                let target = BottomTarget::Job {
                    slots: Arc::clone(&self.slots),
                    index,
                };
                submit_bottom_worker(ctx, geometry, target);
                self.spawned += 1;
            }
        }
        self.resolve_time = start.elapsed();
        log::debug!(
            "job {} ({}): {} instances, {} unique geometries, {} cached, {} building",
            self.id,
            self.set,
            self.instances.len(),
            self.geometries.len(),
            self.cached,
            self.spawned
        );
        Ok(self.spawned)
    }

    /// Blocks until every spawned worker has reported, then checks that every slot is filled.
    pub fn wait_for_dependencies(&mut self, timeout: Duration) -> Result<(), AccelError> {
        let start = Instant::now();
        let woken = self.slots.wait(self.spawned as usize, timeout);
        self.wait_time = start.elapsed();

        let filled = self.slots.filled();
        let expected = self.slots.expected();
        if woken < self.spawned as usize || filled != expected {
            return Err(AccelError::DependencyTimeout {
                job: self.id,
                filled,
                expected,
            });
        }
        Ok(())
    }

    /// Produces one placement per instance in the original order, and the structures they reference.
    pub fn assemble(&mut self) -> Result<(Vec<InstancePlacement>, Vec<Arc<BottomStructure>>), AccelError> {
        self.transition(JobState::Assembling);

        let mut bottoms = Vec::with_capacity(self.geometries.len());
        for (index, geometry) in self.geometries.iter().enumerate() {
            match self.slots.get(index) {
                Some(Ok(structure)) => bottoms.push(Arc::clone(structure)),
                Some(Err(err)) => return Err(err.clone()),
                None => {
                    log::error!(
                        "job {}: no result for geometry {} after all dependencies reported",
                        self.id,
                        geometry.id
                    );
                    return Err(AccelError::MissingSlot {
                        job: self.id,
                        geometry: geometry.id,
                    });
                }
            }
        }

        let mut placements = Vec::with_capacity(self.instances.len());
        for instance in &self.instances {
            let id = instance.geometry_id();
            let structure = self
                .slot_of
                .get(&id)
                .and_then(|&index| bottoms.get(index))
                .ok_or(AccelError::MissingSlot { job: self.id, geometry: id })?;
            debug_assert!(!structure.device_address.is_null());
            placements.push(instance.placement(structure.device_address));
        }
        Ok((placements, bottoms))
    }

    pub(crate) fn mark_published(&mut self) {
        self.transition(JobState::Published);
    }

    pub(crate) fn report(&self, generation: u32, build_time: Duration) -> JobReport {
        JobReport {
            job: self.id,
            set: self.set.clone(),
            kind: self.kind(),
            instance_count: self.instance_count(),
            unique_geometries: self.unique_geometry_count(),
            cached: self.cached,
            spawned: self.spawned,
            generation,
            resolve_time: self.resolve_time,
            wait_time: self.wait_time,
            build_time,
        }
    }
}
