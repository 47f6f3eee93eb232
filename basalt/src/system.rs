use crate::{
    backend::BuildBackend,
    bottom::{submit_bottom_worker, BottomTarget},
    config::AccelConfig,
    error::AccelError,
    geometry::*,
    job::*,
    lifecycle::{LifecycleManager, ManagedTopStructure},
    orchestrator::*,
    registry::Registry,
    resource::*,
    task::*,
    top::{run_top_worker, TopStructure},
};
use slotmap::{new_key_type, SlotMap};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

new_key_type! {
    pub struct AccelSetId;
}

struct AccelSet {
    name: String,
    managed: Arc<ManagedTopStructure>,
    rebuild: RebuildState,
    last_report: Option<JobReport>,
    last_error: Option<AccelError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccelStats {
    pub jobs_spawned: u64,
    pub published: u64,
    pub failed: u64,
    pub reassembled: u64,
    pub bottom_builds: u64,
    pub cache_hits: u64,
    pub prewarmed: u64,
    pub destroyed_tops: u64,
    pub reclaimed_bottoms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub spawned: u32,
    pub published: u32,
    pub failed: u32,
}

/// Read-only view of one structure set for rendering threads.
pub struct AccelSetView<'a> {
    set: &'a AccelSet,
}

impl<'a> AccelSetView<'a> {
    pub fn name(&self) -> &'a str {
        &self.set.name
    }

    pub fn managed(&self) -> &'a Arc<ManagedTopStructure> {
        &self.set.managed
    }

    pub fn current(&self) -> Option<Arc<TopStructure>> {
        self.set.managed.current()
    }

    pub fn current_handle(&self) -> Option<AccelHandle> {
        self.set.managed.current_handle()
    }

    pub fn generation(&self) -> u32 {
        self.set.managed.generation()
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.set.managed.device_address()
    }

    pub fn pending_bind_mask(&self) -> u32 {
        self.set.managed.pending_bind_mask()
    }

    /// Call once the given frame in flight has rebound to `bound`, read from `current_handle`.
    /// Returns false if a newer structure arrived meanwhile; the frame stays pending.
    pub fn acknowledge_bind(&self, frame_index: usize, bound: Option<AccelHandle>) -> bool {
        self.set.managed.acknowledge_bind(frame_index, bound)
    }

    pub fn in_flight_job(&self) -> Option<JobId> {
        self.set.rebuild.in_flight_job()
    }

    pub fn fault(&self) -> Option<&'a AccelError> {
        self.set.rebuild.fault()
    }

    pub fn cooldown(&self) -> u32 {
        self.set.rebuild.cooldown()
    }

    pub fn last_report(&self) -> Option<&'a JobReport> {
        self.set.last_report.as_ref()
    }

    pub fn last_error(&self) -> Option<&'a AccelError> {
        self.set.last_error.as_ref()
    }
}

/// Owns the build pipeline for any number of named structure sets.
///
/// Frame loop contract: wait on the fence of frame `i`, call `begin_frame(i)`, then `update`
/// once, then record using the structures from `set(..)`. Neither call ever blocks on a build.
pub struct AccelSystem {
    config: AccelConfig,
    ctx: BuildContext,
    sets: SlotMap<AccelSetId, AccelSet>,
    next_job: u64,
    stats: AccelStats,
}

impl AccelSystem {
    pub fn new(
        config: AccelConfig,
        backend: Arc<dyn BuildBackend>,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self, AccelError> {
        let config = config.validated()?;
        let registry = Arc::new(Registry::new(config.registry_capacity));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.frames_in_flight,
            Arc::clone(&backend),
            Arc::clone(&registry),
        ));
        let ctx = BuildContext::new(backend, registry, lifecycle, pool, config.dependency_timeout());
        log::info!(
            "acceleration structure system: {} geometry slots, {} frames in flight",
            config.registry_capacity,
            config.frames_in_flight
        );
        Ok(Self {
            config,
            ctx,
            sets: SlotMap::with_key(),
            next_job: 1,
            stats: AccelStats::default(),
        })
    }

    pub fn with_tokio_pool(config: AccelConfig, backend: Arc<dyn BuildBackend>) -> Result<Self, AccelError> {
        let pool = TokioWorkerPool::new(config.worker_threads, config.max_concurrent_top_builds)
            .map_err(|err| AccelError::InvalidConfig(format!("failed to start worker pool: {}", err)))?;
        Self::new(config, backend, Arc::new(pool))
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.ctx.lifecycle
    }

    pub fn create_set(&mut self, name: &str) -> AccelSetId {
        if let Ok(id) = self.set_id(name) {
            log::warn!("structure set {:?} already exists", name);
            return id;
        }
        let set = AccelSet {
            name: name.to_owned(),
            managed: Arc::new(ManagedTopStructure::new(self.config.frames_in_flight)),
            rebuild: RebuildState::new(&self.config),
            last_report: None,
            last_error: None,
        };
        log::debug!("created structure set {:?}", name);
        self.sets.insert(set)
    }

    pub fn set_id(&self, name: &str) -> Result<AccelSetId, AccelError> {
        self.sets
            .iter()
            .find(|(_, set)| set.name == name)
            .map(|(id, _)| id)
            .ok_or_else(|| AccelError::UnknownSet(name.to_owned()))
    }

    pub fn set(&self, id: AccelSetId) -> Option<AccelSetView<'_>> {
        self.sets.get(id).map(|set| AccelSetView { set })
    }

    pub fn set_ids(&self) -> impl Iterator<Item = AccelSetId> + '_ {
        self.sets.keys()
    }

    /// Call after waiting on the fence of `frame_index`. Destroys what that frame queued
    /// and reclaims bottom structures that nothing references any more.
    pub fn begin_frame(&mut self, frame_index: usize) -> usize {
        let destroyed = self.ctx.lifecycle.begin_frame(frame_index);
        let reclaimed = self.ctx.registry.collect_unreferenced();
        let reclaimed_count = reclaimed.len();
        for reclaim in reclaimed {
            reclaim.destroy(self.ctx.backend.as_ref());
        }
        self.stats.destroyed_tops += destroyed as u64;
        self.stats.reclaimed_bottoms += reclaimed_count as u64;
        destroyed + reclaimed_count
    }

    /// Runs the per-frame decision for every set, spawning at most one job per set.
    pub fn update<S: SceneSource + ?Sized>(&mut self, source: &mut S) -> FrameSummary {
        let mut summary = FrameSummary::default();
        for (_, set) in self.sets.iter_mut() {
            match set.rebuild.poll_completion() {
                Some(Completion::Published(report)) => {
                    summary.published += 1;
                    record_report(&mut self.stats, &report);
                    set.last_report = Some(report);
                    set.last_error = None;
                }
                Some(Completion::Failed(err)) => {
                    summary.failed += 1;
                    self.stats.failed += 1;
                    log::warn!("rebuild of {} failed, keeping the last published structure: {}", set.name, err);
                    set.last_error = Some(err);
                }
                None => {}
            }

            set.rebuild.note_changes(source.changes(&set.name));
            let decision = set.rebuild.step();
            if let Decision::Spawn(reason) = decision {
                let job = JobId(self.next_job);
                self.next_job += 1;
                let instances = source.snapshot(&set.name);
                log::debug!("spawning job {} for {} ({}, {} instances)", job, set.name, reason, instances.len());
                let job = TopStructureJob::new(job, set.name.clone(), instances);
                spawn_job(&self.ctx, set, job);
                summary.spawned += 1;
                self.stats.jobs_spawned += 1;
            }
        }
        summary
    }

    /// Rebuild on the next `update` even if nothing changed or the set is cooling down.
    pub fn request_rebuild(&mut self, id: AccelSetId) -> Result<(), AccelError> {
        let set = self.sets.get_mut(id).ok_or_else(|| AccelError::UnknownSet(format!("{:?}", id)))?;
        set.rebuild.request_force();
        Ok(())
    }

    /// Lets a set that stopped on a fatal error try again.
    pub fn clear_fault(&mut self, id: AccelSetId) -> Result<(), AccelError> {
        let set = self.sets.get_mut(id).ok_or_else(|| AccelError::UnknownSet(format!("{:?}", id)))?;
        set.rebuild.clear_fault();
        Ok(())
    }

    /// Builds bottom structures ahead of need. Returns how many builds were submitted.
    pub fn prewarm(&mut self, geometries: &[GeometryDesc]) -> Result<u32, AccelError> {
        let mut submitted = 0;
        for geometry in geometries {
            self.ctx.registry.check_capacity(geometry.id)?;
            if self.ctx.registry.lookup(geometry.id, &geometry.mesh).is_some() {
                continue;
            }
            submit_bottom_worker(&self.ctx, geometry.clone(), BottomTarget::Registry);
            submitted += 1;
        }
        self.stats.prewarmed += u64::from(submitted);
        Ok(submitted)
    }

    pub fn stats(&self) -> AccelStats {
        self.stats.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.ctx.outstanding_bottoms() == 0
            && self.ctx.outstanding_tops() == 0
            && self.sets.values().all(|set| set.rebuild.in_flight_job().is_none())
    }

    /// Waits for every submitted worker to finish, then destroys every structure.
    /// The device must be idle.
    pub fn shutdown(&mut self) -> usize {
        self.wait_for_workers();
        for (_, set) in self.sets.iter_mut() {
            // every worker has replied or dropped its sender by now
            match set.rebuild.poll_completion() {
                Some(Completion::Published(report)) => {
                    record_report(&mut self.stats, &report);
                    set.last_report = Some(report);
                }
                Some(Completion::Failed(err)) => {
                    self.stats.failed += 1;
                    set.last_error = Some(err);
                }
                None => {}
            }
            if let Some(job) = set.rebuild.in_flight_job() {
                log::error!("job {} for {} has no result after its worker finished", job, set.name);
            }
        }

        let mut destroyed = self.ctx.lifecycle.flush_all();
        for set in self.sets.values() {
            if let Some(top) = set.managed.take_current() {
                top.destroy(self.ctx.backend.as_ref());
                destroyed += 1;
            }
        }
        self.stats.destroyed_tops += destroyed as u64;
        let reclaimed = self.ctx.registry.drain();
        self.stats.reclaimed_bottoms += reclaimed.len() as u64;
        destroyed += reclaimed.len();
        for reclaim in reclaimed {
            reclaim.destroy(self.ctx.backend.as_ref());
        }
        log::info!("acceleration structure system shut down, {} resources destroyed", destroyed);
        destroyed
    }

    fn wait_for_workers(&self) {
        let start = Instant::now();
        let mut next_warning = start + self.ctx.dependency_timeout;
        loop {
            let tops = self.ctx.outstanding_tops();
            let bottoms = self.ctx.outstanding_bottoms();
            if tops == 0 && bottoms == 0 {
                break;
            }
            if Instant::now() >= next_warning {
                log::warn!(
                    "shutdown waiting on {} top and {} bottom workers after {:?}",
                    tops,
                    bottoms,
                    start.elapsed()
                );
                next_warning += self.ctx.dependency_timeout;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn record_report(stats: &mut AccelStats, report: &JobReport) {
    stats.published += 1;
    stats.bottom_builds += u64::from(report.spawned);
    stats.cache_hits += u64::from(report.cached);
    if report.kind == RebuildKind::Reassemble {
        stats.reassembled += 1;
    }
}

fn spawn_job(ctx: &BuildContext, set: &mut AccelSet, job: TopStructureJob) {
    let (tx, output) = TaskOutput::channel();
    // register the output first, an inline pool finishes the job inside submit
    set.rebuild.begin_spawn(job.id(), output);
    let outstanding = Outstanding::enter(&ctx.outstanding_tops);
    let worker_ctx = ctx.clone();
    let managed = Arc::clone(&set.managed);
    ctx.pool.submit(
        TaskPriority::Normal,
        Box::new(move || {
            let _outstanding = outstanding;
            run_top_worker(worker_ctx, job, managed, tx)
        }),
    );
}
