use crate::{
    backend::*,
    error::AccelError,
    geometry::*,
    job::{BuildContext, JobSlots, Outstanding},
    lifecycle::Retired,
    resource::*,
    task::TaskPriority,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// A built bottom structure for one geometry.
#[derive(Debug)]
pub struct BottomStructure {
    pub id: GeometryId,
    pub handle: AccelHandle,
    pub buffer: BufferHandle,
    pub device_address: DeviceAddress,
    pub build_duration: Duration,
    identity: MeshIdentity,
}

impl BottomStructure {
    pub fn new(geometry: &GeometryDesc, build: BottomBuild, build_duration: Duration) -> Self {
        Self {
            id: geometry.id,
            handle: build.handle,
            buffer: build.buffer,
            device_address: build.device_address,
            build_duration,
            identity: geometry.identity(),
        }
    }

    /// Same structure handle backed by a different buffer, as after compaction into new memory.
    pub fn with_buffer(&self, buffer: BufferHandle) -> Self {
        Self {
            id: self.id,
            handle: self.handle,
            buffer,
            device_address: self.device_address,
            build_duration: self.build_duration,
            identity: self.identity.clone(),
        }
    }

    pub fn is_built_from(&self, mesh: &Arc<Mesh>) -> bool {
        self.identity.matches(mesh)
    }

    pub(crate) fn destroy(&self, backend: &dyn BuildBackend) {
        backend.destroy_accel(self.handle);
        backend.destroy_buffer(self.buffer);
    }
}

/// Where a bottom-structure worker delivers its result.
pub enum BottomTarget {
    /// Registry only, for builds nobody is waiting on.
    Registry,
    /// Registry and one result slot of a waiting job.
    Job { slots: Arc<JobSlots>, index: usize },
}

pub(crate) fn submit_bottom_worker(ctx: &BuildContext, geometry: GeometryDesc, target: BottomTarget) {
    let outstanding = Outstanding::enter(&ctx.outstanding_bottoms);
    let worker_ctx = ctx.clone();
    ctx.pool.submit(
        TaskPriority::High,
        Box::new(move || {
            let _outstanding = outstanding;
            run_bottom_worker(&worker_ctx, geometry, target)
        }),
    );
}

fn run_bottom_worker(ctx: &BuildContext, geometry: GeometryDesc, target: BottomTarget) {
    let result = build_and_register(ctx, &geometry);
    match target {
        BottomTarget::Registry => {
            if let Err(err) = result {
                log::warn!("prewarm of geometry {} failed: {}", geometry.id, err);
            }
        }
        BottomTarget::Job { slots, index } => {
            if !slots.fill_and_notify(index, result) {
                log::error!(
                    "job {} slot {} for geometry {} was already filled",
                    slots.job(),
                    index,
                    geometry.id
                );
            }
        }
    }
}

fn build_and_register(ctx: &BuildContext, geometry: &GeometryDesc) -> Result<Arc<BottomStructure>, AccelError> {
    ctx.registry.check_capacity(geometry.id)?;

    let start = Instant::now();
    let build = ctx.backend.build_bottom(geometry).map_err(|source| {
        log::warn!("bottom build for geometry {} failed: {}", geometry.id, source);
        AccelError::Build {
            id: Some(geometry.id),
            source,
        }
    })?;
    let structure = Arc::new(BottomStructure::new(geometry, build, start.elapsed()));
    log::debug!(
        "built geometry {} ({} triangles) in {:?} at {:#x}",
        geometry.id,
        geometry.mesh.triangle_count(),
        structure.build_duration,
        structure.device_address.0
    );

    match ctx.registry.register(Arc::clone(&structure)) {
        Ok(Some(old)) => ctx.lifecycle.defer_destroy(Retired::Bottom(old)),
        Ok(None) => {}
        Err(err) => {
            ctx.lifecycle.defer_destroy(Retired::Bottom(structure));
            return Err(err);
        }
    }
    Ok(structure)
}
