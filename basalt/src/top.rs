use crate::{
    backend::*,
    bottom::BottomStructure,
    error::AccelError,
    job::{BuildContext, JobReport, TopStructureJob},
    lifecycle::ManagedTopStructure,
    resource::*,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

pub type TopResult = Result<JobReport, AccelError>;

#[derive(Debug)]
pub struct TopStructure {
    pub handle: AccelHandle,
    pub buffer: BufferHandle,
    pub instance_buffer: BufferHandle,
    pub device_address: DeviceAddress,
    pub instance_count: u32,
    pub build_duration: Duration,
    pub created_frame: u64,
    // keeps every referenced bottom structure out of reclamation while this is alive
    bottoms: Vec<Arc<BottomStructure>>,
}

impl TopStructure {
    pub fn new(
        build: TopBuild,
        instance_count: u32,
        build_duration: Duration,
        created_frame: u64,
        bottoms: Vec<Arc<BottomStructure>>,
    ) -> Self {
        Self {
            handle: build.handle,
            buffer: build.buffer,
            instance_buffer: build.instance_buffer,
            device_address: build.device_address,
            instance_count,
            build_duration,
            created_frame,
            bottoms,
        }
    }

    pub fn bottoms(&self) -> &[Arc<BottomStructure>] {
        &self.bottoms
    }

    pub(crate) fn destroy(&self, backend: &dyn BuildBackend) {
        backend.destroy_accel(self.handle);
        backend.destroy_buffer(self.buffer);
        backend.destroy_buffer(self.instance_buffer);
    }
}

/// Drives `job` to completion on a pool thread and publishes the result into `managed`.
pub(crate) fn run_top_worker(
    ctx: BuildContext,
    mut job: TopStructureJob,
    managed: Arc<ManagedTopStructure>,
    reply: oneshot::Sender<TopResult>,
) {
    let result = build_and_publish(&ctx, &mut job, &managed);
    if let Err(err) = &result {
        job.abandon(err);
    }
    if reply.send(result).is_err() {
        log::debug!("job {} finished after its set stopped listening", job.id());
    }
}

fn build_and_publish(
    ctx: &BuildContext,
    job: &mut TopStructureJob,
    managed: &ManagedTopStructure,
) -> Result<JobReport, AccelError> {
    job.resolve_dependencies(ctx)?;
    job.wait_for_dependencies(ctx.dependency_timeout)?;
    let (placements, bottoms) = job.assemble()?;

    let start = Instant::now();
    let build = ctx.backend.build_top(&placements).map_err(|source| {
        log::warn!("top build for job {} failed: {}", job.id(), source);
        AccelError::Build { id: None, source }
    })?;
    let build_time = start.elapsed();
    let top = Arc::new(TopStructure::new(
        build,
        job.instance_count(),
        build_time,
        ctx.lifecycle.frame_number(),
        bottoms,
    ));

    let generation = managed.publish(Arc::clone(&top), &ctx.lifecycle);
    job.mark_published();
    log::info!(
        "published {} ({} instances, {} geometries, {} built) as generation {} at {:#x}",
        job.set(),
        top.instance_count,
        job.unique_geometry_count(),
        job.spawned(),
        generation,
        top.device_address.0
    );
    Ok(job.report(generation, build_time))
}
