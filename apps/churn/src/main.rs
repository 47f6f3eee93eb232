mod scene;

use crate::scene::*;
use basalt::prelude::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    path::PathBuf,
    process,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use strum::{EnumString, EnumVariantNames, VariantNames};
use structopt::StructOpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumVariantNames)]
#[strum(serialize_all = "kebab_case")]
enum PoolKind {
    Tokio,
    Inline,
}

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// Number of frames to simulate
    #[structopt(short, long, default_value = "600")]
    frames: u32,

    /// Number of instances in the scene
    #[structopt(short, long, default_value = "256")]
    entities: u32,

    /// Number of distinct meshes
    #[structopt(short, long, default_value = "32")]
    meshes: u32,

    /// Number of structure sets built from the scene
    #[structopt(long, default_value = "2")]
    sets: u32,

    /// Simulated driver latency of each build in milliseconds
    #[structopt(long, default_value = "2")]
    latency_ms: u64,

    /// Simulated GPU time of each frame in milliseconds
    #[structopt(long, default_value = "4")]
    frame_ms: u64,

    /// Make one bottom build fail every N frames (0 disables)
    #[structopt(long, default_value = "0")]
    fail_every: u32,

    /// Which worker pool runs builds
    #[structopt(long, possible_values=PoolKind::VARIANTS, default_value = "tokio")]
    pool: PoolKind,

    /// Build every mesh before the first frame
    #[structopt(long)]
    prewarm: bool,

    /// JSON file with the acceleration structure configuration
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// Seed for the scene animation
    #[structopt(long, default_value = "0")]
    seed: u64,
}

fn set_name(index: u32) -> String {
    match index {
        0 => "main".to_owned(),
        1 => "shadow".to_owned(),
        n => format!("view-{}", n - 1),
    }
}

/// What one frame in flight recorded against, checked when its fence is waited on.
#[derive(Default)]
struct FrameInFlight {
    submitted: Option<Instant>,
    bound: Vec<AccelHandle>,
}

#[derive(Debug, Default)]
struct RunStats {
    rebinds: u64,
    stale_reads: u64,
    reloads: u64,
    leaked: bool,
}

fn run(params: &AppParams) -> Result<RunStats, AccelError> {
    let config = match &params.config {
        Some(path) => AccelConfig::from_json_file(path)?,
        None => AccelConfig::default(),
    };
    let frames_in_flight = config.frames_in_flight;
    let backend = Arc::new(HostBackend::default().with_latency(Duration::from_millis(params.latency_ms)));
    let mut sys = match params.pool {
        PoolKind::Tokio => AccelSystem::with_tokio_pool(config, backend.clone())?,
        PoolKind::Inline => AccelSystem::new(config, backend.clone(), Arc::new(InlineWorkerPool))?,
    };

    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut scene = Scene::new(&mut rng, params.meshes, params.entities);
    let set_ids: Vec<AccelSetId> = (0..params.sets.max(1)).map(|i| sys.create_set(&set_name(i))).collect();
    if params.prewarm {
        let submitted = sys.prewarm(scene.meshes())?;
        log::info!("prewarming {} meshes", submitted);
    }

    let frame_time = Duration::from_millis(params.frame_ms);
    let mut in_flight: Vec<FrameInFlight> = (0..frames_in_flight).map(|_| FrameInFlight::default()).collect();
    let mut stats = RunStats::default();
    for frame in 0..params.frames {
        let slot = frame as usize % frames_in_flight;

        // wait on this slot's fence, then check the GPU never read a destroyed structure
        let previous = &mut in_flight[slot];
        if let Some(submitted) = previous.submitted.take() {
            let elapsed = submitted.elapsed();
            if elapsed < frame_time {
                thread::sleep(frame_time - elapsed);
            }
        }
        for handle in previous.bound.drain(..) {
            if backend.was_destroyed(handle) {
                log::error!("frame {} read {:?} after it was destroyed", frame, handle);
                stats.stale_reads += 1;
            }
        }
        sys.begin_frame(slot);

        scene.animate(params.frame_ms as f32 / 1000.0);
        if rng.gen_bool(0.02) {
            let id = scene.reload_mesh(&mut rng);
            log::debug!("reloaded mesh {}", id);
            stats.reloads += 1;
        }
        if rng.gen_bool(0.01) {
            scene.spawn_entity(&mut rng);
        }
        if rng.gen_bool(0.01) {
            scene.remove_entity(&mut rng);
        }
        if params.fail_every != 0 && frame % params.fail_every == 0 {
            backend.fail_next_bottom_builds(1);
        }

        let summary = sys.update(&mut scene);
        if summary.failed != 0 {
            log::warn!("frame {}: {} rebuilds failed", frame, summary.failed);
        }

        // record: rebind where the set changed since this slot last used it
        let current = &mut in_flight[slot];
        for &id in &set_ids {
            let Some(set) = sys.set(id) else {
                continue;
            };
            let handle = set.current_handle();
            if set.pending_bind_mask() & (1 << slot) != 0 && set.acknowledge_bind(slot, handle) {
                stats.rebinds += 1;
            }
            current.bound.extend(handle);
        }
        current.submitted = Some(Instant::now());

        if frame % 100 == 0 {
            log::info!(
                "frame {}: {} entities, {:?}",
                frame,
                scene.entity_count(),
                set_ids
                    .iter()
                    .filter_map(|&id| sys.set(id).map(|set| (set.name(), set.generation())))
                    .collect::<Vec<_>>()
            );
        }
    }

    for &id in &set_ids {
        if let Some(set) = sys.set(id) {
            match set.last_report() {
                Some(report) => log::info!(
                    "{}: generation {}, last job {} ({}) resolve {:?} wait {:?} build {:?}",
                    set.name(),
                    set.generation(),
                    report.job,
                    report.kind,
                    report.resolve_time,
                    report.wait_time,
                    report.build_time
                ),
                None => log::info!("{}: never published", set.name()),
            }
            if let Some(err) = set.fault() {
                log::error!("{}: stopped by {}", set.name(), err);
            }
        }
    }
    log::info!("system: {:?}", sys.stats());

    sys.shutdown();
    let host = backend.stats();
    log::info!("backend: {:?}", host);
    if backend.live_accels() != 0 || backend.live_buffers() != 0 || host.invalid_destroys != 0 {
        log::error!(
            "leak check failed: {} structures and {} buffers live, {} invalid destroys",
            backend.live_accels(),
            backend.live_buffers(),
            host.invalid_destroys
        );
        stats.leaked = true;
    }
    Ok(stats)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let params = AppParams::from_args();

    match run(&params) {
        Ok(stats) => {
            log::info!("{:?}", stats);
            if stats.stale_reads != 0 || stats.leaked {
                process::exit(1);
            }
        }
        Err(err) => {
            log::error!("{}", err);
            process::exit(2);
        }
    }
}
