mod common;

use basalt::prelude::*;
use common::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Wraps the host backend to record how many top builds ever overlapped.
struct CountingBackend {
    inner: Arc<HostBackend>,
    active_tops: AtomicUsize,
    peak_tops: AtomicUsize,
}

impl CountingBackend {
    fn new(inner: Arc<HostBackend>) -> Self {
        Self {
            inner,
            active_tops: AtomicUsize::new(0),
            peak_tops: AtomicUsize::new(0),
        }
    }

    fn peak_tops(&self) -> usize {
        self.peak_tops.load(Ordering::SeqCst)
    }
}

impl BuildBackend for CountingBackend {
    fn build_bottom(&self, geometry: &GeometryDesc) -> Result<BottomBuild, BuildError> {
        self.inner.build_bottom(geometry)
    }

    fn build_top(&self, instances: &[InstancePlacement]) -> Result<TopBuild, BuildError> {
        let active = self.active_tops.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_tops.fetch_max(active, Ordering::SeqCst);
        let result = self.inner.build_top(instances);
        self.active_tops.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn destroy_accel(&self, handle: AccelHandle) {
        self.inner.destroy_accel(handle)
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        self.inner.destroy_buffer(handle)
    }
}

fn tokio_system(backend: Arc<CountingBackend>) -> AccelSystem {
    let config = AccelConfig {
        worker_threads: 4,
        max_concurrent_top_builds: 2,
        ..config(1)
    };
    AccelSystem::with_tokio_pool(config, backend).unwrap()
}

/// Checks that nothing a consumer could be using right now has been destroyed.
fn check_current(sys: &AccelSystem, backend: &HostBackend, id: AccelSetId) {
    if let Some(top) = sys.set(id).unwrap().current() {
        assert!(!backend.was_destroyed(top.handle), "current top structure destroyed");
        for bottom in top.bottoms() {
            assert!(!backend.was_destroyed(bottom.handle), "referenced bottom structure destroyed");
        }
    }
}

/// Keeps running frames without scene changes until every set is idle and cooled down.
fn settle(sys: &mut AccelSystem, scene: &mut TestScene, mut frame: usize) -> usize {
    for _ in 0..5_000 {
        sys.begin_frame(frame % 2);
        sys.update(scene);
        frame += 1;
        let cooled = sys.set_ids().all(|id| sys.set(id).unwrap().cooldown() == 0);
        if sys.is_idle() && cooled {
            return frame;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("system did not settle");
}

fn finish(mut sys: AccelSystem, host: &HostBackend) {
    sys.shutdown();
    drop(sys);
    assert_eq!(host.live_accels(), 0, "leaked structures");
    assert_eq!(host.live_buffers(), 0, "leaked buffers");
    assert_eq!(host.stats().invalid_destroys, 0, "double destruction");
}

#[test]
fn random_churn_on_worker_threads() {
    init_logging();
    let host = Arc::new(HostBackend::default().with_latency(Duration::from_micros(200)));
    let backend = Arc::new(CountingBackend::new(Arc::clone(&host)));
    let mut sys = tokio_system(Arc::clone(&backend));
    let main = sys.create_set("main");
    let uses: Vec<usize> = (0..24).map(|i| i % 8).collect();
    let mut scene = TestScene::new(8, &uses);
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    let mut last_generation = 0;
    for frame in 0..300 {
        if rng.gen_bool(0.4) {
            scene.move_all(Vec3::new(rng.gen_range(-1.0..1.0), 0.0, 0.0));
        }
        if rng.gen_bool(0.05) {
            scene.reload(rng.gen_range(0..8));
        }
        if rng.gen_bool(0.02) {
            host.fail_next_bottom_builds(1);
        }

        let slot = frame % 2;
        sys.begin_frame(slot);
        sys.update(&mut scene);

        let set = sys.set(main).unwrap();
        let generation = set.generation();
        assert!(generation >= last_generation, "generation went backwards");
        last_generation = generation;
        if set.pending_bind_mask() & (1 << slot) != 0 {
            // a worker may publish between these two calls, in which case the bit stays set
            set.acknowledge_bind(slot, set.current_handle());
        }
        check_current(&sys, &host, main);
        thread::sleep(Duration::from_micros(500));
    }

    host.clear_failures();
    settle(&mut sys, &mut scene, 300);
    let generation = sys.set(main).unwrap().generation();
    assert!(generation > 1);
    assert_eq!(u64::from(generation), sys.stats().published);
    assert_eq!(backend.peak_tops(), 1, "a set ran two jobs at once");

    finish(sys, &host);
}

#[test]
fn top_builds_across_sets_respect_the_throttle() {
    let host = Arc::new(HostBackend::default().with_latency(Duration::from_millis(2)));
    let backend = Arc::new(CountingBackend::new(Arc::clone(&host)));
    let mut sys = tokio_system(Arc::clone(&backend));
    let sets: Vec<AccelSetId> = ["main", "shadow", "reflection", "ambient"]
        .iter()
        .map(|name| sys.create_set(name))
        .collect();
    let mut scene = TestScene::new(4, &[0, 1, 2, 3, 0, 1]);

    let mut frame = 0;
    for round in 0..5 {
        scene.move_all(Vec3::unit_y());
        if round == 2 {
            scene.reload(3);
        }
        frame = settle(&mut sys, &mut scene, frame);
        for &id in &sets {
            check_current(&sys, &host, id);
        }
    }

    for &id in &sets {
        assert!(sys.set(id).unwrap().generation() >= 5);
    }
    assert!(backend.peak_tops() <= 2, "{} top builds overlapped", backend.peak_tops());

    finish(sys, &host);
}

#[test]
fn shutdown_waits_for_in_flight_work() {
    let host = Arc::new(HostBackend::default().with_latency(Duration::from_millis(5)));
    let backend = Arc::new(CountingBackend::new(Arc::clone(&host)));
    let mut sys = tokio_system(backend);
    sys.create_set("main");
    let mut scene = TestScene::new(6, &[0, 1, 2, 3, 4, 5]);
    let extra: Vec<GeometryDesc> = (10..20)
        .map(|id| GeometryDesc::new(GeometryId(id), box_mesh(0.5)))
        .collect();

    sys.begin_frame(0);
    sys.update(&mut scene);
    assert_eq!(sys.prewarm(&extra).unwrap(), 10);
    assert!(!sys.is_idle());

    finish(sys, &host);
}

#[test]
fn shutdown_outlasts_a_job_longer_than_the_dependency_timeout() {
    let host = Arc::new(HostBackend::default().with_latency(Duration::from_millis(200)));
    let backend = Arc::new(CountingBackend::new(Arc::clone(&host)));
    let config = AccelConfig {
        worker_threads: 4,
        max_concurrent_top_builds: 2,
        dependency_timeout_ms: 300,
        ..config(1)
    };
    let mut sys = AccelSystem::with_tokio_pool(config, backend).unwrap();
    let main = sys.create_set("main");
    let mut scene = TestScene::new(2, &[0, 1]);

    // bottom builds then the top build take longer than the dependency timeout
    sys.begin_frame(0);
    assert_eq!(sys.update(&mut scene).spawned, 1);
    sys.shutdown();
    assert!(sys.is_idle());
    assert_eq!(sys.stats().published, 1);
    assert!(sys.set(main).unwrap().current_handle().is_none());
    assert_eq!(host.live_accels(), 0);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(host.live_accels(), 0, "a late publish leaked");
    finish(sys, &host);
}
