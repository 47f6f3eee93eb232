use crate::{
    atomic_slot::AtomicSlot, backend::BuildBackend, bottom::BottomStructure, registry::Registry, resource::*,
    top::TopStructure,
};
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::{
    mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// The current top structure of one structure set, as seen by rendering threads.
pub struct ManagedTopStructure {
    current: AtomicSlot<TopStructure>,
    generation: AtomicU32,
    pending_bind: AtomicU32,
    frames_in_flight: usize,
}

impl ManagedTopStructure {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            current: AtomicSlot::empty(),
            generation: AtomicU32::new(0),
            pending_bind: AtomicU32::new(0),
            frames_in_flight: frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT),
        }
    }

    fn all_frames(&self) -> u32 {
        (1u32 << self.frames_in_flight) - 1
    }

    fn frame_bit(&self, frame_index: usize) -> u32 {
        1u32 << (frame_index % self.frames_in_flight)
    }

    pub fn swap_current(&self, new: Option<Arc<TopStructure>>) -> Option<Arc<TopStructure>> {
        self.current.swap(new)
    }

    pub fn mark_pending_bind(&self, mask: u32) {
        self.pending_bind.fetch_or(mask & self.all_frames(), Ordering::Release);
    }

    /// Must follow `mark_pending_bind`, so that a consumer seeing the new generation also sees the mask.
    pub fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::Release) + 1
    }

    /// Call once `frame_index` has rebound to `bound`, the handle it read from `current_handle`.
    ///
    /// Returns false and leaves the bit set if a newer structure was published after `bound`
    /// was read, so that frame rebinds again instead of holding on to a retired structure.
    pub fn acknowledge_bind(&self, frame_index: usize, bound: Option<AccelHandle>) -> bool {
        let bit = self.frame_bit(frame_index);
        self.pending_bind.fetch_and(!bit, Ordering::AcqRel);
        // a publish whose bit we just cleared swapped `current` before setting it
        if self.current_handle() != bound {
            self.pending_bind.fetch_or(bit, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Installs `top` as current, queues the previous structure for destruction after the
    /// executing frame retires, and announces the change. Returns the new generation.
    pub fn publish(&self, top: Arc<TopStructure>, lifecycle: &LifecycleManager) -> u32 {
        if let Some(old) = self.swap_current(Some(top)) {
            lifecycle.defer_destroy(Retired::Top(old));
        }
        self.mark_pending_bind(self.all_frames());
        self.bump_generation()
    }

    pub fn current(&self) -> Option<Arc<TopStructure>> {
        self.current.load()
    }

    pub fn current_handle(&self) -> Option<AccelHandle> {
        self.current.load().map(|top| top.handle)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.current.load().map_or(DeviceAddress::NULL, |top| top.device_address)
    }

    pub fn pending_bind_mask(&self) -> u32 {
        self.pending_bind.load(Ordering::Acquire)
    }

    pub(crate) fn take_current(&self) -> Option<Arc<TopStructure>> {
        self.current.take()
    }
}

/// A resource waiting in a deferred-destruction queue.
#[derive(Debug)]
pub enum Retired {
    Bottom(Arc<BottomStructure>),
    Top(Arc<TopStructure>),
}

struct FrameQueues {
    current: usize,
    frame_number: u64,
    queues: ArrayVec<Vec<Retired>, MAX_FRAMES_IN_FLIGHT>,
}

/// Per-frame-in-flight deferred destruction.
///
/// Reading the executing frame and appending to its queue happen under the same lock as
/// `begin_frame` switching frames, so a resource replaced while frame `f` may be recording
/// always lands in a queue that is flushed only after `f` has retired.
pub struct LifecycleManager {
    frames: Mutex<FrameQueues>,
    backend: Arc<dyn BuildBackend>,
    registry: Arc<Registry>,
}

impl LifecycleManager {
    pub fn new(frames_in_flight: usize, backend: Arc<dyn BuildBackend>, registry: Arc<Registry>) -> Self {
        let count = frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        let mut queues = ArrayVec::new();
        for _ in 0..count {
            queues.push(Vec::new());
        }
        Self {
            frames: Mutex::new(FrameQueues {
                current: 0,
                frame_number: 0,
                queues,
            }),
            backend,
            registry,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.lock().queues.len()
    }

    pub fn current_frame(&self) -> usize {
        self.frames.lock().current
    }

    /// Count of `begin_frame` calls so far.
    pub fn frame_number(&self) -> u64 {
        self.frames.lock().frame_number
    }

    /// Call after waiting on the fence of `frame_index`: makes it the executing frame and
    /// destroys what was queued the last time it executed. Returns the number of resources destroyed.
    pub fn begin_frame(&self, frame_index: usize) -> usize {
        let retired = {
            let mut frames = self.frames.lock();
            let index = frame_index % frames.queues.len();
            frames.current = index;
            frames.frame_number += 1;
            mem::take(&mut frames.queues[index])
        };
        self.destroy_all(retired)
    }

    pub fn defer_destroy(&self, resource: Retired) {
        let mut frames = self.frames.lock();
        let index = frames.current;
        Self::push(&mut frames.queues[index], resource, self.backend.as_ref());
    }

    pub fn defer_destroy_at(&self, frame_index: usize, resource: Retired) {
        let mut frames = self.frames.lock();
        let index = frame_index % frames.queues.len();
        Self::push(&mut frames.queues[index], resource, self.backend.as_ref());
    }

    fn push(queue: &mut Vec<Retired>, resource: Retired, backend: &dyn BuildBackend) {
        if queue.try_reserve(1).is_ok() {
            queue.push(resource);
        } else {
            log::error!("deferred destruction queue allocation failed, destroying {:?} immediately", resource);
            match resource {
                Retired::Bottom(structure) => structure.destroy(backend),
                Retired::Top(top) => top.destroy(backend),
            }
        }
    }

    pub fn queued(&self, frame_index: usize) -> usize {
        let frames = self.frames.lock();
        frames.queues[frame_index % frames.queues.len()].len()
    }

    /// Destroys what `frame_index` queued. Only call once that frame's GPU work has retired.
    pub fn flush_frame(&self, frame_index: usize) -> usize {
        let retired = {
            let mut frames = self.frames.lock();
            let index = frame_index % frames.queues.len();
            mem::take(&mut frames.queues[index])
        };
        self.destroy_all(retired)
    }

    /// Flushes every queue regardless of frame order. The device must be idle.
    pub fn flush_all(&self) -> usize {
        let retired: Vec<Retired> = {
            let mut frames = self.frames.lock();
            frames.queues.iter_mut().flat_map(mem::take).collect()
        };
        self.destroy_all(retired)
    }

    fn destroy_all(&self, retired: Vec<Retired>) -> usize {
        let mut destroyed = 0;
        for resource in retired {
            match resource {
                Retired::Top(top) => {
                    top.destroy(self.backend.as_ref());
                    destroyed += 1;
                }
                // bottoms may still be registered or referenced by a live top structure
                Retired::Bottom(structure) => self.registry.retire(structure),
            }
        }
        if destroyed > 0 {
            log::debug!("destroyed {} top structures", destroyed);
        }
        destroyed
    }
}
