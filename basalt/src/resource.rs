use std::num;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_UID: AtomicU64 = AtomicU64::new(1);

fn next_handle_uid() -> u64 {
    NEXT_HANDLE_UID.fetch_add(1, Ordering::Relaxed)
}

/// A raw object paired with a process-unique id, so that two handles compare
/// equal only if they came from the same creation even when the raw value is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unique<T>(pub T, u64);

impl<T> Unique<T> {
    pub fn new(obj: T) -> Self {
        Self(obj, next_handle_uid())
    }

    pub fn uid(&self) -> u64 {
        self.1
    }
}

macro_rules! gpu_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Unique<u64>);

        impl $name {
            pub fn new(raw: u64) -> Self {
                Self(Unique::new(raw))
            }

            pub fn raw(&self) -> u64 {
                self.0 .0
            }

            pub fn uid(&self) -> u64 {
                self.0.uid()
            }
        }
    };
}

gpu_handle!(AccelHandle);
gpu_handle!(BufferHandle);

/// Opaque GPU address of a built structure, referenced from instance records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(num::NonZeroU16);

impl Generation {
    pub fn advance(&mut self) {
        self.0 = num::NonZeroU16::new(self.0.get().wrapping_add(1)).unwrap_or(num::NonZeroU16::MIN)
    }

    fn to_bits(self) -> u16 {
        self.0.get()
    }

    fn from_bits(bits: u16) -> Option<Self> {
        num::NonZeroU16::new(bits).map(Self)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self(num::NonZeroU16::MIN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    generation: Generation,
    index: u32,
}

impl ResourceHandle {
    pub fn into_raw(self) -> u64 {
        (u64::from(self.index) << 16) | u64::from(self.generation.to_bits())
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        let index = u32::try_from(raw >> 16).ok()?;
        let generation = Generation::from_bits((raw & 0xffff) as u16)?;
        Some(Self { generation, index })
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct ResourceEntry<T> {
    generation: Generation,
    data: Option<T>,
}

impl<T> Default for ResourceEntry<T> {
    fn default() -> Self {
        Self {
            generation: Default::default(),
            data: None,
        }
    }
}

/// Fixed capacity array of resources addressed by generation-checked handles.
pub struct ResourceArray<T> {
    entries: Box<[ResourceEntry<T>]>,
    free_indices: Vec<u32>,
}

impl<T> ResourceArray<T> {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        for _i in 0..capacity {
            entries.push(Default::default());
        }
        Self {
            entries: entries.into_boxed_slice(),
            free_indices: (0..capacity as u32).rev().collect(),
        }
    }

    pub fn allocate(&mut self, data: T) -> Option<ResourceHandle> {
        let index = self.free_indices.pop()?;
        let e = &mut self.entries[index as usize];
        e.generation.advance();
        e.data = Some(data);
        Some(ResourceHandle {
            generation: e.generation,
            index,
        })
    }

    /// Returns `None` if the handle is stale or was already freed.
    pub fn free(&mut self, handle: ResourceHandle) -> Option<T> {
        let e = self.entries.get_mut(handle.index())?;
        if e.generation != handle.generation {
            return None;
        }
        let data = e.data.take()?;
        self.free_indices.push(handle.index);
        Some(data)
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&T> {
        self.entries.get(handle.index()).and_then(|e| {
            if e.generation == handle.generation {
                e.data.as_ref()
            } else {
                None
            }
        })
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut T> {
        self.entries.get_mut(handle.index()).and_then(|e| {
            if e.generation == handle.generation {
                e.data.as_mut()
            } else {
                None
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut array = ResourceArray::new(1);
        let first = array.allocate("a").unwrap();
        assert_eq!(array.free(first), Some("a"));
        let second = array.allocate("b").unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(array.get(first), None);
        assert_eq!(array.free(first), None);
        assert_eq!(array.get(second), Some(&"b"));
    }

    #[test]
    fn allocation_fails_when_full() {
        let mut array = ResourceArray::new(2);
        assert!(array.allocate(1).is_some());
        assert!(array.allocate(2).is_some());
        assert!(array.allocate(3).is_none());
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn raw_round_trip_preserves_generation() {
        let mut array = ResourceArray::new(4);
        let a = array.allocate(()).unwrap();
        array.free(a);
        let b = array.allocate(()).unwrap();
        assert_eq!(ResourceHandle::from_raw(b.into_raw()), Some(b));
        assert_eq!(ResourceHandle::from_raw(0), None);
    }

    #[test]
    fn handles_with_equal_raw_values_differ_by_uid() {
        let a = AccelHandle::new(7);
        let b = AccelHandle::new(7);
        assert_eq!(a.raw(), b.raw());
        assert_ne!(a, b);
    }
}
