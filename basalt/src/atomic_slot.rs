use std::{
    fmt, ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

/// A single-word atomic slot holding an optional `Arc<T>`.
///
/// Readers clone the `Arc` without taking a lock. Writers exchange the pointer with a
/// single atomic swap and only get the previous value back once no reader can still be
/// between loading the pointer and taking its reference.
pub struct AtomicSlot<T> {
    ptr: AtomicPtr<T>,
    readers: AtomicUsize,
}

unsafe impl<T: Send + Sync> Send for AtomicSlot<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSlot<T> {}

impl<T> AtomicSlot<T> {
    pub fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn new(value: Option<Arc<T>>) -> Self {
        let slot = Self::empty();
        slot.ptr.store(into_raw(value), Ordering::SeqCst);
        slot
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let p = self.ptr.load(Ordering::SeqCst);
        let value = if p.is_null() {
            None
        } else {
            // the slot owns one strong count for p and cannot release it while readers is non-zero
            unsafe {
                Arc::increment_strong_count(p);
                Some(Arc::from_raw(p))
            }
        };
        self.readers.fetch_sub(1, Ordering::SeqCst);
        value
    }

    pub fn swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let old = self.ptr.swap(into_raw(value), Ordering::SeqCst);
        self.wait_for_readers();
        from_raw(old)
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.swap(None)
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::SeqCst).is_null()
    }

    /// Identity test without touching the reference count.
    pub fn is(&self, value: &Arc<T>) -> bool {
        ptr::eq(self.ptr.load(Ordering::SeqCst), Arc::as_ptr(value))
    }

    fn wait_for_readers(&self) {
        let mut spins = 0u32;
        while self.readers.load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }
}

fn into_raw<T>(value: Option<Arc<T>>) -> *mut T {
    value.map_or(ptr::null_mut(), |arc| Arc::into_raw(arc) as *mut T)
}

fn from_raw<T>(p: *mut T) -> Option<Arc<T>> {
    if p.is_null() {
        None
    } else {
        Some(unsafe { Arc::from_raw(p) })
    }
}

impl<T> Default for AtomicSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        drop(from_raw(*self.ptr.get_mut()));
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicSlot").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn swap_returns_previous_value() {
        let slot = AtomicSlot::empty();
        let a = Arc::new(1);
        let b = Arc::new(2);
        assert!(slot.swap(Some(Arc::clone(&a))).is_none());
        assert!(slot.is(&a));
        let old = slot.swap(Some(Arc::clone(&b))).unwrap();
        assert!(Arc::ptr_eq(&old, &a));
        assert!(slot.is(&b));
        assert!(!slot.is(&a));
    }

    #[test]
    fn load_shares_ownership() {
        let a = Arc::new(5);
        let slot = AtomicSlot::new(Some(Arc::clone(&a)));
        let loaded = slot.load().unwrap();
        assert_eq!(Arc::strong_count(&a), 3);
        drop(loaded);
        drop(slot);
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn concurrent_swaps_and_loads_keep_counts_balanced() {
        let values: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
        let slot = AtomicSlot::empty();
        (0..10_000usize).into_par_iter().for_each(|i| {
            if i % 3 == 0 {
                slot.swap(Some(Arc::clone(&values[i % values.len()])));
            } else if let Some(v) = slot.load() {
                assert!(*v < values.len());
            }
        });
        drop(slot.take());
        for v in &values {
            assert_eq!(Arc::strong_count(v), 1);
        }
    }
}
