//! A ring guarded by a test-and-set spinlock in the shared header.
//!
//! The header starts with the same head, tail and capacity words as an
//! [`SpscRing`](crate::SpscRing) and appends the lock, so both kinds agree on where the indices
//! live. Any number of producers and consumers may share one instance. Only use it where a
//! single producer cannot be guaranteed.
use std::hint;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::CachePadded;
use zerocopy::FromBytes;

use crate::ring::{slots_offset, RingHeader};
use crate::shm::SharedRegion;
use crate::Error;

#[repr(C)]
struct LockedHeader {
    ring: RingHeader,
    lock: CachePadded<AtomicBool>,
}

struct SpinGuard<'a>(&'a AtomicBool);

impl<'a> SpinGuard<'a> {
    fn acquire(lock: &'a AtomicBool) -> Self {
        while lock.swap(true, Ordering::Acquire) {
            while lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinGuard(lock)
    }
}

impl<'a> Drop for SpinGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LockingRing<T> {
    region: SharedRegion,
    capacity: u32,
    _marker: PhantomData<T>,
}

impl<T: Copy + FromBytes> LockingRing<T> {
    pub fn create(name: &str, depth: u32) -> Result<Self, Error> {
        if depth == 0 || depth == u32::MAX {
            return Err(Error::RingLayout(format!("unsupported depth {}", depth)));
        }
        let capacity = depth + 1;
        let nbytes = slots_offset::<LockedHeader, T>() + capacity as usize * size_of::<T>();
        let ring = LockingRing {
            region: SharedRegion::create(name, nbytes)?,
            capacity,
            _marker: PhantomData,
        };
        let header = ring.header();
        header.lock.store(false, Ordering::Relaxed);
        header.ring.head.store(0, Ordering::Relaxed);
        header.ring.tail.store(0, Ordering::Relaxed);
        header.ring.capacity.store(capacity, Ordering::Release);
        Ok(ring)
    }

    pub fn attach(region: SharedRegion) -> Result<Self, Error> {
        if region.size() < size_of::<LockedHeader>() {
            return Err(Error::BufTooSmall {
                size: region.size(),
                required: size_of::<LockedHeader>(),
            });
        }
        let header = unsafe { &*(region.as_ptr() as *const LockedHeader) };
        let capacity = header.ring.capacity.load(Ordering::Acquire);
        let required = slots_offset::<LockedHeader, T>() + capacity as usize * size_of::<T>();
        if capacity < 2 || required > region.size() {
            return Err(Error::RingLayout(format!(
                "capacity {} does not fit in {} bytes",
                capacity,
                region.size()
            )));
        }
        Ok(LockingRing {
            region,
            capacity,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &LockedHeader {
        unsafe { &*(self.region.as_ptr() as *const LockedHeader) }
    }

    #[inline]
    fn slots(&self) -> *mut T {
        unsafe {
            self.region
                .as_ptr()
                .add(slots_offset::<LockedHeader, T>())
                .cast::<T>()
        }
    }

    /// Returns false iff the ring is full.
    pub fn push(&self, item: &T) -> bool {
        let header = self.header();
        let _guard = SpinGuard::acquire(&header.lock);
        let head = header.ring.head.load(Ordering::Relaxed);
        let tail = header.ring.tail.load(Ordering::Relaxed);
        if head >= self.capacity || tail >= self.capacity {
            return false;
        }
        let next = (tail + 1) % self.capacity;
        if next == head {
            return false;
        }
        unsafe { self.slots().add(tail as usize).write(*item) };
        header.ring.tail.store(next, Ordering::Relaxed);
        true
    }

    /// Returns `None` iff the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let header = self.header();
        let _guard = SpinGuard::acquire(&header.lock);
        let head = header.ring.head.load(Ordering::Relaxed);
        let tail = header.ring.tail.load(Ordering::Relaxed);
        if head == tail || head >= self.capacity || tail >= self.capacity {
            return None;
        }
        let item = unsafe { self.slots().add(head as usize).read() };
        header.ring.head.store((head + 1) % self.capacity, Ordering::Relaxed);
        Some(item)
    }

    pub fn len(&self) -> usize {
        let header = self.header();
        let _guard = SpinGuard::acquire(&header.lock);
        let head = header.ring.head.load(Ordering::Relaxed) % self.capacity;
        let tail = header.ring.tail.load(Ordering::Relaxed) % self.capacity;
        ((tail + self.capacity - head) % self.capacity) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}
