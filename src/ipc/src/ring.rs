//! Single-producer single-consumer ring over a [`SharedRegion`].
//!
//! Layout: a [`RingHeader`] at the start of the region followed by `capacity` slots of `T`.
//! One slot is always left empty, so `capacity = depth + 1`; `head == tail` means empty and
//! `(tail + 1) % capacity == head` means full.
//!
//! Only the consumer stores `head` and only the producer stores `tail`. Stores are `Release`
//! and loads of the peer's index are `Acquire`, so slot contents are visible before the index
//! that exposes them. Each side caches the peer's index in a shadow copy and reloads it only
//! when the cached value says the ring is full (producer) or empty (consumer).
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::CachePadded;
use zerocopy::FromBytes;

use crate::shm::SharedRegion;
use crate::Error;

#[repr(C)]
pub(crate) struct RingHeader {
    pub(crate) head: CachePadded<AtomicU32>,
    pub(crate) tail: CachePadded<AtomicU32>,
    pub(crate) capacity: CachePadded<AtomicU32>,
}

#[inline]
pub(crate) const fn slots_offset<H, T>() -> usize {
    let a = align_of::<T>();
    (size_of::<H>() + a - 1) / a * a
}

/// Number of bytes a ring of `depth` usable slots occupies before page rounding.
pub fn ring_bytes<T>(depth: u32) -> usize {
    slots_offset::<RingHeader, T>() + (depth as usize + 1) * size_of::<T>()
}

pub struct SpscRing<T> {
    region: SharedRegion,
    capacity: u32,
    // consumer side
    local_head: u32,
    shadow_tail: u32,
    // producer side
    local_tail: u32,
    shadow_head: u32,
    _marker: PhantomData<T>,
}

impl<T> std::fmt::Debug for SpscRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("region", &self.region)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Copy + FromBytes> SpscRing<T> {
    /// Allocates a new region named `name` holding `depth` usable slots.
    pub fn create(name: &str, depth: u32) -> Result<Self, Error> {
        if depth == 0 || depth == u32::MAX {
            return Err(Error::RingLayout(format!("unsupported depth {}", depth)));
        }
        let capacity = depth + 1;
        let region = SharedRegion::create(name, ring_bytes::<T>(depth))?;
        let ring = SpscRing {
            region,
            capacity,
            local_head: 0,
            shadow_tail: 0,
            local_tail: 0,
            shadow_head: 0,
            _marker: PhantomData,
        };
        let header = ring.header();
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.capacity.store(capacity, Ordering::Release);
        Ok(ring)
    }

    /// Wraps a region that already holds an initialized ring, typically one received from the
    /// allocating process. Both local cursors are synchronized with the shared indices.
    pub fn attach(region: SharedRegion) -> Result<Self, Error> {
        if region.size() < size_of::<RingHeader>() {
            return Err(Error::BufTooSmall {
                size: region.size(),
                required: size_of::<RingHeader>(),
            });
        }
        // SAFETY: the region is page aligned and large enough for the header.
        let header = unsafe { &*(region.as_ptr() as *const RingHeader) };
        let capacity = header.capacity.load(Ordering::Acquire);
        let required = slots_offset::<RingHeader, T>() + capacity as usize * size_of::<T>();
        if capacity < 2 || required > region.size() {
            return Err(Error::RingLayout(format!(
                "capacity {} does not fit in {} bytes",
                capacity,
                region.size()
            )));
        }
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if head >= capacity || tail >= capacity {
            return Err(Error::RingLayout(format!(
                "indices head={} tail={} exceed capacity {}",
                head, tail, capacity
            )));
        }
        Ok(SpscRing {
            region,
            capacity,
            local_head: head,
            shadow_tail: tail,
            local_tail: tail,
            shadow_head: head,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: checked at construction that the header lies inside the mapping.
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    #[inline]
    fn slots(&self) -> *mut T {
        // SAFETY: the slot array starts inside the mapping, aligned for `T`.
        unsafe {
            self.region
                .as_ptr()
                .add(slots_offset::<RingHeader, T>())
                .cast::<T>()
        }
    }

    /// Loads the peer's index, refusing values a well-behaved peer could never publish.
    #[inline]
    fn load_peer(&self, index: &AtomicU32) -> Option<u32> {
        let v = index.load(Ordering::Acquire);
        (v < self.capacity).then_some(v)
    }

    #[inline]
    fn free_slots(&self) -> u32 {
        if self.shadow_head <= self.local_tail {
            self.capacity - 1 - (self.local_tail - self.shadow_head)
        } else {
            self.shadow_head - self.local_tail - 1
        }
    }

    #[inline]
    fn used_slots(&self) -> u32 {
        if self.shadow_tail >= self.local_head {
            self.shadow_tail - self.local_head
        } else {
            self.shadow_tail + self.capacity - self.local_head
        }
    }

    /// Returns false iff the ring is full.
    pub fn push(&mut self, item: &T) -> bool {
        let next = (self.local_tail + 1) % self.capacity;
        if next == self.shadow_head {
            match self.load_peer(&self.header().head) {
                Some(head) => self.shadow_head = head,
                None => return false,
            }
            if next == self.shadow_head {
                return false;
            }
        }
        // SAFETY: `local_tail < capacity` and the slot is owned by the producer until published.
        unsafe { self.slots().add(self.local_tail as usize).write(*item) };
        self.local_tail = next;
        self.header().tail.store(next, Ordering::Release);
        true
    }

    /// Returns `None` iff the ring is empty.
    pub fn pop(&mut self) -> Option<T> {
        if self.local_head == self.shadow_tail {
            self.shadow_tail = self.load_peer(&self.header().tail)?;
            if self.local_head == self.shadow_tail {
                return None;
            }
        }
        // SAFETY: the slot was published by the producer and `T: FromBytes` accepts any bits.
        let item = unsafe { self.slots().add(self.local_head as usize).read() };
        self.local_head = (self.local_head + 1) % self.capacity;
        self.header().head.store(self.local_head, Ordering::Release);
        Some(item)
    }

    /// Pushes as many of `items` as fit and returns how many were pushed.
    pub fn push_batch(&mut self, items: &[T]) -> usize {
        let want = items.len().min(self.capacity as usize - 1) as u32;
        if want == 0 {
            return 0;
        }
        if self.free_slots() < want {
            match self.load_peer(&self.header().head) {
                Some(head) => self.shadow_head = head,
                None => return 0,
            }
        }
        let n = want.min(self.free_slots());
        if n == 0 {
            return 0;
        }

        let first = n.min(self.capacity - self.local_tail) as usize;
        let rest = n as usize - first;
        // SAFETY: both chunks lie inside the slot array and are free for the producer.
        unsafe {
            ptr::copy_nonoverlapping(
                items.as_ptr(),
                self.slots().add(self.local_tail as usize),
                first,
            );
            if rest > 0 {
                ptr::copy_nonoverlapping(items.as_ptr().add(first), self.slots(), rest);
            }
        }
        self.local_tail = (self.local_tail + n) % self.capacity;
        self.header().tail.store(self.local_tail, Ordering::Release);
        n as usize
    }

    /// Pops up to `out.len()` items into `out` and returns how many were popped.
    pub fn pop_batch(&mut self, out: &mut [T]) -> usize {
        let want = out.len().min(self.capacity as usize - 1) as u32;
        if want == 0 {
            return 0;
        }
        if self.used_slots() < want {
            match self.load_peer(&self.header().tail) {
                Some(tail) => self.shadow_tail = tail,
                None => return 0,
            }
        }
        let n = want.min(self.used_slots());
        if n == 0 {
            return 0;
        }

        let first = n.min(self.capacity - self.local_head) as usize;
        let rest = n as usize - first;
        // SAFETY: both chunks were published by the producer; `T: FromBytes` accepts any bits.
        unsafe {
            ptr::copy_nonoverlapping(
                self.slots().add(self.local_head as usize),
                out.as_mut_ptr(),
                first,
            );
            if rest > 0 {
                ptr::copy_nonoverlapping(self.slots(), out.as_mut_ptr().add(first), rest);
            }
        }
        self.local_head = (self.local_head + n) % self.capacity;
        self.header().head.store(self.local_head, Ordering::Release);
        n as usize
    }

    /// Slots the producer can fill right now. Reloads the consumer's index; a corrupt index
    /// reads as a full ring.
    pub fn free_space(&mut self) -> usize {
        match self.load_peer(&self.header().head) {
            Some(head) => self.shadow_head = head,
            None => return 0,
        }
        self.free_slots() as usize
    }

    /// Number of slots including the one kept empty.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of usable slots.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.capacity - 1
    }

    /// Element count as seen through the shared indices at this instant.
    pub fn len(&self) -> usize {
        let head = self.header().head.load(Ordering::Acquire) % self.capacity;
        let tail = self.header().tail.load(Ordering::Acquire) % self.capacity;
        ((tail + self.capacity - head) % self.capacity) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}
