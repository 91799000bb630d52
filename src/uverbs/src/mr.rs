//! Device-wide memory region index.
//!
//! A key packs an 8-bit generation tag above a 24-bit slot index. Removing an entry bumps the
//! slot's tag before the slot is recycled, so a stale key never resolves to the region that
//! later reuses its slot.
use spin::Mutex;

use uverbs_api::AccessFlags;

use crate::pd::PdId;
use crate::resource::Error;

pub const INDEX_BITS: u32 = 24;
pub const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
pub const MAX_SLOTS: u32 = 1 << INDEX_BITS;
pub const DEFAULT_CAPACITY: u32 = 65536;

#[inline]
pub fn pack_key(tag: u8, index: u32) -> u32 {
    ((tag as u32) << INDEX_BITS) | (index & INDEX_MASK)
}

#[inline]
pub fn unpack_key(key: u32) -> (u8, u32) {
    ((key >> INDEX_BITS) as u8, key & INDEX_MASK)
}

/// A registered address range. Lookups hand out copies, so a concurrent deregistration can
/// never leave a reader holding a dangling entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub length: u64,
    pub access: AccessFlags,
    pub pd: PdId,
}

impl MemoryRegion {
    /// Whether `[addr, addr + len)` lies inside the region.
    #[inline]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match (addr.checked_add(len), self.addr.checked_add(self.length)) {
            (Some(end), Some(mr_end)) => addr >= self.addr && end <= mr_end,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    tag: u8,
    mr: Option<MemoryRegion>,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: u32,
    len: usize,
}

#[derive(Debug)]
pub struct MrIndex {
    inner: Mutex<Inner>,
}

impl MrIndex {
    /// `capacity` is clamped to what a 24-bit index can address.
    pub fn new(capacity: u32) -> Self {
        MrIndex {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                capacity: capacity.clamp(1, MAX_SLOTS),
                len: 0,
            }),
        }
    }

    pub fn insert(&self, mr: MemoryRegion) -> Result<u32, Error> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None if (inner.slots.len() as u32) < inner.capacity => {
                inner.slots.push(Slot::default());
                inner.slots.len() as u32 - 1
            }
            None => return Err(Error::Exhausted),
        };
        let slot = &mut inner.slots[index as usize];
        slot.mr = Some(mr);
        let key = pack_key(slot.tag, index);
        inner.len += 1;
        Ok(key)
    }

    pub fn remove(&self, key: u32) -> Result<MemoryRegion, Error> {
        let (tag, index) = unpack_key(key);
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(index as usize).ok_or(Error::NotFound)?;
        if slot.tag != tag {
            return Err(Error::NotFound);
        }
        let mr = slot.mr.take().ok_or(Error::NotFound)?;
        slot.tag = slot.tag.wrapping_add(1);
        inner.free.push(index);
        inner.len -= 1;
        Ok(mr)
    }

    pub fn get(&self, key: u32) -> Option<MemoryRegion> {
        let (tag, index) = unpack_key(key);
        let inner = self.inner.lock();
        inner
            .slots
            .get(index as usize)
            .filter(|slot| slot.tag == tag)
            .and_then(|slot| slot.mr)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
