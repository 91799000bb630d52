use std::sync::Arc;

use fnv::FnvHashSet;

use uverbs_api::Handle;

use crate::log;
use crate::mr::MrIndex;
use crate::qp::QueuePair;
use crate::resource::ResourceTable;

/// Device-wide identity of a protection domain. Handles are only unique within one context,
/// MR ownership checks need something unique across the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdId(pub u64);

#[derive(Debug)]
pub struct ProtectionDomain {
    id: PdId,
    handle: Handle,
    pub(crate) qps: ResourceTable<QueuePair>,
    /// Keys issued under this PD in the device-wide index.
    pub(crate) mrs: FnvHashSet<u32>,
    mr_index: Arc<MrIndex>,
}

impl ProtectionDomain {
    pub(crate) fn new(id: PdId, handle: Handle, mr_index: Arc<MrIndex>) -> Self {
        ProtectionDomain {
            id,
            handle,
            qps: ResourceTable::default(),
            mrs: FnvHashSet::default(),
            mr_index,
        }
    }

    #[inline]
    pub fn id(&self) -> PdId {
        self.id
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn qp(&self, h: Handle) -> Option<&QueuePair> {
        self.qps.get(h).ok()
    }

    pub fn num_qps(&self) -> usize {
        self.qps.len()
    }

    pub fn num_mrs(&self) -> usize {
        self.mrs.len()
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // Detach QPs from the workers before their memory regions disappear.
        self.qps.clear();
        for key in self.mrs.drain() {
            if self.mr_index.remove(key).is_err() {
                log::warn!("PD {} lost track of lkey {:#x}", self.handle, key);
            }
        }
    }
}
