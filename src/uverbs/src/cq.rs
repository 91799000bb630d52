use uverbs_api::{Cqe, Handle};

use crate::SharedRing;

#[derive(Debug)]
pub struct CompletionQueue {
    handle: Handle,
    pub(crate) ring: SharedRing<Cqe>,
    /// Number of QP sides (send or receive) that reference this CQ.
    pub(crate) attached: u32,
}

impl CompletionQueue {
    pub(crate) fn new(handle: Handle, ring: SharedRing<Cqe>) -> Self {
        CompletionQueue {
            handle,
            ring,
            attached: 0,
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn attached(&self) -> u32 {
        self.attached
    }

    pub fn depth(&self) -> u32 {
        self.ring.lock().depth()
    }
}
