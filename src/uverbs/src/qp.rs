use uverbs_api::{Handle, QpCapability, QpState, QpType, Wqe};

use crate::driver::Registration;
use crate::SharedRing;

/// Attributes recorded by modify-QP. The loopback transport has no connection setup, so they
/// are stored but no state transitions are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpAttr {
    pub state: QpState,
    pub cur_state: QpState,
    pub dest_qp_num: u32,
    pub attr_mask: u32,
}

impl Default for QpAttr {
    fn default() -> Self {
        QpAttr {
            state: QpState::Reset,
            cur_state: QpState::Reset,
            dest_qp_num: 0,
            attr_mask: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub send_cq: Handle,
    pub recv_cq: Handle,
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

#[derive(Debug)]
pub struct QueuePair {
    // Field order matters: the QP leaves the worker's polling set before its rings are released.
    _registration: Registration,
    pub(crate) sq: SharedRing<Wqe>,
    pub(crate) rq: SharedRing<Wqe>,
    handle: Handle,
    qp_num: u32,
    pub(crate) init: QpInitAttr,
    pub(crate) attr: QpAttr,
}

impl QueuePair {
    pub(crate) fn new(
        registration: Registration,
        handle: Handle,
        qp_num: u32,
        sq: SharedRing<Wqe>,
        rq: SharedRing<Wqe>,
        init: QpInitAttr,
    ) -> Self {
        QueuePair {
            _registration: registration,
            sq,
            rq,
            handle,
            qp_num,
            init,
            attr: QpAttr::default(),
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    #[inline]
    pub fn init_attr(&self) -> &QpInitAttr {
        &self.init
    }

    #[inline]
    pub fn attr(&self) -> &QpAttr {
        &self.attr
    }
}
