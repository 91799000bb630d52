//! Transports that move work from send queues to completion queues.
//!
//! The set of transports is closed and picked once at startup from the configuration.
use std::sync::Arc;

use uverbs_api::{Cqe, Wqe};

use crate::config::{DriverConfig, DriverKind};
use crate::mr::MrIndex;
use crate::pd::PdId;
use crate::{Error, SharedRing};

pub mod loopback;

pub use loopback::LoopbackDriver;

/// What a worker needs to serve one QP.
#[derive(Debug, Clone)]
pub struct PollerItem {
    pub qp_num: u32,
    pub pd: PdId,
    pub sq: SharedRing<Wqe>,
    pub send_cq: SharedRing<Cqe>,
    pub mr_index: Arc<MrIndex>,
}

#[derive(Debug)]
pub enum Driver {
    Loopback(LoopbackDriver),
}

impl Driver {
    pub fn new(config: &DriverConfig) -> Result<Self, Error> {
        match config.kind {
            DriverKind::Loopback => Ok(Driver::Loopback(LoopbackDriver::new(config.workers)?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Driver::Loopback(_) => "loopback",
        }
    }

    /// Hands a freshly created QP to the data plane. The QP stays polled until the returned
    /// registration is dropped.
    pub fn post_create_qp(self: &Arc<Self>, item: PollerItem) -> Registration {
        let qp_num = item.qp_num;
        match self.as_ref() {
            Driver::Loopback(lo) => lo.add(item),
        }
        Registration {
            driver: Arc::clone(self),
            qp_num,
        }
    }

    /// Removes a QP from every worker's polling set.
    pub fn pre_destroy_qp(&self, qp_num: u32) {
        match self {
            Driver::Loopback(lo) => lo.remove(qp_num),
        }
    }

    /// Stops and joins the data-plane threads. Idempotent.
    pub fn shutdown(&self) {
        match self {
            Driver::Loopback(lo) => lo.shutdown(),
        }
    }
}

/// Keeps a QP in the polling set of the driver that accepted it.
#[derive(Debug)]
pub struct Registration {
    driver: Arc<Driver>,
    qp_num: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.driver.pre_destroy_qp(self.qp_num);
    }
}
