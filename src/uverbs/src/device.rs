use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DriverConfig;
use crate::context::Context;
use crate::driver::Driver;
use crate::mr::MrIndex;
use crate::pd::PdId;

/// An emulated network device. Devices live for the whole daemon run; contexts borrow them.
#[derive(Debug)]
pub struct Device {
    name: String,
    driver: Arc<Driver>,
    mr_index: Arc<MrIndex>,
    max_queue_depth: u32,
    next_context: AtomicU32,
    next_pd: AtomicU64,
    next_qp_num: AtomicU32,
}

impl Device {
    pub fn new(name: &str, driver: Arc<Driver>, config: &DriverConfig) -> Self {
        Device {
            name: name.to_owned(),
            driver,
            mr_index: Arc::new(MrIndex::new(config.mr_capacity)),
            max_queue_depth: config.max_queue_depth,
            next_context: AtomicU32::new(1),
            next_pd: AtomicU64::new(1),
            next_qp_num: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    #[inline]
    pub fn mr_index(&self) -> &Arc<MrIndex> {
        &self.mr_index
    }

    #[inline]
    pub fn max_queue_depth(&self) -> u32 {
        self.max_queue_depth
    }

    pub fn open_context(&self) -> Context<'_> {
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        Context::new(self, id)
    }

    pub(crate) fn next_pd_id(&self) -> PdId {
        PdId(self.next_pd.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_qp_num(&self) -> u32 {
        self.next_qp_num.fetch_add(1, Ordering::Relaxed)
    }
}
