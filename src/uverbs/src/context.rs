//! A device context and the resources created through it.
//!
//! Ownership is a strict tree: the context owns its PDs and CQs, each PD owns its QPs and the
//! keys of its memory regions. Dropping a context releases the whole subtree, with every QP
//! leaving its worker before its rings go away.
use std::sync::Arc;

use spin::Mutex;

use ipc::proto::RingTarget;
use ipc::{SharedRegion, SpscRing};
use uverbs_api::{AccessFlags, Handle};

use crate::cq::CompletionQueue;
use crate::device::Device;
use crate::driver::PollerItem;
use crate::log;
use crate::mr::MemoryRegion;
use crate::pd::ProtectionDomain;
use crate::qp::{QpAttr, QpInitAttr, QueuePair};
use crate::resource::{self, ResourceTable};
use crate::Error;

pub struct Context<'dev> {
    device: &'dev Device,
    id: u32,
    name: String,
    // Field order matters: PDs and their QPs are released before the CQs those QPs point at.
    pds: ResourceTable<ProtectionDomain>,
    cqs: ResourceTable<CompletionQueue>,
}

impl<'dev> std::fmt::Debug for Context<'dev> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("pds", &self.pds.len())
            .field("cqs", &self.cqs.len())
            .finish()
    }
}

fn detach_cqs(cqs: &mut ResourceTable<CompletionQueue>, init: &QpInitAttr) {
    for h in [init.send_cq, init.recv_cq] {
        if let Ok(cq) = cqs.get_mut(h) {
            cq.attached = cq.attached.saturating_sub(1);
        }
    }
}

impl<'dev> Context<'dev> {
    pub(crate) fn new(device: &'dev Device, id: u32) -> Self {
        Context {
            device,
            id,
            name: format!("{}-{}", device.name(), id),
            pds: ResourceTable::default(),
            cqs: ResourceTable::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &'dev Device {
        self.device
    }

    pub fn pd(&self, h: Handle) -> Result<&ProtectionDomain, Error> {
        Ok(self.pds.get(h)?)
    }

    pub fn cq(&self, h: Handle) -> Result<&CompletionQueue, Error> {
        Ok(self.cqs.get(h)?)
    }

    pub fn num_pds(&self) -> usize {
        self.pds.len()
    }

    pub fn num_cqs(&self) -> usize {
        self.cqs.len()
    }

    fn check_depth(&self, what: &str, depth: u32) -> Result<(), Error> {
        if depth == 0 || depth > self.device.max_queue_depth() {
            return Err(Error::Invalid(format!(
                "{} depth {} not in 1..={}",
                what,
                depth,
                self.device.max_queue_depth()
            )));
        }
        Ok(())
    }

    pub fn alloc_pd(&mut self) -> Result<Handle, Error> {
        let id = self.device.next_pd_id();
        let mr_index = Arc::clone(self.device.mr_index());
        let h = self
            .pds
            .allocate_with(|h| Ok::<_, Error>(ProtectionDomain::new(id, h, mr_index)))?;
        log::debug!("{}: allocated PD {}", self.name, h);
        Ok(h)
    }

    /// Releases the PD together with its QPs and memory regions.
    pub fn dealloc_pd(&mut self, h: Handle) -> Result<(), Error> {
        let pd = self.pds.release(h)?;
        for qp in pd.qps.values() {
            detach_cqs(&mut self.cqs, qp.init_attr());
        }
        log::debug!(
            "{}: deallocating PD {} ({} QPs, {} MRs)",
            self.name,
            h,
            pd.num_qps(),
            pd.num_mrs()
        );
        drop(pd);
        Ok(())
    }

    pub fn create_cq(&mut self, depth: u32) -> Result<&CompletionQueue, Error> {
        self.check_depth("CQ", depth)?;
        let name = &self.name;
        let h = self.cqs.allocate_with(|h| {
            let ring = SpscRing::create(&format!("{}_cq_{}", name, h), depth)?;
            Ok::<_, Error>(CompletionQueue::new(h, Arc::new(Mutex::new(ring))))
        })?;
        log::debug!("{}: created CQ {} with depth {}", self.name, h, depth);
        Ok(self.cqs.get(h)?)
    }

    /// Fails with [`Error::CqBusy`] while a QP still references the CQ.
    pub fn destroy_cq(&mut self, h: Handle) -> Result<(), Error> {
        if self.cqs.get(h)?.attached > 0 {
            return Err(Error::CqBusy(h));
        }
        self.cqs.release(h)?;
        log::debug!("{}: destroyed CQ {}", self.name, h);
        Ok(())
    }

    pub fn create_qp(&mut self, pd: Handle, init: QpInitAttr) -> Result<&QueuePair, Error> {
        if init.cap.max_sge > 1 {
            return Err(Error::Invalid(format!(
                "max_sge {} exceeds the single inline SGE",
                init.cap.max_sge
            )));
        }
        self.check_depth("SQ", init.cap.max_send_wr)?;
        self.check_depth("RQ", init.cap.max_recv_wr)?;
        let send_cq = Arc::clone(&self.cqs.get(init.send_cq)?.ring);
        self.cqs.get(init.recv_cq)?;

        let device = self.device;
        let name = &self.name;
        let pd_obj = self.pds.get_mut(pd)?;
        let pd_id = pd_obj.id();
        let qp = pd_obj.qps.allocate_with(|h| {
            let sq = SpscRing::create(&format!("{}_pd{}_sq_{}", name, pd, h), init.cap.max_send_wr)?;
            let rq = SpscRing::create(&format!("{}_pd{}_rq_{}", name, pd, h), init.cap.max_recv_wr)?;
            let sq = Arc::new(Mutex::new(sq));
            let rq = Arc::new(Mutex::new(rq));
            let qp_num = device.next_qp_num();
            let registration = device.driver().post_create_qp(PollerItem {
                qp_num,
                pd: pd_id,
                sq: Arc::clone(&sq),
                send_cq,
                mr_index: Arc::clone(device.mr_index()),
            });
            Ok::<_, Error>(QueuePair::new(registration, h, qp_num, sq, rq, init))
        })?;

        for h in [init.send_cq, init.recv_cq] {
            self.cqs.get_mut(h)?.attached += 1;
        }
        let qp = self.pds.get(pd)?.qps.get(qp)?;
        log::debug!(
            "{}: created QP {} (qpn {}) under PD {}",
            self.name,
            qp.handle(),
            qp.qp_num(),
            pd
        );
        Ok(qp)
    }

    pub fn modify_qp(&mut self, pd: Handle, qp: Handle, attr: QpAttr) -> Result<(), Error> {
        let qp = self.pds.get_mut(pd)?.qps.get_mut(qp)?;
        log::debug!(
            "{}: QP {} state {:?} -> {:?}",
            self.name,
            qp.handle(),
            qp.attr.state,
            attr.state
        );
        qp.attr = attr;
        Ok(())
    }

    /// The QP leaves its worker before its rings are released.
    pub fn destroy_qp(&mut self, pd: Handle, qp: Handle) -> Result<(), Error> {
        let qp = self.pds.get_mut(pd)?.qps.release(qp)?;
        detach_cqs(&mut self.cqs, qp.init_attr());
        log::debug!("{}: destroyed QP {} under PD {}", self.name, qp.handle(), pd);
        drop(qp);
        Ok(())
    }

    /// Registers `[addr, addr + length)` and returns its key, used as both lkey and rkey.
    pub fn reg_mr(
        &mut self,
        pd: Handle,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<u32, Error> {
        if length == 0 || addr.checked_add(length).is_none() {
            return Err(Error::Invalid(format!(
                "bad memory range {:#x}+{:#x}",
                addr, length
            )));
        }
        let pd_obj = self.pds.get_mut(pd)?;
        let key = self.device.mr_index().insert(MemoryRegion {
            addr,
            length,
            access,
            pd: pd_obj.id(),
        })?;
        pd_obj.mrs.insert(key);
        log::debug!("{}: registered MR {:#x} under PD {}", self.name, key, pd);
        Ok(key)
    }

    /// Only keys issued under one of this context's PDs can be deregistered through it.
    pub fn dereg_mr(&mut self, lkey: u32) -> Result<(), Error> {
        let mr = self
            .device
            .mr_index()
            .get(lkey)
            .ok_or(resource::Error::NotFound)?;
        let pd = self
            .pds
            .values_mut()
            .find(|pd| pd.id() == mr.pd)
            .ok_or(resource::Error::NotFound)?;
        if !pd.mrs.remove(&lkey) {
            return Err(resource::Error::NotFound.into());
        }
        self.device.mr_index().remove(lkey)?;
        log::debug!("{}: deregistered MR {:#x}", self.name, lkey);
        Ok(())
    }

    /// Runs `f` on the backing region of a CQ ring, or of a QP's send or receive ring.
    pub fn with_ring_region<R, F>(
        &self,
        target: RingTarget,
        handle: Handle,
        parent: Handle,
        f: F,
    ) -> Result<R, Error>
    where
        F: FnOnce(&SharedRegion) -> R,
    {
        Ok(match target {
            RingTarget::Cq => f(self.cqs.get(handle)?.ring.lock().region()),
            RingTarget::SendQueue => f(self.pds.get(parent)?.qps.get(handle)?.sq.lock().region()),
            RingTarget::RecvQueue => f(self.pds.get(parent)?.qps.get(handle)?.rq.lock().region()),
        })
    }
}

impl<'dev> Drop for Context<'dev> {
    fn drop(&mut self) {
        log::debug!(
            "{}: releasing {} PDs and {} CQs",
            self.name,
            self.pds.len(),
            self.cqs.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uverbs_api::{QpCapability, QpType};

    use crate::config::Config;
    use crate::driver::Driver;

    fn device() -> Device {
        let config = Config::default();
        let driver = Arc::new(Driver::new(&config.driver).unwrap());
        Device::new("eth0", driver, &config.driver)
    }

    fn init_attr(cq: Handle) -> QpInitAttr {
        QpInitAttr {
            send_cq: cq,
            recv_cq: cq,
            cap: QpCapability {
                max_send_wr: 16,
                max_recv_wr: 16,
                max_sge: 1,
            },
            qp_type: QpType::Rc,
            sq_sig_all: true,
        }
    }

    #[test]
    fn drop_releases_subtree() {
        let dev = device();
        {
            let mut ctx = dev.open_context();
            let pd = ctx.alloc_pd().unwrap();
            let cq = ctx.create_cq(16).unwrap().handle();
            ctx.create_qp(pd, init_attr(cq)).unwrap();
            ctx.reg_mr(pd, 0x1000, 4096, AccessFlags::LOCAL_WRITE)
                .unwrap();
            assert_eq!(dev.mr_index().len(), 1);
            assert_eq!(ctx.cq(cq).unwrap().attached(), 2);
            assert_eq!(ctx.pd(pd).unwrap().num_qps(), 1);
        }
        assert!(dev.mr_index().is_empty());
    }

    #[test]
    fn cq_busy_until_detached() {
        let dev = device();
        let mut ctx = dev.open_context();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(16).unwrap().handle();
        let qp = ctx.create_qp(pd, init_attr(cq)).unwrap().handle();

        assert!(matches!(ctx.destroy_cq(cq), Err(Error::CqBusy(h)) if h == cq));
        // a failed destroy leaves the QP alone
        assert!(ctx.destroy_qp(Handle(7), qp).is_err());
        assert!(ctx.pd(pd).unwrap().qp(qp).is_some());

        ctx.dealloc_pd(pd).unwrap();
        assert_eq!(ctx.cq(cq).unwrap().attached(), 0);
        ctx.destroy_cq(cq).unwrap();
        assert_eq!(ctx.num_cqs(), 0);
    }

    #[test]
    fn dereg_is_scoped_to_context() {
        let dev = device();
        let mut a = dev.open_context();
        let mut b = dev.open_context();
        assert_ne!(a.name(), b.name());
        let pd = a.alloc_pd().unwrap();
        b.alloc_pd().unwrap();

        let key = a.reg_mr(pd, 0x1000, 64, AccessFlags::empty()).unwrap();
        assert!(matches!(
            b.dereg_mr(key),
            Err(Error::Resource(resource::Error::NotFound))
        ));
        a.dereg_mr(key).unwrap();
        assert!(a.dereg_mr(key).is_err());
        assert_eq!(a.pd(pd).unwrap().num_mrs(), 0);
    }

    #[test]
    fn modify_is_recorded() {
        let dev = device();
        let mut ctx = dev.open_context();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(16).unwrap().handle();
        let qp = ctx.create_qp(pd, init_attr(cq)).unwrap().handle();
        let attr = QpAttr {
            state: uverbs_api::QpState::Rts,
            cur_state: uverbs_api::QpState::Rtr,
            dest_qp_num: 9,
            attr_mask: 1,
        };
        ctx.modify_qp(pd, qp, attr).unwrap();
        assert_eq!(*ctx.pd(pd).unwrap().qp(qp).unwrap().attr(), attr);
    }
}
