use std::fs::File;
use std::mem;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use zerocopy::AsBytes;

use ipc::proto::{
    AllocPdRsp, Command, CreateCqReq, CreateCqRsp, CreateQpReq, CreateQpRsp, ExperimentalReq,
    ExperimentalRsp, ModifyQpReq, OpenDeviceReq, RegMrReq, RegMrRsp, Request, ResourceReq,
    Response, RingDescriptor, RingTarget,
};
use ipc::{unix, SharedRegion, SpscRing};
use uverbs_api::{
    AccessFlags, AsHandle, Cqe, Handle, QpCapability, QpState, QpType, Status, Wqe,
};

use crate::Error;

/// Maps a ring the daemon created, from the descriptor that came with its metadata.
fn attach_ring<T: Copy + zerocopy::FromBytes>(
    desc: &RingDescriptor,
    fd: OwnedFd,
) -> Result<SpscRing<T>, Error> {
    let region = SharedRegion::open(&desc.name(), File::from(fd), desc.size as usize)?;
    Ok(SpscRing::attach(region)?)
}

/// An open device. Dropping it without [`Context::close`] closes the connection, and the daemon
/// releases everything created through it.
#[derive(Debug)]
pub struct Context {
    sock: UnixStream,
    device: String,
}

impl Context {
    /// Connects to the daemon listening at `socket_path` and binds the connection to `dev_name`.
    pub fn open<P: AsRef<Path>>(socket_path: P, dev_name: &str) -> Result<Self, Error> {
        let sock = UnixStream::connect(socket_path)?;
        let ctx = Context {
            sock,
            device: dev_name.to_owned(),
        };
        ctx.call(Command::OpenDevice, &OpenDeviceReq::new(dev_name)?)?;
        tracing::debug!("opened device {}", dev_name);
        Ok(ctx)
    }

    #[inline]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Releases every resource of this context and closes the connection.
    pub fn close(self) -> Result<(), Error> {
        self.call(Command::CloseDevice, &ResourceReq::default())?;
        Ok(())
    }

    fn call<P: AsBytes>(&self, cmd: Command, payload: &P) -> Result<Response, Error> {
        let (rsp, _) = self.call_with_fds(cmd, payload)?;
        Ok(rsp)
    }

    fn call_with_fds<P: AsBytes>(
        &self,
        cmd: Command,
        payload: &P,
    ) -> Result<(Response, Vec<OwnedFd>), Error> {
        let req = Request::new(cmd, payload)?;
        unix::send_frame(&self.sock, req.as_bytes())?;

        let mut buf = [0u8; mem::size_of::<Response>()];
        let fds = unix::recv_frame_and_fds(&self.sock, &mut buf)?;
        let (got, rsp) = Response::decode(&buf)?;
        if got != cmd {
            return Err(Error::UnexpectedResponse { expected: cmd, got });
        }
        match rsp.status() {
            Status::Success => {}
            status => return Err(Error::Status(status)),
        }
        if fds.len() != cmd.num_fds() {
            return Err(ipc::Error::FdCount {
                expected: cmd.num_fds(),
                received: fds.len(),
            }
            .into());
        }
        Ok((rsp, fds))
    }

    pub fn alloc_pd(&self) -> Result<ProtectionDomain, Error> {
        let rsp: AllocPdRsp = self.call(Command::AllocPd, &ResourceReq::default())?.payload()?;
        Ok(ProtectionDomain {
            handle: Handle(rsp.pd),
        })
    }

    /// Also destroys the QPs and memory regions created under `pd`.
    pub fn dealloc_pd(&self, pd: &ProtectionDomain) -> Result<(), Error> {
        let req = ResourceReq {
            handle: pd.handle.0,
            parent: 0,
        };
        self.call(Command::DeallocPd, &req)?;
        Ok(())
    }

    pub fn create_cq(&self, depth: u32) -> Result<CompletionQueue, Error> {
        let (rsp, fds) = self.call_with_fds(Command::CreateCq, &CreateCqReq { depth })?;
        let rsp: CreateCqRsp = rsp.payload()?;
        let fd = fds.into_iter().next().ok_or(ipc::Error::FdCount {
            expected: 1,
            received: 0,
        })?;
        Ok(CompletionQueue {
            handle: Handle(rsp.cq),
            ring: attach_ring(&rsp.ring, fd)?,
        })
    }

    /// Fails with [`Status::Busy`] while a QP still completes into `cq`. The local mapping stays
    /// valid until `cq` is dropped.
    pub fn destroy_cq(&self, cq: &CompletionQueue) -> Result<(), Error> {
        let req = ResourceReq {
            handle: cq.handle.0,
            parent: 0,
        };
        self.call(Command::DestroyCq, &req)?;
        Ok(())
    }

    pub fn create_qp(
        &self,
        pd: &ProtectionDomain,
        init: &QpInitAttr<'_>,
    ) -> Result<QueuePair, Error> {
        let req = CreateQpReq {
            pd: pd.handle.0,
            send_cq: init.send_cq.handle.0,
            recv_cq: init.recv_cq.handle.0,
            max_send_wr: init.cap.max_send_wr,
            max_recv_wr: init.cap.max_recv_wr,
            max_sge: init.cap.max_sge,
            qp_type: init.qp_type as i32,
            sq_sig_all: init.sq_sig_all as u32,
        };
        let (rsp, fds) = self.call_with_fds(Command::CreateQp, &req)?;
        let rsp: CreateQpRsp = rsp.payload()?;
        // receive queue first
        let mut fds = fds.into_iter();
        let (rq_fd, sq_fd) = match (fds.next(), fds.next()) {
            (Some(rq), Some(sq)) => (rq, sq),
            _ => {
                return Err(ipc::Error::FdCount {
                    expected: 2,
                    received: 0,
                }
                .into())
            }
        };
        Ok(QueuePair {
            handle: Handle(rsp.qp),
            pd: pd.handle,
            qp_num: rsp.qp_num,
            cap: init.cap,
            sq: attach_ring(&rsp.sq, sq_fd)?,
            rq: attach_ring(&rsp.rq, rq_fd)?,
        })
    }

    /// Records new attributes on the QP. The daemon does not check the state machine.
    pub fn modify_qp(
        &self,
        qp: &QueuePair,
        state: QpState,
        cur_state: QpState,
        dest_qp_num: u32,
        attr_mask: u32,
    ) -> Result<(), Error> {
        let req = ModifyQpReq {
            pd: qp.pd.0,
            qp: qp.handle.0,
            qp_state: state as u32,
            cur_qp_state: cur_state as u32,
            dest_qp_num,
            attr_mask,
        };
        self.call(Command::ModifyQp, &req)?;
        Ok(())
    }

    /// The daemon stops serving the QP before its rings are released. The local mapping stays
    /// valid until `qp` is dropped.
    pub fn destroy_qp(&self, qp: &QueuePair) -> Result<(), Error> {
        let req = ResourceReq {
            handle: qp.handle.0,
            parent: qp.pd.0,
        };
        self.call(Command::DestroyQp, &req)?;
        Ok(())
    }

    /// Registers `[addr, addr + length)` of this process' memory under `pd`.
    pub fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<MemoryRegion, Error> {
        let req = RegMrReq {
            pd: pd.handle.0,
            access: access.bits(),
            addr,
            length,
        };
        let rsp: RegMrRsp = self.call(Command::RegMr, &req)?.payload()?;
        Ok(MemoryRegion {
            lkey: rsp.lkey,
            rkey: rsp.rkey,
            addr,
            length,
        })
    }

    /// Registers the memory backing `buf`.
    pub fn reg_mr_slice(
        &self,
        pd: &ProtectionDomain,
        buf: &[u8],
        access: AccessFlags,
    ) -> Result<MemoryRegion, Error> {
        self.reg_mr(pd, buf.as_ptr() as u64, buf.len() as u64, access)
    }

    pub fn dereg_mr(&self, mr: &MemoryRegion) -> Result<(), Error> {
        let req = ResourceReq {
            handle: mr.lkey,
            parent: 0,
        };
        self.call(Command::DeregMr, &req)?;
        Ok(())
    }

    fn experimental(&self, req: ExperimentalReq) -> Result<u64, Error> {
        let rsp: ExperimentalRsp = self.call(Command::Experimental, &req)?.payload()?;
        Ok(rsp.value)
    }

    /// Reads the word at `offset` of a ring's backing memory, as seen by the daemon. `parent`
    /// is the owning PD for QP rings and ignored for CQs.
    pub fn experimental_read<H: AsHandle, P: AsHandle>(
        &self,
        target: RingTarget,
        handle: &H,
        parent: &P,
        offset: u64,
    ) -> Result<u64, Error> {
        self.experimental(ExperimentalReq {
            target: target as u32,
            write: 0,
            handle: handle.as_handle().0,
            parent: parent.as_handle().0,
            offset,
            value: 0,
        })
    }

    /// Writes `value` at `offset` of a ring's backing memory from the daemon side.
    pub fn experimental_write<H: AsHandle, P: AsHandle>(
        &self,
        target: RingTarget,
        handle: &H,
        parent: &P,
        offset: u64,
        value: u64,
    ) -> Result<(), Error> {
        self.experimental(ExperimentalReq {
            target: target as u32,
            write: 1,
            handle: handle.as_handle().0,
            parent: parent.as_handle().0,
            offset,
            value,
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionDomain {
    handle: Handle,
}

impl AsHandle for ProtectionDomain {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

/// The consumer end of a completion ring.
#[derive(Debug)]
pub struct CompletionQueue {
    handle: Handle,
    ring: SpscRing<Cqe>,
}

impl CompletionQueue {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.ring.depth()
    }

    /// Slots of the attached ring, including the one kept empty.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    /// Moves up to `wc.len()` completions into `wc` and returns how many were moved.
    #[inline]
    pub fn poll(&mut self, wc: &mut [Cqe]) -> usize {
        self.ring.pop_batch(wc)
    }

    /// Backing memory of the ring, as mapped in this process.
    pub fn region(&self) -> &SharedRegion {
        self.ring.region()
    }
}

impl AsHandle for CompletionQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr<'a> {
    pub send_cq: &'a CompletionQueue,
    pub recv_cq: &'a CompletionQueue,
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

/// The producer ends of a QP's send and receive rings.
#[derive(Debug)]
pub struct QueuePair {
    handle: Handle,
    pd: Handle,
    qp_num: u32,
    cap: QpCapability,
    sq: SpscRing<Wqe>,
    rq: SpscRing<Wqe>,
}

impl QueuePair {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn pd(&self) -> Handle {
        self.pd
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    #[inline]
    pub fn cap(&self) -> QpCapability {
        self.cap
    }

    /// Posts `wrs` in order. On a full ring the requests that fit stay posted and
    /// [`Error::QueueFull`] reports how many.
    pub fn post_send(&mut self, wrs: &[Wqe]) -> Result<(), Error> {
        let posted = self.sq.push_batch(wrs);
        if posted < wrs.len() {
            return Err(Error::QueueFull { posted });
        }
        Ok(())
    }

    /// Posts receive buffers. No transport consumes them yet.
    pub fn post_recv(&mut self, wrs: &[Wqe]) -> Result<(), Error> {
        let posted = self.rq.push_batch(wrs);
        if posted < wrs.len() {
            return Err(Error::QueueFull { posted });
        }
        Ok(())
    }

    /// Slots of the attached send and receive rings, including the one each keeps empty.
    pub fn capacity(&self) -> (u32, u32) {
        (self.sq.capacity(), self.rq.capacity())
    }

    pub fn send_region(&self) -> &SharedRegion {
        self.sq.region()
    }

    pub fn recv_region(&self) -> &SharedRegion {
        self.rq.region()
    }
}

impl AsHandle for QueuePair {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub lkey: u32,
    pub rkey: u32,
    pub addr: u64,
    pub length: u64,
}
