//! The control channel is the entry of the control plane. It accepts client connections on a
//! Unix socket, binds each connection to at most one device context and turns fixed-size
//! request frames into resource operations on that context.
//!
//! One thread serves every connection. Requests are handled one at a time, in arrival order per
//! connection.
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fnv::FnvHashMap;
use mio::net::UnixListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use zerocopy::AsBytes;

use ipc::proto::{
    AllocPdRsp, Command, CreateCqReq, CreateCqRsp, CreateQpReq, CreateQpRsp, ExperimentalReq,
    ExperimentalRsp, ModifyQpReq, OpenDeviceReq, RegMrReq, RegMrRsp, Request, ResourceReq,
    Response, RingTarget,
};
use ipc::unix;
use uverbs_api::{AccessFlags, Handle, QpCapability, QpState, QpType, Status};

use crate::context::Context;
use crate::device::Device;
use crate::log;
use crate::qp::{QpAttr, QpInitAttr};
use crate::{describe, Error};

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

enum Disposition {
    Reply(Response),
    ReplyAndClose(Response),
    /// The handler already wrote its response, together with descriptors.
    Replied,
}

struct Connection<'dev> {
    context: Option<Context<'dev>>,
    stream: UnixStream,
}

pub struct ControlChannel<'dev> {
    poll: Poll,
    listener: UnixListener,
    path: PathBuf,
    devices: &'dev [Device],
    conns: FnvHashMap<Token, Connection<'dev>>,
    next_token: usize,
    request_timeout: Duration,
}

impl<'dev> ControlChannel<'dev> {
    /// Binds the listening socket at `path`, replacing a stale socket file left by an earlier
    /// run.
    pub fn bind<P: AsRef<Path>>(
        path: P,
        devices: &'dev [Device],
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut listener = UnixListener::bind(&path)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(ControlChannel {
            poll,
            listener,
            path,
            devices,
            conns: FnvHashMap::default(),
            next_token: LISTENER.0 + 1,
            request_timeout,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Serves connections until `exit_flag` is raised. The flag is checked at least every
    /// 100ms.
    pub fn mainloop(&mut self, exit_flag: &AtomicBool) -> Result<(), Error> {
        let mut events = Events::with_capacity(128);
        while !exit_flag.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    token => self.serve(token),
                }
            }
        }
        log::info!("exiting control loop, {} clients left", self.conns.len());
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.register(stream) {
                        log::warn!("failed to register client: {}", e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, stream: mio::net::UnixStream) -> Result<(), Error> {
        // Requests are read whole once readiness says a frame has started, bounded by the
        // timeouts.
        // SAFETY: the descriptor was just released by `into_raw_fd` and is owned by nobody else.
        let stream = unsafe { UnixStream::from_raw_fd(stream.into_raw_fd()) };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.request_timeout))?;
        stream.set_write_timeout(Some(self.request_timeout))?;

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(
            &mut SourceFd(&stream.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;
        log::info!("client {} connected", token.0);
        self.conns.insert(
            token,
            Connection {
                context: None,
                stream,
            },
        );
        Ok(())
    }

    /// Drains every complete request queued on the connection. Readiness is edge-triggered.
    fn serve(&mut self, token: Token) {
        let devices = self.devices;
        loop {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => return,
            };
            let keep = match unix::has_pending(&conn.stream) {
                Ok(false) => return,
                Ok(true) => conn.handle_request(devices),
                Err(e) => Err(e.into()),
            };
            match keep {
                Ok(true) => {}
                Ok(false) => {
                    self.close(token);
                    return;
                }
                Err(Error::Ipc(ipc::Error::Disconnected)) => {
                    self.close(token);
                    return;
                }
                Err(e) => {
                    log::warn!("client {}: {}", token.0, e);
                    self.close(token);
                    return;
                }
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(conn) = self.conns.remove(&token) {
            let fd = conn.stream.as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                log::warn!("deregister client {}: {}", token.0, e);
            }
            log::info!("client {} disconnected", token.0);
            // dropping the connection releases everything its context still owns
            drop(conn);
        }
    }
}

impl<'dev> Drop for ControlChannel<'dev> {
    fn drop(&mut self) {
        self.conns.clear();
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("remove {}: {}", self.path.display(), e);
        }
    }
}

fn invalid<T: std::fmt::Debug>(what: &str, raw: T) -> Error {
    Error::Invalid(format!("unknown {} {:?}", what, raw))
}

impl<'dev> Connection<'dev> {
    /// Reads and answers one request. Returns whether the connection stays open.
    fn handle_request(&mut self, devices: &'dev [Device]) -> Result<bool, Error> {
        let mut buf = [0u8; mem::size_of::<Request>()];
        unix::recv_frame(&self.stream, &mut buf)?;
        let (cmd, req) = Request::decode(&buf)?;
        log::trace!("request {:?}", cmd);

        let result = match cmd {
            Command::OpenDevice => self.open_device(devices, &req),
            Command::CloseDevice => self.close_device(),
            Command::AllocPd => self.alloc_pd(),
            Command::DeallocPd => self.dealloc_pd(&req),
            Command::CreateCq => self.create_cq(&req),
            Command::DestroyCq => self.destroy_cq(&req),
            Command::CreateQp => self.create_qp(&req),
            Command::ModifyQp => self.modify_qp(&req),
            Command::DestroyQp => self.destroy_qp(&req),
            Command::RegMr => self.reg_mr(&req),
            Command::DeregMr => self.dereg_mr(&req),
            Command::Experimental => self.experimental(&req),
        };
        let disposition = match result {
            Ok(d) => d,
            Err(e) if e.is_fatal() => return Err(e),
            Err(Error::NoContext) => {
                log::warn!("{:?} without an open device", cmd);
                Disposition::ReplyAndClose(Response::new(cmd, Status::NoContext))
            }
            Err(e) => {
                log::debug!("{:?} failed: {}", cmd, e);
                Disposition::Reply(Response::new(cmd, Status::from(&e)))
            }
        };

        match disposition {
            Disposition::Reply(rsp) => {
                unix::send_frame(&self.stream, rsp.as_bytes())?;
                Ok(true)
            }
            Disposition::ReplyAndClose(rsp) => {
                unix::send_frame(&self.stream, rsp.as_bytes())?;
                Ok(false)
            }
            Disposition::Replied => Ok(true),
        }
    }

    fn context(&mut self) -> Result<&mut Context<'dev>, Error> {
        self.context.as_mut().ok_or(Error::NoContext)
    }

    fn open_device(&mut self, devices: &'dev [Device], req: &Request) -> Result<Disposition, Error> {
        let name = req.payload::<OpenDeviceReq>()?.name();
        if let Some(ctx) = &self.context {
            log::warn!("{} is already bound, refusing {}", ctx.name(), name);
            return Err(Error::AlreadyOpen);
        }
        let device = devices
            .iter()
            .find(|dev| dev.name() == name)
            .ok_or(Error::NoDevice(name))?;
        let ctx = device.open_context();
        log::info!("opened context {}", ctx.name());
        self.context = Some(ctx);
        Ok(Disposition::Reply(Response::new(
            Command::OpenDevice,
            Status::Success,
        )))
    }

    fn close_device(&mut self) -> Result<Disposition, Error> {
        let ctx = self.context.take().ok_or(Error::NoContext)?;
        log::info!("closing context {}", ctx.name());
        drop(ctx);
        Ok(Disposition::ReplyAndClose(Response::new(
            Command::CloseDevice,
            Status::Success,
        )))
    }

    fn alloc_pd(&mut self) -> Result<Disposition, Error> {
        let pd = self.context()?.alloc_pd()?;
        let rsp = Response::with_payload(Command::AllocPd, &AllocPdRsp { pd: pd.0 })?;
        Ok(Disposition::Reply(rsp))
    }

    fn dealloc_pd(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ResourceReq = req.payload()?;
        self.context()?.dealloc_pd(Handle(r.handle))?;
        Ok(Disposition::Reply(Response::new(
            Command::DeallocPd,
            Status::Success,
        )))
    }

    fn create_cq(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: CreateCqReq = req.payload()?;
        let ctx = self.context.as_mut().ok_or(Error::NoContext)?;
        let cq = ctx.create_cq(r.depth)?;
        let (ring, fd) = describe(&cq.ring)?;
        let rsp = Response::with_payload(Command::CreateCq, &CreateCqRsp::new(cq.handle().0, ring))?;
        unix::send_frame_with_fds(&self.stream, rsp.as_bytes(), &[fd])?;
        Ok(Disposition::Replied)
    }

    fn destroy_cq(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ResourceReq = req.payload()?;
        self.context()?.destroy_cq(Handle(r.handle))?;
        Ok(Disposition::Reply(Response::new(
            Command::DestroyCq,
            Status::Success,
        )))
    }

    fn create_qp(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: CreateQpReq = req.payload()?;
        let init = QpInitAttr {
            send_cq: Handle(r.send_cq),
            recv_cq: Handle(r.recv_cq),
            cap: QpCapability {
                max_send_wr: r.max_send_wr,
                max_recv_wr: r.max_recv_wr,
                max_sge: r.max_sge,
            },
            qp_type: QpType::from_raw(r.qp_type).ok_or_else(|| invalid("QP type", r.qp_type))?,
            sq_sig_all: r.sq_sig_all != 0,
        };
        let ctx = self.context.as_mut().ok_or(Error::NoContext)?;
        let qp = ctx.create_qp(Handle(r.pd), init)?;
        let (sq, sq_fd) = describe(&qp.sq)?;
        let (rq, rq_fd) = describe(&qp.rq)?;
        let rsp = Response::with_payload(
            Command::CreateQp,
            &CreateQpRsp {
                qp: qp.handle().0,
                qp_num: qp.qp_num(),
                sq,
                rq,
            },
        )?;
        // receive queue first
        unix::send_frame_with_fds(&self.stream, rsp.as_bytes(), &[rq_fd, sq_fd])?;
        Ok(Disposition::Replied)
    }

    fn modify_qp(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ModifyQpReq = req.payload()?;
        let attr = QpAttr {
            state: QpState::from_raw(r.qp_state).ok_or_else(|| invalid("QP state", r.qp_state))?,
            cur_state: QpState::from_raw(r.cur_qp_state)
                .ok_or_else(|| invalid("QP state", r.cur_qp_state))?,
            dest_qp_num: r.dest_qp_num,
            attr_mask: r.attr_mask,
        };
        self.context()?
            .modify_qp(Handle(r.pd), Handle(r.qp), attr)?;
        Ok(Disposition::Reply(Response::new(
            Command::ModifyQp,
            Status::Success,
        )))
    }

    fn destroy_qp(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ResourceReq = req.payload()?;
        self.context()?
            .destroy_qp(Handle(r.parent), Handle(r.handle))?;
        Ok(Disposition::Reply(Response::new(
            Command::DestroyQp,
            Status::Success,
        )))
    }

    fn reg_mr(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: RegMrReq = req.payload()?;
        let access =
            AccessFlags::from_bits(r.access).ok_or_else(|| invalid("access flags", r.access))?;
        let key = self
            .context()?
            .reg_mr(Handle(r.pd), r.addr, r.length, access)?;
        let rsp = Response::with_payload(
            Command::RegMr,
            &RegMrRsp {
                lkey: key,
                rkey: key,
            },
        )?;
        Ok(Disposition::Reply(rsp))
    }

    fn dereg_mr(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ResourceReq = req.payload()?;
        self.context()?.dereg_mr(r.handle)?;
        Ok(Disposition::Reply(Response::new(
            Command::DeregMr,
            Status::Success,
        )))
    }

    /// Reads or writes one word of a ring's backing memory.
    fn experimental(&mut self, req: &Request) -> Result<Disposition, Error> {
        let r: ExperimentalReq = req.payload()?;
        let target = RingTarget::from_raw(r.target).ok_or_else(|| invalid("ring", r.target))?;
        let offset = usize::try_from(r.offset).map_err(|_| invalid("offset", r.offset))?;
        let value = self
            .context()?
            .with_ring_region(target, Handle(r.handle), Handle(r.parent), |region| {
                if r.write != 0 {
                    region.write_word(offset, r.value).map(|()| r.value)
                } else {
                    region.read_word(offset)
                }
            })?
            .map_err(|e| Error::Invalid(e.to_string()))?;
        let rsp = Response::with_payload(Command::Experimental, &ExperimentalRsp { value })?;
        Ok(Disposition::Reply(rsp))
    }
}
