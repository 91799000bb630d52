//! Control-plane frames.
//!
//! Every request is exactly `size_of::<Request>()` bytes and every response exactly
//! `size_of::<Response>()` bytes: a [`Header`] followed by a fixed payload area that holds one
//! of the command-specific payload structs below.
use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes};

use uverbs_api::{Status, MAX_DEV_NAME_LEN, MAX_RING_NAME_LEN};

use crate::Error;

/// `"UGDR"` in little endian.
pub const MAGIC: u32 = 0x55474452;

pub const REQUEST_PAYLOAD_LEN: usize = 64;
pub const RESPONSE_PAYLOAD_LEN: usize = 296;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    OpenDevice = 0,
    CloseDevice = 1,
    AllocPd = 2,
    DeallocPd = 3,
    CreateCq = 4,
    DestroyCq = 5,
    CreateQp = 6,
    ModifyQp = 7,
    DestroyQp = 8,
    RegMr = 9,
    DeregMr = 10,
    /// Raw word access to a ring's backing region, for test instrumentation.
    Experimental = 0x100,
}

impl Command {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use Command::*;
        Some(match raw {
            0 => OpenDevice,
            1 => CloseDevice,
            2 => AllocPd,
            3 => DeallocPd,
            4 => CreateCq,
            5 => DestroyCq,
            6 => CreateQp,
            7 => ModifyQp,
            8 => DestroyQp,
            9 => RegMr,
            10 => DeregMr,
            0x100 => Experimental,
            _ => return None,
        })
    }

    /// Number of descriptors attached to a successful response.
    pub fn num_fds(&self) -> usize {
        match self {
            Command::CreateCq => 1,
            Command::CreateQp => 2,
            _ => 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Header {
    pub magic: u32,
    pub command: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Request {
    pub header: Header,
    payload: [u8; REQUEST_PAYLOAD_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Response {
    pub header: Header,
    payload: [u8; RESPONSE_PAYLOAD_LEN],
}

fn check_header(header: &Header) -> Result<Command, Error> {
    if header.magic != MAGIC {
        tracing::debug!("rejecting frame with magic {:#010x}", header.magic);
        return Err(Error::BadMagic(header.magic));
    }
    Command::from_raw(header.command).ok_or_else(|| {
        tracing::debug!("rejecting unknown command {}", header.command);
        Error::UnknownCommand(header.command)
    })
}

impl Request {
    pub fn new<P: AsBytes>(command: Command, payload: &P) -> Result<Self, Error> {
        let mut req = Request::new_zeroed();
        req.header = Header {
            magic: MAGIC,
            command: command as u32,
            status: 0,
        };
        payload
            .write_to_prefix(&mut req.payload[..])
            .ok_or(Error::PayloadTooLarge)?;
        Ok(req)
    }

    /// Validates magic and command of a frame read off the wire.
    pub fn decode(bytes: &[u8]) -> Result<(Command, Self), Error> {
        let req = Request::read_from(bytes).ok_or(Error::PayloadTooLarge)?;
        let command = check_header(&req.header)?;
        Ok((command, req))
    }

    pub fn payload<P: FromBytes>(&self) -> Result<P, Error> {
        P::read_from_prefix(&self.payload[..]).ok_or(Error::PayloadTooLarge)
    }
}

impl Response {
    pub fn new(command: Command, status: Status) -> Self {
        let mut rsp = Response::new_zeroed();
        rsp.header = Header {
            magic: MAGIC,
            command: command as u32,
            status: status.into(),
        };
        rsp
    }

    pub fn with_payload<P: AsBytes>(command: Command, payload: &P) -> Result<Self, Error> {
        let mut rsp = Response::new(command, Status::Success);
        payload
            .write_to_prefix(&mut rsp.payload[..])
            .ok_or(Error::PayloadTooLarge)?;
        Ok(rsp)
    }

    pub fn decode(bytes: &[u8]) -> Result<(Command, Self), Error> {
        let rsp = Response::read_from(bytes).ok_or(Error::PayloadTooLarge)?;
        let command = check_header(&rsp.header)?;
        Ok((command, rsp))
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_raw(self.header.status)
    }

    pub fn payload<P: FromBytes>(&self) -> Result<P, Error> {
        P::read_from_prefix(&self.payload[..]).ok_or(Error::PayloadTooLarge)
    }
}

fn encode_name<const N: usize>(name: &str) -> Result<[u8; N], Error> {
    let bytes = name.as_bytes();
    // keep room for the trailing NUL
    if bytes.len() >= N || bytes.contains(&0) {
        return Err(Error::PayloadTooLarge);
    }
    let mut buf = [0u8; N];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn decode_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct OpenDeviceReq {
    pub dev_name: [u8; MAX_DEV_NAME_LEN],
}

impl OpenDeviceReq {
    pub fn new(dev_name: &str) -> Result<Self, Error> {
        Ok(OpenDeviceReq {
            dev_name: encode_name(dev_name)?,
        })
    }

    pub fn name(&self) -> String {
        decode_name(&self.dev_name)
    }
}

/// Names an existing resource. `parent` is the owning PD for QPs and unused otherwise; for
/// dereg-mr `handle` carries the lkey.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ResourceReq {
    pub handle: u32,
    pub parent: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct CreateCqReq {
    pub depth: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct CreateQpReq {
    pub pd: u32,
    pub send_cq: u32,
    pub recv_cq: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_sge: u32,
    pub qp_type: i32,
    pub sq_sig_all: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ModifyQpReq {
    pub pd: u32,
    pub qp: u32,
    pub qp_state: u32,
    pub cur_qp_state: u32,
    pub dest_qp_num: u32,
    pub attr_mask: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RegMrReq {
    pub pd: u32,
    pub access: u32,
    pub addr: u64,
    pub length: u64,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingTarget {
    Cq = 0,
    SendQueue = 1,
    RecvQueue = 2,
}

impl RingTarget {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RingTarget::Cq),
            1 => Some(RingTarget::SendQueue),
            2 => Some(RingTarget::RecvQueue),
            _ => None,
        }
    }
}

/// `write != 0` stores `value` at `offset`; otherwise the word at `offset` is returned.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ExperimentalReq {
    pub target: u32,
    pub write: u32,
    pub handle: u32,
    pub parent: u32,
    pub offset: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct RingDescriptor {
    pub size: u64,
    pub depth: u32,
    pub capacity: u32,
    name: [u8; MAX_RING_NAME_LEN],
}

impl RingDescriptor {
    pub fn new(name: &str, size: usize, depth: u32, capacity: u32) -> Result<Self, Error> {
        Ok(RingDescriptor {
            size: size as u64,
            depth,
            capacity,
            name: encode_name(name)?,
        })
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct AllocPdRsp {
    pub pd: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct CreateCqRsp {
    pub cq: u32,
    _pad: u32,
    pub ring: RingDescriptor,
}

impl CreateCqRsp {
    pub fn new(cq: u32, ring: RingDescriptor) -> Self {
        CreateCqRsp { cq, _pad: 0, ring }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct CreateQpRsp {
    pub qp: u32,
    pub qp_num: u32,
    pub sq: RingDescriptor,
    pub rq: RingDescriptor,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RegMrRsp {
    pub lkey: u32,
    pub rkey: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ExperimentalRsp {
    pub value: u64,
}

mod sa {
    use super::*;
    use static_assertions::const_assert;

    const_assert!(size_of::<Header>() == 12);
    const_assert!(size_of::<OpenDeviceReq>() <= REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<CreateQpReq>() <= REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<ModifyQpReq>() <= REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<RegMrReq>() <= REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<ExperimentalReq>() <= REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<CreateCqRsp>() <= RESPONSE_PAYLOAD_LEN);
    const_assert!(size_of::<CreateQpRsp>() <= RESPONSE_PAYLOAD_LEN);
    const_assert!(size_of::<Request>() == 12 + REQUEST_PAYLOAD_LEN);
    const_assert!(size_of::<Response>() == 12 + RESPONSE_PAYLOAD_LEN);
}
