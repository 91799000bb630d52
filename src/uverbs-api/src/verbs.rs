//! Work requests, completions and the flags that describe them.
//!
//! `Wqe` and `Cqe` are written by one process and read by another through a shared ring, so
//! their layout is fixed: C representation, one cache line each, no pointers that are ever
//! followed across address spaces.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;

/// A single scatter/gather element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Work-queue entry, posted by the client into a send or receive ring.
///
/// `remote_addr`/`rkey` are meaningful for RDMA and atomic opcodes, `imm_data` for the
/// `*WithImm` opcodes; unused fields are ignored by the transport.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default, FromBytes)]
pub struct Wqe {
    pub wr_id: u64,
    pub opcode: u32,
    pub flags: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub imm_data: u32,
    pub sge: Sge,
    pub qp_num: u32,
    _reserved: [u8; 12],
}

impl Wqe {
    pub fn new(wr_id: u64, opcode: WrOpcode, flags: SendFlags, sge: Sge) -> Self {
        Wqe {
            wr_id,
            opcode: opcode as u32,
            flags: flags.bits(),
            sge,
            ..Default::default()
        }
    }

    #[inline]
    pub fn opcode(&self) -> Option<WrOpcode> {
        WrOpcode::from_raw(self.opcode)
    }

    #[inline]
    pub fn send_flags(&self) -> SendFlags {
        SendFlags::from_bits_truncate(self.flags)
    }
}

/// Completion-queue entry, produced by a worker into a CQ ring.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default, FromBytes)]
pub struct Cqe {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: u32,
    pub byte_len: u32,
    pub qp_num: u32,
    pub imm_data: u32,
    pub src_qp: u32,
    pub wc_flags: u32,
    _reserved: [u8; 28],
}

impl Cqe {
    pub fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, qp_num: u32) -> Self {
        Cqe {
            wr_id,
            status: status as u32,
            opcode: opcode as u32,
            qp_num,
            ..Default::default()
        }
    }

    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from_raw(self.status)
    }

    #[inline]
    pub fn opcode(&self) -> Option<WcOpcode> {
        WcOpcode::from_raw(self.opcode)
    }

    #[inline]
    pub fn wc_flags(&self) -> WcFlags {
        WcFlags::from_bits_truncate(self.wc_flags)
    }
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::{align_of, size_of};

    const_assert_eq!(size_of::<Sge>(), 16);
    const_assert_eq!(size_of::<Wqe>(), 64);
    const_assert_eq!(align_of::<Wqe>(), 64);
    const_assert_eq!(size_of::<Cqe>(), 64);
    const_assert_eq!(align_of::<Cqe>(), 64);
}

/// Opcode of a posted work request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WrOpcode {
    Send = 0,
    SendWithImm = 1,
    RdmaWrite = 2,
    RdmaWriteWithImm = 3,
    RdmaRead = 4,
    AtomicCmpAndSwp = 5,
    AtomicFetchAndAdd = 6,
    Recv = 7,
    RecvRdmaWithImm = 8,
}

impl WrOpcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use WrOpcode::*;
        Some(match raw {
            0 => Send,
            1 => SendWithImm,
            2 => RdmaWrite,
            3 => RdmaWriteWithImm,
            4 => RdmaRead,
            5 => AtomicCmpAndSwp,
            6 => AtomicFetchAndAdd,
            7 => Recv,
            8 => RecvRdmaWithImm,
            _ => return None,
        })
    }

    /// Whether this opcode may be posted to a send queue.
    #[inline]
    pub fn is_send_queue_op(&self) -> bool {
        !matches!(self, WrOpcode::Recv | WrOpcode::RecvRdmaWithImm)
    }

    /// The opcode reported in the completion of a request with this opcode.
    pub fn completion_opcode(&self) -> WcOpcode {
        match self {
            WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::AtomicCmpAndSwp => WcOpcode::CompSwap,
            WrOpcode::AtomicFetchAndAdd => WcOpcode::FetchAdd,
            WrOpcode::Recv => WcOpcode::Recv,
            WrOpcode::RecvRdmaWithImm => WcOpcode::RecvRdmaWithImm,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcOpcode {
    Send = 0,
    RdmaWrite = 1,
    RdmaRead = 2,
    CompSwap = 3,
    FetchAdd = 4,
    Recv = 128,
    RecvRdmaWithImm = 129,
}

impl WcOpcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use WcOpcode::*;
        Some(match raw {
            0 => Send,
            1 => RdmaWrite,
            2 => RdmaRead,
            3 => CompSwap,
            4 => FetchAdd,
            128 => Recv,
            129 => RecvRdmaWithImm,
            _ => return None,
        })
    }
}

/// Completion status, numbered like `ibv_wc_status`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcStatus {
    Success = 0,
    LocLenErr,
    LocQpOpErr,
    LocEecOpErr,
    LocProtErr,
    WrFlushErr,
    MwBindErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    LocRddViolErr,
    RemInvRdReqErr,
    RemAbortErr,
    InvEecnErr,
    InvEecStateErr,
    FatalErr,
    RespTimeoutErr,
    GeneralErr,
}

impl WcStatus {
    const ALL: [WcStatus; 22] = [
        WcStatus::Success,
        WcStatus::LocLenErr,
        WcStatus::LocQpOpErr,
        WcStatus::LocEecOpErr,
        WcStatus::LocProtErr,
        WcStatus::WrFlushErr,
        WcStatus::MwBindErr,
        WcStatus::BadRespErr,
        WcStatus::LocAccessErr,
        WcStatus::RemInvReqErr,
        WcStatus::RemAccessErr,
        WcStatus::RemOpErr,
        WcStatus::RetryExcErr,
        WcStatus::RnrRetryExcErr,
        WcStatus::LocRddViolErr,
        WcStatus::RemInvRdReqErr,
        WcStatus::RemAbortErr,
        WcStatus::InvEecnErr,
        WcStatus::InvEecStateErr,
        WcStatus::FatalErr,
        WcStatus::RespTimeoutErr,
        WcStatus::GeneralErr,
    ];

    /// Unknown codes decode as `GeneralErr`.
    pub fn from_raw(raw: u32) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(WcStatus::GeneralErr)
    }
}

bitflags! {
    /// Flags of the WR properties.
    #[derive(Default, Serialize, Deserialize)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data.
        const INLINE = 0b00001000;
    }

    /// Flags of the completed WR.
    #[derive(Default, Serialize, Deserialize)]
    pub struct WcFlags: u32 {
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Access rights of a registered memory region.
    #[derive(Default, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_ATOMIC = 0b00001000;
    }
}

/// The type of QP used for communication.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpType {
    /// reliable connection
    Rc = 2,
    /// unreliable connection
    Uc = 3,
    /// unreliable datagram
    Ud = 4,
}

impl QpType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            2 => Some(QpType::Rc),
            3 => Some(QpType::Uc),
            4 => Some(QpType::Ud),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    Reset = 0,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Err,
}

impl QpState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use QpState::*;
        Some(match raw {
            0 => Reset,
            1 => Init,
            2 => Rtr,
            3 => Rts,
            4 => Sqd,
            5 => Sqe,
            6 => Err,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_sge: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_mapping() {
        assert_eq!(WrOpcode::from_raw(2), Some(WrOpcode::RdmaWrite));
        assert_eq!(WrOpcode::from_raw(9), None);
        assert!(!WrOpcode::Recv.is_send_queue_op());
        assert_eq!(
            WrOpcode::RdmaWriteWithImm.completion_opcode(),
            WcOpcode::RdmaWrite
        );
        assert_eq!(WcOpcode::from_raw(128), Some(WcOpcode::Recv));
    }

    #[test]
    fn status_numbering() {
        assert_eq!(WcStatus::LocProtErr as u32, 4);
        assert_eq!(WcStatus::LocAccessErr as u32, 8);
        assert_eq!(WcStatus::GeneralErr as u32, 21);
        assert_eq!(WcStatus::from_raw(8), WcStatus::LocAccessErr);
        assert_eq!(WcStatus::from_raw(1000), WcStatus::GeneralErr);
    }

    #[test]
    fn wqe_accessors() {
        let sge = Sge {
            addr: 0x1000,
            length: 64,
            lkey: 7,
        };
        let wqe = Wqe::new(42, WrOpcode::Send, SendFlags::SIGNALED, sge);
        assert_eq!(wqe.opcode(), Some(WrOpcode::Send));
        assert_eq!(wqe.send_flags(), SendFlags::SIGNALED);
        assert_eq!(wqe.sge, sge);

        let cqe = Cqe::new(42, WcStatus::LocAccessErr, WcOpcode::Send, 3);
        assert_eq!(cqe.status(), WcStatus::LocAccessErr);
        assert_eq!(cqe.opcode(), Some(WcOpcode::Send));
        assert_eq!(cqe.qp_num, 3);
    }
}
