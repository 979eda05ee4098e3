//! The generic RDMA verbs model shared between the driver and its users.
//!
//! Everything here is device-independent: wire encodings live in the driver
//! crate and are bridged through its translation tables.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("{0}")]
    Generic(String),
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionQueue(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectionDomain(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuePair(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRegion(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressHandle(pub Handle);

/// The transport service type of a QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpType {
    /// reliable connection
    RC,
    /// unreliable datagram
    UD,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QpInitAttr {
    pub send_cq: Option<CompletionQueue>,
    pub recv_cq: Option<CompletionQueue>,
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

/// One scatter-gather fragment: a registered memory range the device may
/// dereference directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Completion status of a work request.
///
/// `Invalid` is the total-mapping sentinel for wire codes this driver does
/// not recognize; it is never produced for any legitimate device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    RemAbortErr,
    FatalErr,
    RespTimeoutErr,
    GeneralErr,
    Invalid,
}

/// Opcode reported in a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

/// Opcode of a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    RdmaWrite,
    RdmaWriteWithImm,
    Send,
    SendWithImm,
    RdmaRead,
    AtomicCmpAndSwp,
    AtomicFetchAndAdd,
}

bitflags! {
    /// Flags of the completed WR.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Flags of the WR properties.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator. Relevant only if QP was created with
        /// sq_sig_all=0.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator. Valid only for Send and RDMA Write with immediate.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.  Valid only for Send and
        /// RDMA Write.  The L_Key will not be checked.
        const INLINE = 0b00001000;
    }

    /// Memory region access permissions.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_ATOMIC = 0b00001000;
    }
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub src_qp: u32,
    pub wc_flags: WcFlags,
    pub pkey_index: u16,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        WorkCompletion {
            wr_id: 0,
            status: WcStatus::Invalid,
            opcode: WcOpcode::Invalid,
            vendor_err: 0,
            byte_len: 0,
            imm_data: 0,
            src_qp: 0,
            wc_flags: WcFlags::empty(),
            pkey_index: 0,
        }
    }
}

/// States of the QP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Err,
}

bitflags! {
    /// Selects which [`QpAttr`] fields a modify/query call touches.
    #[derive(Serialize, Deserialize)]
    pub struct QpAttrMask: u32 {
        const STATE = 0b0000000001;
        const ACCESS_FLAGS = 0b0000000010;
        const PKEY_INDEX = 0b0000000100;
        const PORT = 0b0000001000;
        const QKEY = 0b0000010000;
        const PATH_MTU = 0b0000100000;
        const DEST_QPN = 0b0001000000;
        const RQ_PSN = 0b0010000000;
        const SQ_PSN = 0b0100000000;
        const TIMEOUT = 0b1000000000;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub path_mtu: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub qkey: u32,
    pub qp_access_flags: AccessFlags,
    pub pkey_index: u16,
    pub port_num: u8,
    pub timeout: u8,
}

impl Default for QpAttr {
    fn default() -> Self {
        QpAttr {
            qp_state: QpState::Reset,
            path_mtu: 0,
            rq_psn: 0,
            sq_psn: 0,
            dest_qp_num: 0,
            qkey: 0,
            qp_access_flags: AccessFlags::empty(),
            pkey_index: 0,
            port_num: 1,
            timeout: 0,
        }
    }
}

/// Addressing attributes for creating an address handle (UD endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub is_global: bool,
}
