//! Translate wire codes from and to the generic verbs model.
//!
//! Every function here is total. A wire code this driver does not know maps
//! to the `Invalid` member of the target enum, and a generic code with no
//! wire encoding maps to [`wire::WIRE_INVALID`]; neither sentinel collides
//! with a legitimate code's bit pattern.
use virtio_rdma_api::{SendFlags, WcFlags, WcOpcode, WcStatus, WrOpcode};

use crate::wire;

pub fn wc_status(status: u8) -> WcStatus {
    match status {
        wire::VIRTIO_IB_WC_SUCCESS => WcStatus::Success,
        wire::VIRTIO_IB_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
        wire::VIRTIO_IB_WC_LOC_QP_OP_ERR => WcStatus::LocQpOpErr,
        wire::VIRTIO_IB_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
        wire::VIRTIO_IB_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
        wire::VIRTIO_IB_WC_BAD_RESP_ERR => WcStatus::BadRespErr,
        wire::VIRTIO_IB_WC_LOC_ACCESS_ERR => WcStatus::LocAccessErr,
        wire::VIRTIO_IB_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
        wire::VIRTIO_IB_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
        wire::VIRTIO_IB_WC_REM_OP_ERR => WcStatus::RemOpErr,
        wire::VIRTIO_IB_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
        wire::VIRTIO_IB_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
        wire::VIRTIO_IB_WC_REM_ABORT_ERR => WcStatus::RemAbortErr,
        wire::VIRTIO_IB_WC_FATAL_ERR => WcStatus::FatalErr,
        wire::VIRTIO_IB_WC_RESP_TIMEOUT_ERR => WcStatus::RespTimeoutErr,
        wire::VIRTIO_IB_WC_GENERAL_ERR => WcStatus::GeneralErr,
        _ => WcStatus::Invalid,
    }
}

pub fn wc_status_to_wire(status: WcStatus) -> u8 {
    match status {
        WcStatus::Success => wire::VIRTIO_IB_WC_SUCCESS,
        WcStatus::LocLenErr => wire::VIRTIO_IB_WC_LOC_LEN_ERR,
        WcStatus::LocQpOpErr => wire::VIRTIO_IB_WC_LOC_QP_OP_ERR,
        WcStatus::LocProtErr => wire::VIRTIO_IB_WC_LOC_PROT_ERR,
        WcStatus::WrFlushErr => wire::VIRTIO_IB_WC_WR_FLUSH_ERR,
        WcStatus::BadRespErr => wire::VIRTIO_IB_WC_BAD_RESP_ERR,
        WcStatus::LocAccessErr => wire::VIRTIO_IB_WC_LOC_ACCESS_ERR,
        WcStatus::RemInvReqErr => wire::VIRTIO_IB_WC_REM_INV_REQ_ERR,
        WcStatus::RemAccessErr => wire::VIRTIO_IB_WC_REM_ACCESS_ERR,
        WcStatus::RemOpErr => wire::VIRTIO_IB_WC_REM_OP_ERR,
        WcStatus::RetryExcErr => wire::VIRTIO_IB_WC_RETRY_EXC_ERR,
        WcStatus::RnrRetryExcErr => wire::VIRTIO_IB_WC_RNR_RETRY_EXC_ERR,
        WcStatus::RemAbortErr => wire::VIRTIO_IB_WC_REM_ABORT_ERR,
        WcStatus::FatalErr => wire::VIRTIO_IB_WC_FATAL_ERR,
        WcStatus::RespTimeoutErr => wire::VIRTIO_IB_WC_RESP_TIMEOUT_ERR,
        WcStatus::GeneralErr => wire::VIRTIO_IB_WC_GENERAL_ERR,
        WcStatus::Invalid => wire::WIRE_INVALID,
    }
}

pub fn wc_opcode(opcode: u8) -> WcOpcode {
    match opcode {
        wire::VIRTIO_IB_WC_SEND => WcOpcode::Send,
        wire::VIRTIO_IB_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        wire::VIRTIO_IB_WC_RDMA_READ => WcOpcode::RdmaRead,
        wire::VIRTIO_IB_WC_RECV => WcOpcode::Recv,
        wire::VIRTIO_IB_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        _ => WcOpcode::Invalid,
    }
}

pub fn wc_opcode_to_wire(opcode: WcOpcode) -> u8 {
    match opcode {
        WcOpcode::Send => wire::VIRTIO_IB_WC_SEND,
        WcOpcode::RdmaWrite => wire::VIRTIO_IB_WC_RDMA_WRITE,
        WcOpcode::RdmaRead => wire::VIRTIO_IB_WC_RDMA_READ,
        WcOpcode::Recv => wire::VIRTIO_IB_WC_RECV,
        WcOpcode::RecvRdmaWithImm => wire::VIRTIO_IB_WC_RECV_RDMA_WITH_IMM,
        WcOpcode::Invalid => wire::WIRE_INVALID,
    }
}

/// Atomics have no wire encoding on this device and map to the invalid
/// sentinel; the send path rejects them before marshaling.
pub fn wr_opcode_to_wire(opcode: WrOpcode) -> u8 {
    match opcode {
        WrOpcode::RdmaWrite => wire::VIRTIO_IB_WR_RDMA_WRITE,
        WrOpcode::RdmaWriteWithImm => wire::VIRTIO_IB_WR_RDMA_WRITE_WITH_IMM,
        WrOpcode::Send => wire::VIRTIO_IB_WR_SEND,
        WrOpcode::SendWithImm => wire::VIRTIO_IB_WR_SEND_WITH_IMM,
        WrOpcode::RdmaRead => wire::VIRTIO_IB_WR_RDMA_READ,
        WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd => wire::WIRE_INVALID,
    }
}

pub fn send_flags_to_wire(flags: SendFlags) -> u8 {
    let mut wire_flags = 0;
    if flags.contains(SendFlags::FENCE) {
        wire_flags |= wire::VIRTIO_IB_SEND_FENCE;
    }
    if flags.contains(SendFlags::SIGNALED) {
        wire_flags |= wire::VIRTIO_IB_SEND_SIGNALED;
    }
    if flags.contains(SendFlags::SOLICITED) {
        wire_flags |= wire::VIRTIO_IB_SEND_SOLICITED;
    }
    if flags.contains(SendFlags::INLINE) {
        wire_flags |= wire::VIRTIO_IB_SEND_INLINE;
    }
    wire_flags
}

/// Unknown wire bits are dropped; the known bits translate one to one.
pub fn wc_flags(flags: u8) -> WcFlags {
    let mut wc_flags = WcFlags::empty();
    if flags & wire::VIRTIO_IB_WC_GRH != 0 {
        wc_flags |= WcFlags::GRH;
    }
    if flags & wire::VIRTIO_IB_WC_WITH_IMM != 0 {
        wc_flags |= WcFlags::WITH_IMM;
    }
    wc_flags
}

pub fn wc_flags_to_wire(flags: WcFlags) -> u8 {
    let mut wire_flags = 0;
    if flags.contains(WcFlags::GRH) {
        wire_flags |= wire::VIRTIO_IB_WC_GRH;
    }
    if flags.contains(WcFlags::WITH_IMM) {
        wire_flags |= wire::VIRTIO_IB_WC_WITH_IMM;
    }
    wire_flags
}
