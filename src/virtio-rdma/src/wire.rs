//! Wire ABI shared with the virtio-rdma device.
//!
//! Every record is a fixed `repr(C)` header followed by a trailing region
//! that holds either inline payload bytes or a scatter-gather descriptor
//! array. The published descriptor length is always header + used trailing
//! bytes and never exceeds the pool's negotiated entry size.

/// Version tag of the command interface. The device must report exactly this
/// value at context creation.
pub const VIRTIO_RDMA_ABI_VERSION: u32 = 1;

/// Sentinel for codes that have no wire encoding. The device reserves this
/// bit pattern; it is never assigned to a legitimate code.
pub const WIRE_INVALID: u8 = 0xff;

// Completion statuses.
pub const VIRTIO_IB_WC_SUCCESS: u8 = 0;
pub const VIRTIO_IB_WC_LOC_LEN_ERR: u8 = 1;
pub const VIRTIO_IB_WC_LOC_QP_OP_ERR: u8 = 2;
pub const VIRTIO_IB_WC_LOC_PROT_ERR: u8 = 3;
pub const VIRTIO_IB_WC_WR_FLUSH_ERR: u8 = 4;
pub const VIRTIO_IB_WC_BAD_RESP_ERR: u8 = 5;
pub const VIRTIO_IB_WC_LOC_ACCESS_ERR: u8 = 6;
pub const VIRTIO_IB_WC_REM_INV_REQ_ERR: u8 = 7;
pub const VIRTIO_IB_WC_REM_ACCESS_ERR: u8 = 8;
pub const VIRTIO_IB_WC_REM_OP_ERR: u8 = 9;
pub const VIRTIO_IB_WC_RETRY_EXC_ERR: u8 = 10;
pub const VIRTIO_IB_WC_RNR_RETRY_EXC_ERR: u8 = 11;
pub const VIRTIO_IB_WC_REM_ABORT_ERR: u8 = 12;
pub const VIRTIO_IB_WC_FATAL_ERR: u8 = 13;
pub const VIRTIO_IB_WC_RESP_TIMEOUT_ERR: u8 = 14;
pub const VIRTIO_IB_WC_GENERAL_ERR: u8 = 15;

// Completion opcodes.
pub const VIRTIO_IB_WC_SEND: u8 = 0;
pub const VIRTIO_IB_WC_RDMA_WRITE: u8 = 1;
pub const VIRTIO_IB_WC_RDMA_READ: u8 = 2;
pub const VIRTIO_IB_WC_RECV: u8 = 3;
pub const VIRTIO_IB_WC_RECV_RDMA_WITH_IMM: u8 = 4;

// Send request opcodes.
pub const VIRTIO_IB_WR_RDMA_WRITE: u8 = 0;
pub const VIRTIO_IB_WR_RDMA_WRITE_WITH_IMM: u8 = 1;
pub const VIRTIO_IB_WR_SEND: u8 = 2;
pub const VIRTIO_IB_WR_SEND_WITH_IMM: u8 = 3;
pub const VIRTIO_IB_WR_RDMA_READ: u8 = 4;

// Send flags.
pub const VIRTIO_IB_SEND_FENCE: u8 = 1 << 0;
pub const VIRTIO_IB_SEND_SIGNALED: u8 = 1 << 1;
pub const VIRTIO_IB_SEND_SOLICITED: u8 = 1 << 2;
pub const VIRTIO_IB_SEND_INLINE: u8 = 1 << 3;

// Completion flags.
pub const VIRTIO_IB_WC_GRH: u8 = 1 << 0;
pub const VIRTIO_IB_WC_WITH_IMM: u8 = 1 << 1;

/// One scatter-gather descriptor as the device consumes it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioSge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Datagram addressing for a send request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UdAddress {
    pub remote_qpn: u32,
    pub remote_qkey: u32,
    pub ah: u32,
    pub _pad: u32,
}

/// RDMA addressing for a send request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RdmaAddress {
    pub remote_addr: u64,
    pub rkey: u32,
    pub _pad: u32,
}

/// The addressing area of [`SqReqHdr`]. The wire layout overlaps the two
/// forms; which one is meaningful follows from the QP's transport type, so
/// a record is only ever written and read through one variant.
#[repr(C)]
#[derive(Clone, Copy)]
pub union SqAddressing {
    pub ud: UdAddress,
    pub rdma: RdmaAddress,
}

impl SqAddressing {
    pub fn zeroed() -> Self {
        SqAddressing {
            rdma: RdmaAddress {
                remote_addr: 0,
                rkey: 0,
                _pad: 0,
            },
        }
    }
}

/// Fixed header of a send-queue record. Followed by `num_sge` scatter-gather
/// descriptors, or by `inline_len` payload bytes when the request is inline
/// (the two are mutually exclusive).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SqReqHdr {
    pub wr_id: u64,
    pub imm_data: u32,
    pub num_sge: u32,
    pub inline_len: u32,
    pub opcode: u8,
    pub send_flags: u8,
    pub _pad: [u8; 2],
    pub addressing: SqAddressing,
}

/// Fixed header of a receive-queue record, followed by `num_sge`
/// scatter-gather descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RqReqHdr {
    pub wr_id: u64,
    pub num_sge: u32,
    pub _pad: u32,
}

/// A completion record as the device writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CqReq {
    pub wr_id: u64,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub src_qp: u32,
    pub status: u8,
    pub opcode: u8,
    pub wc_flags: u8,
    pub _pad: u8,
    pub _reserved: u32,
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;
    const_assert_eq!(size_of::<VirtioSge>(), 16);
    const_assert_eq!(size_of::<SqAddressing>(), 16);
    const_assert_eq!(size_of::<SqReqHdr>(), 40);
    const_assert_eq!(size_of::<RqReqHdr>(), 16);
    const_assert_eq!(size_of::<CqReq>(), 32);
}
