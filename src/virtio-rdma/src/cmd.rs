//! Control path boundary: synchronous command/response pairs plus queue
//! region mapping. The data path only touches this interface for setup,
//! teardown, and the slow doorbell.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use virtio_rdma_api::{
    AccessFlags, AddressHandle, AhAttr, CompletionQueue, MemoryRegion, ProtectionDomain, QpAttr,
    QpAttrMask, QpInitAttr, QueuePair,
};

use crate::Result;

/// Which of a QP's two rings a command refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingSelector {
    Send,
    Recv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    GetContext,

    AllocPd,
    DeallocPd(ProtectionDomain),

    RegMr(ProtectionDomain, u64, usize, AccessFlags),
    DeregMr(MemoryRegion),

    CreateCq(u32),
    DestroyCq(CompletionQueue),

    CreateQp(ProtectionDomain, QpInitAttr),
    QueryQp(QueuePair, QpAttrMask),
    ModifyQp(QueuePair, QpAttr, QpAttrMask),
    DestroyQp(QueuePair),

    CreateAh(ProtectionDomain, AhAttr),
    DestroyAh(AddressHandle),

    /// Zero-length post that acts as a pure notification for devices that
    /// did not negotiate a doorbell region.
    RingDoorbell(QueuePair, RingSelector),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CompletionKind {
    GetContext(returned::ContextInfo),

    AllocPd(returned::ProtectionDomain),
    DeallocPd,

    RegMr(returned::MemoryRegion),
    DeregMr,

    CreateCq(returned::CompletionQueue),
    DestroyCq,

    CreateQp(returned::QueuePair),
    QueryQp(returned::QpQuery),
    ModifyQp,
    DestroyQp,

    CreateAh(returned::AddressHandle),
    DestroyAh,

    RingDoorbell,
}

/// Ring geometry negotiated at queue creation. All offsets are relative to
/// the region mapped at `region_offset`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RingGeometry {
    /// Descriptor table capacity. Power of two per the split-ring contract.
    pub ring_entries: u16,
    /// Index written to the doorbell word to identify this queue.
    pub queue_index: u16,
    /// Offset of the queue region on the command fd.
    pub region_offset: u64,
    /// Total bytes to map.
    pub region_size: u32,
    /// Bytes occupied by the ring itself; the buffer extension starts here.
    pub ring_size: u32,
    /// Offset of the used ring within the region.
    pub used_offset: u32,
    /// Device-visible address of the buffer extension.
    pub ext_addr: u64,
    /// Doorbell bytes at the end of the region; 0 when not negotiated.
    pub notifier_size: u32,
}

pub mod returned {
    use serde::{Deserialize, Serialize};

    use super::RingGeometry;
    use virtio_rdma_api as api;
    use virtio_rdma_api::{QpAttr, QpInitAttr};

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct ContextInfo {
        pub abi_version: u32,
        pub fw_ver: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ProtectionDomain {
        pub handle: api::ProtectionDomain,
        pub pdn: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct MemoryRegion {
        pub handle: api::MemoryRegion,
        pub lkey: u32,
        pub rkey: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct CompletionQueue {
        pub handle: api::CompletionQueue,
        /// Negotiated completion capacity; may exceed the requested one.
        pub num_cqe: u32,
        pub ring: RingGeometry,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct QueuePair {
        pub handle: api::QueuePair,
        pub qpn: u32,
        pub num_sqe: u32,
        pub num_rqe: u32,
        pub sq: RingGeometry,
        pub rq: RingGeometry,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AddressHandle {
        pub handle: api::AddressHandle,
        pub ah_num: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct QpQuery {
        pub attr: QpAttr,
        pub init_attr: QpInitAttr,
    }
}

/// The synchronous command interface to the device, together with the
/// memory-mapping collaborator. Implementations serialize [`Command`] over
/// whatever channel the platform provides.
pub trait ControlPath: Send + Sync {
    fn submit(&self, cmd: Command) -> Result<CompletionKind>;

    /// Maps `len` bytes at `offset` of the device's queue-region space as
    /// process-shared read/write memory.
    fn map_queue(&self, offset: u64, len: usize) -> Result<mmap::Mmap>;
}

pub(crate) type Service = Arc<dyn ControlPath>;

/// Matches a control-plane response against the expected completion kind;
/// anything else is a protocol mismatch, not a value to guess at.
macro_rules! rx_match {
    ($resp:expr, $kind:ident) => {
        match $resp {
            $crate::cmd::CompletionKind::$kind => Ok(()),
            _ => Err($crate::Error::ProtocolMismatch(format!(
                "unexpected response to {}",
                stringify!($kind)
            ))),
        }
    };
    ($resp:expr, $kind:ident, $inst:ident, $app:block) => {
        match $resp {
            $crate::cmd::CompletionKind::$kind($inst) => $app,
            _ => Err($crate::Error::ProtocolMismatch(format!(
                "unexpected response to {}",
                stringify!($kind)
            ))),
        }
    };
}

pub(crate) use rx_match;

impl dyn ControlPath {
    /// Best-effort teardown helper for unwind paths.
    pub(crate) fn submit_or_warn(&self, cmd: Command) {
        if let Err(e) = self.submit(cmd.clone()) {
            log::warn!("unwind command {:?} failed: {}", cmd, e);
        }
    }
}
