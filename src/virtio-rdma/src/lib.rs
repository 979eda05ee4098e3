//! Userspace data path for the virtio-rdma device.
//!
//! The driver talks to the device over two planes. The control plane is a
//! synchronous command channel behind the [`cmd::ControlPath`] trait;
//! resource creation, teardown, and the slow doorbell go through it. The
//! data plane is a set of memory-mapped split rings: each QP owns a send
//! and a receive ring whose slots carry wire-format work requests, and each
//! CQ owns a ring whose slots the device fills with completion records.
//!
//! Entry point is [`Context::new`], which verifies the command ABI before
//! anything else is created.

pub mod cmd;
pub mod context;
pub mod convert;
pub mod cq;
pub mod qp;
pub mod wire;

mod error;
pub(crate) mod vring;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{AddressHandle, Context, MemoryRegion, ProtectionDomain};
pub use cq::CompletionQueue;
pub use error::{Error, PostError};
pub use qp::{QueuePair, RecvWr, RemoteAddress, SendWr};

pub type Result<T> = std::result::Result<T, Error>;
