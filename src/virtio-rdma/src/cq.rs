//! Completion queues.
//!
//! A CQ owns one consumer ring whose slots the device fills with
//! [`wire::CqReq`] records. Every slot is lent to the device at creation
//! time and re-lent immediately after it is polled, so the device always
//! has somewhere to write the next completion.
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use virtio_rdma_api as api;
use virtio_rdma_api::WorkCompletion;

use crate::cmd::{rx_match, Command, ControlPath, Service};
use crate::vring::{BufPool, Vring, VringQueue};
use crate::{convert, wire, Result};

struct CqInner {
    queue: VringQueue,
    /// Keeps the queue region mapped for as long as the ring points into it.
    _region: Option<mmap::Mmap>,
}

pub struct CompletionQueue {
    handle: api::CompletionQueue,
    num_cqe: u32,
    inner: Mutex<CqInner>,
    service: Service,
    destroyed: AtomicBool,
}

impl CompletionQueue {
    /// Creates a CQ with capacity for at least `min_cqe` completions and
    /// hands every completion slot to the device.
    pub(crate) fn create(service: &Service, min_cqe: u32) -> Result<CompletionQueue> {
        let resp = service.submit(Command::CreateCq(min_cqe))?;
        rx_match!(resp, CreateCq, ret, {
            let region = service.map_queue(ret.ring.region_offset, ret.ring.region_size as usize);
            let region = match region {
                Ok(region) => region,
                Err(e) => {
                    service.submit_or_warn(Command::DestroyCq(ret.handle));
                    return Err(e);
                }
            };

            let built = (|| {
                let (ring, ext) = Vring::map(region.as_mut_ptr(), region.len(), &ret.ring)?;
                let pool = BufPool::carve(
                    &ext,
                    ret.num_cqe,
                    std::mem::size_of::<wire::CqReq>(),
                    true,
                )?;
                VringQueue::new(ring, pool)
            })();
            let queue = match built {
                Ok(queue) => queue,
                Err(e) => {
                    service.submit_or_warn(Command::DestroyCq(ret.handle));
                    return Err(e);
                }
            };

            let cq = CompletionQueue::assemble(
                ret.handle,
                ret.num_cqe,
                queue,
                Some(region),
                Service::clone(service),
            );
            log::debug!("created CQ {:?} with {} entries", cq.handle, cq.num_cqe);
            Ok(cq)
        })
    }

    /// Wires the pieces together and lends every slot to the device. Kept
    /// separate from `create` so tests can supply their own ring memory.
    pub(crate) fn assemble(
        handle: api::CompletionQueue,
        num_cqe: u32,
        mut queue: VringQueue,
        region: Option<mmap::Mmap>,
        service: Service,
    ) -> CompletionQueue {
        let entry_size = queue.entry_size() as u32;
        while let Some(index) = queue.flist_pop() {
            queue.add_one(index, entry_size);
        }
        CompletionQueue {
            handle,
            num_cqe,
            inner: Mutex::new(CqInner {
                queue,
                _region: region,
            }),
            service,
            destroyed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn handle(&self) -> api::CompletionQueue {
        self.handle
    }

    /// Negotiated capacity; at least the requested minimum.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.num_cqe
    }

    /// Drains device-written completions into `wc`, at most `wc.len()` of
    /// them, and returns how many were written. Each drained slot goes
    /// straight back onto the ring. Never blocks.
    pub fn poll(&self, wc: &mut [WorkCompletion]) -> usize {
        let mut inner = self.inner.lock();
        let entry_size = inner.queue.entry_size() as u32;
        let mut count = 0;
        while count < wc.len() {
            let index = match inner.queue.get_one() {
                Some(index) => index,
                None => break,
            };
            let req = unsafe { ptr::read(inner.queue.slot(index) as *const wire::CqReq) };
            wc[count] = WorkCompletion {
                wr_id: req.wr_id,
                status: convert::wc_status(req.status),
                opcode: convert::wc_opcode(req.opcode),
                vendor_err: req.vendor_err,
                byte_len: req.byte_len,
                imm_data: req.imm_data,
                src_qp: req.src_qp,
                wc_flags: convert::wc_flags(req.wc_flags),
                pkey_index: 0,
            };
            inner.queue.add_one(index, entry_size);
            count += 1;
        }
        count
    }

    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = self
            .service
            .submit(Command::DestroyCq(self.handle))
            .map_err(|e| e.teardown())?;
        rx_match!(resp, DestroyCq).map_err(|e| e.teardown())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            self.service
                .as_ref()
                .submit_or_warn(Command::DestroyCq(self.handle));
        }
    }
}
