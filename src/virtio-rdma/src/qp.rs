//! Queue pairs and the work-request marshaling path.
//!
//! Each direction owns a producer ring whose fixed-size slots carry a wire
//! header plus a trailing region. The trailing region holds either the
//! scatter-gather array or, for inline sends, the payload itself. Slots
//! consumed by the device are reclaimed lazily at the top of the next post.
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use virtio_rdma_api as api;
use virtio_rdma_api::{QpAttr, QpAttrMask, QpInitAttr, QpType, SendFlags, Sge, WrOpcode};

use crate::cmd::{returned, rx_match, Command, ControlPath, RingGeometry, RingSelector, Service};
use crate::vring::{BufPool, Notifier, Vring, VringQueue};
use crate::{convert, wire, Error, PostError, Result};

const SQ_HDR: usize = std::mem::size_of::<wire::SqReqHdr>();
const RQ_HDR: usize = std::mem::size_of::<wire::RqReqHdr>();
const SGE_SIZE: usize = std::mem::size_of::<wire::VirtioSge>();

/// Remote endpoint of a send request. Which form applies follows from the
/// QP's transport type; the post path rejects mismatches.
#[derive(Debug, Clone, Copy)]
pub enum RemoteAddress {
    /// Datagram destination, addressed through an address handle.
    Ud {
        remote_qpn: u32,
        remote_qkey: u32,
        ah: u32,
    },
    /// Remote memory window for RDMA opcodes.
    Rdma { remote_addr: u64, rkey: u32 },
}

#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub send_flags: SendFlags,
    pub imm_data: u32,
    pub sg_list: Vec<Sge>,
    pub remote: Option<RemoteAddress>,
}

#[derive(Debug, Clone)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

/// One data-path direction: ring, pool, and the way the device learns about
/// new descriptors.
struct RingQueue {
    queue: VringQueue,
    notifier: Notifier,
    /// Keeps the queue region mapped for as long as the ring points into it.
    _region: Option<mmap::Mmap>,
}

pub struct QueuePair {
    handle: api::QueuePair,
    qpn: u32,
    qp_type: QpType,
    sq: Mutex<RingQueue>,
    rq: Mutex<RingQueue>,
    service: Service,
    destroyed: AtomicBool,
}

fn map_ring(
    service: &Service,
    geo: &RingGeometry,
    count: u32,
    entry_size: usize,
    qp: api::QueuePair,
    ring: RingSelector,
) -> Result<RingQueue> {
    let region = service.map_queue(geo.region_offset, geo.region_size as usize)?;
    let base = region.as_mut_ptr();
    let (vring, ext) = Vring::map(base, region.len(), geo)?;
    let pool = BufPool::carve(&ext, count, entry_size, false)?;
    let queue = VringQueue::new(vring, pool)?;
    let notifier = if geo.notifier_size > 0 {
        let addr =
            unsafe { base.add(region.len() - geo.notifier_size as usize) } as *mut u32;
        Notifier::Doorbell {
            addr,
            queue_index: geo.queue_index,
        }
    } else {
        Notifier::SlowPath { qp, ring }
    };
    Ok(RingQueue {
        queue,
        notifier,
        _region: Some(region),
    })
}

impl QueuePair {
    pub(crate) fn create(
        service: &Service,
        pd: api::ProtectionDomain,
        attr: QpInitAttr,
    ) -> Result<QueuePair> {
        let resp = service.submit(Command::CreateQp(pd, attr.clone()))?;
        rx_match!(resp, CreateQp, ret, {
            let cap = attr.cap;
            let sq_entry = SQ_HDR
                + (cap.max_send_sge as usize * SGE_SIZE).max(cap.max_inline_data as usize);
            let rq_entry = RQ_HDR + cap.max_recv_sge as usize * SGE_SIZE;

            let built: Result<(RingQueue, RingQueue)> = (|| {
                let sq = map_ring(
                    service,
                    &ret.sq,
                    ret.num_sqe,
                    sq_entry,
                    ret.handle,
                    RingSelector::Send,
                )?;
                let rq = map_ring(
                    service,
                    &ret.rq,
                    ret.num_rqe,
                    rq_entry,
                    ret.handle,
                    RingSelector::Recv,
                )?;
                Ok((sq, rq))
            })();
            let (sq, rq) = match built {
                Ok(rings) => rings,
                Err(e) => {
                    service.submit_or_warn(Command::DestroyQp(ret.handle));
                    return Err(e);
                }
            };

            let qp = QueuePair::assemble(ret, attr.qp_type, sq, rq, Service::clone(service));
            log::debug!("created QP {:?} qpn {}", qp.handle, qp.qpn);
            Ok(qp)
        })
    }

    fn assemble(
        ret: returned::QueuePair,
        qp_type: QpType,
        sq: RingQueue,
        rq: RingQueue,
        service: Service,
    ) -> QueuePair {
        QueuePair {
            handle: ret.handle,
            qpn: ret.qpn,
            qp_type,
            sq: Mutex::new(sq),
            rq: Mutex::new(rq),
            service,
            destroyed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn handle(&self) -> api::QueuePair {
        self.handle
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qpn
    }

    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    /// Posts a batch of send requests and rings the doorbell once.
    ///
    /// On error the returned index is the first request that was not
    /// published; requests before it have been handed to the device and the
    /// doorbell is still rung for them.
    ///
    /// # Safety
    ///
    /// Every scatter-gather fragment must reference registered memory that
    /// stays valid and unmodified until the matching completion is polled.
    /// For inline requests the fragments are copied during this call and
    /// only need to be valid for its duration.
    pub unsafe fn post_send(&self, wrs: &[SendWr]) -> std::result::Result<(), PostError> {
        let mut sq = self.sq.lock();
        let mut posted = 0usize;
        let mut failure = None;

        for (i, wr) in wrs.iter().enumerate() {
            // slots the device already consumed are free again
            while let Some(index) = sq.queue.get_one() {
                sq.queue.flist_push(index);
            }
            let index = match sq.queue.flist_pop() {
                Some(index) => index,
                None => {
                    failure = Some(PostError {
                        index: i,
                        error: Error::ResourceExhausted,
                    });
                    break;
                }
            };
            match self.marshal_send(&mut sq.queue, index, wr) {
                Ok(len) => {
                    sq.queue.add_one(index, len);
                    posted += 1;
                }
                Err(error) => {
                    sq.queue.flist_push(index);
                    failure = Some(PostError { index: i, error });
                    break;
                }
            }
        }

        if posted > 0 {
            if let Err(e) = sq.notifier.notify(&self.service) {
                log::warn!("send doorbell failed on QP {:?}: {}", self.handle, e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Posts a batch of receive requests and rings the doorbell once. Error
    /// reporting matches [`QueuePair::post_send`].
    ///
    /// # Safety
    ///
    /// Every scatter-gather fragment must reference registered memory that
    /// stays valid until the matching completion is polled.
    pub unsafe fn post_recv(&self, wrs: &[RecvWr]) -> std::result::Result<(), PostError> {
        let mut rq = self.rq.lock();
        let mut posted = 0usize;
        let mut failure = None;

        for (i, wr) in wrs.iter().enumerate() {
            while let Some(index) = rq.queue.get_one() {
                rq.queue.flist_push(index);
            }
            let index = match rq.queue.flist_pop() {
                Some(index) => index,
                None => {
                    failure = Some(PostError {
                        index: i,
                        error: Error::ResourceExhausted,
                    });
                    break;
                }
            };
            match marshal_recv(&mut rq.queue, index, wr) {
                Ok(len) => {
                    rq.queue.add_one(index, len);
                    posted += 1;
                }
                Err(error) => {
                    rq.queue.flist_push(index);
                    failure = Some(PostError { index: i, error });
                    break;
                }
            }
        }

        if posted > 0 {
            if let Err(e) = rq.notifier.notify(&self.service) {
                log::warn!("recv doorbell failed on QP {:?}: {}", self.handle, e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validates addressing against the transport type and writes the wire
    /// record into slot `index`. Returns the record length.
    fn marshal_send(&self, queue: &mut VringQueue, index: u16, wr: &SendWr) -> Result<u32> {
        let opcode = convert::wr_opcode_to_wire(wr.opcode);
        if opcode == wire::WIRE_INVALID {
            return Err(Error::Unsupported);
        }

        let addressing = match (self.qp_type, wr.remote) {
            (QpType::UD, Some(RemoteAddress::Ud { remote_qpn, remote_qkey, ah })) => {
                wire::SqAddressing {
                    ud: wire::UdAddress {
                        remote_qpn,
                        remote_qkey,
                        ah,
                        _pad: 0,
                    },
                }
            }
            (QpType::UD, _) => {
                return Err(Error::InvalidArgument(
                    "datagram send requires UD addressing",
                ))
            }
            (QpType::RC, remote) => match wr.opcode {
                WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm | WrOpcode::RdmaRead => {
                    match remote {
                        Some(RemoteAddress::Rdma { remote_addr, rkey }) => wire::SqAddressing {
                            rdma: wire::RdmaAddress {
                                remote_addr,
                                rkey,
                                _pad: 0,
                            },
                        },
                        _ => {
                            return Err(Error::InvalidArgument(
                                "RDMA opcode requires a remote memory window",
                            ))
                        }
                    }
                }
                _ => match remote {
                    None => wire::SqAddressing::zeroed(),
                    Some(_) => {
                        return Err(Error::InvalidArgument(
                            "connected send carries no addressing",
                        ))
                    }
                },
            },
        };

        let slot = queue.slot(index);
        let trailing = queue.entry_size() - SQ_HDR;
        let inline = wr.send_flags.contains(SendFlags::INLINE);

        let (num_sge, inline_len, record_len) = if inline {
            let total: usize = wr.sg_list.iter().map(|sge| sge.length as usize).sum();
            if total > trailing {
                return Err(Error::InvalidArgument("inline payload exceeds the slot"));
            }
            let mut off = SQ_HDR;
            for sge in &wr.sg_list {
                unsafe {
                    let src =
                        std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize);
                    ptr::copy_nonoverlapping(src.as_ptr(), slot.add(off), src.len());
                }
                off += sge.length as usize;
            }
            (0u32, total as u32, SQ_HDR + total)
        } else {
            let n = wr.sg_list.len();
            if n * SGE_SIZE > trailing {
                return Err(Error::InvalidArgument("scatter-gather list too long"));
            }
            let sges = unsafe { slot.add(SQ_HDR) } as *mut wire::VirtioSge;
            for (j, sge) in wr.sg_list.iter().enumerate() {
                unsafe {
                    sges.add(j).write(wire::VirtioSge {
                        addr: sge.addr,
                        length: sge.length,
                        lkey: sge.lkey,
                    });
                }
            }
            (n as u32, 0u32, SQ_HDR + n * SGE_SIZE)
        };

        let hdr = wire::SqReqHdr {
            wr_id: wr.wr_id,
            imm_data: wr.imm_data,
            num_sge,
            inline_len,
            opcode,
            send_flags: convert::send_flags_to_wire(wr.send_flags),
            _pad: [0; 2],
            addressing,
        };
        unsafe { ptr::write(slot as *mut wire::SqReqHdr, hdr) };
        Ok(record_len as u32)
    }

    pub fn query(&self, mask: QpAttrMask) -> Result<returned::QpQuery> {
        let resp = self.service.submit(Command::QueryQp(self.handle, mask))?;
        rx_match!(resp, QueryQp, query, { Ok(query) })
    }

    pub fn modify(&self, attr: QpAttr, mask: QpAttrMask) -> Result<()> {
        let resp = self
            .service
            .submit(Command::ModifyQp(self.handle, attr, mask))?;
        rx_match!(resp, ModifyQp)
    }

    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = self
            .service
            .submit(Command::DestroyQp(self.handle))
            .map_err(|e| e.teardown())?;
        rx_match!(resp, DestroyQp).map_err(|e| e.teardown())
    }
}

fn marshal_recv(queue: &mut VringQueue, index: u16, wr: &RecvWr) -> Result<u32> {
    let trailing = queue.entry_size() - RQ_HDR;
    let n = wr.sg_list.len();
    if n * SGE_SIZE > trailing {
        return Err(Error::InvalidArgument("scatter-gather list too long"));
    }

    let slot = queue.slot(index);
    let hdr = wire::RqReqHdr {
        wr_id: wr.wr_id,
        num_sge: n as u32,
        _pad: 0,
    };
    unsafe {
        ptr::write(slot as *mut wire::RqReqHdr, hdr);
        let sges = slot.add(RQ_HDR) as *mut wire::VirtioSge;
        for (j, sge) in wr.sg_list.iter().enumerate() {
            sges.add(j).write(wire::VirtioSge {
                addr: sge.addr,
                length: sge.length,
                lkey: sge.lkey,
            });
        }
    }
    Ok((RQ_HDR + n * SGE_SIZE) as u32)
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            self.service
                .as_ref()
                .submit_or_warn(Command::DestroyQp(self.handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{counting_service, FakeRing};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Arc;
    use virtio_rdma_api::Handle;

    const MAX_SGE: usize = 2;
    const SQ_ENTRY: usize = SQ_HDR + MAX_SGE * SGE_SIZE;
    const RQ_ENTRY: usize = RQ_HDR + MAX_SGE * SGE_SIZE;

    struct Rig {
        qp: QueuePair,
        sq_fake: FakeRing,
        rq_fake: FakeRing,
        service: Arc<crate::testing::StubControlPath>,
    }

    fn rig(qp_type: QpType, depth: u32) -> Rig {
        let sq_fake = FakeRing::new(depth.next_power_of_two() as u16, depth, SQ_ENTRY, false);
        let rq_fake = FakeRing::new(depth.next_power_of_two() as u16, depth, RQ_ENTRY, false);
        let service = counting_service();
        let handle = api::QueuePair(Handle(3));

        let build = |fake: &FakeRing, entry: usize, ring| {
            let (vring, ext) = Vring::map(fake.base(), fake.len(), &fake.geo).unwrap();
            let pool = BufPool::carve(&ext, depth, entry, false).unwrap();
            RingQueue {
                queue: VringQueue::new(vring, pool).unwrap(),
                notifier: Notifier::SlowPath { qp: handle, ring },
                _region: None,
            }
        };
        let sq = build(&sq_fake, SQ_ENTRY, RingSelector::Send);
        let rq = build(&rq_fake, RQ_ENTRY, RingSelector::Recv);

        let ret = returned::QueuePair {
            handle,
            qpn: 11,
            num_sqe: depth,
            num_rqe: depth,
            sq: sq_fake.geo,
            rq: rq_fake.geo,
        };
        let svc: Service = service.clone();
        let qp = QueuePair::assemble(ret, qp_type, sq, rq, svc);
        Rig {
            qp,
            sq_fake,
            rq_fake,
            service,
        }
    }

    fn send_wr(wr_id: u64, sg_list: Vec<Sge>) -> SendWr {
        SendWr {
            wr_id,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::SIGNALED,
            imm_data: 0,
            sg_list,
            remote: None,
        }
    }

    fn doorbells(rig: &Rig) -> usize {
        rig.service.doorbells.load(AtomicOrdering::SeqCst)
    }

    #[test]
    fn batch_is_published_with_one_doorbell() {
        let mut rig = rig(QpType::RC, 8);
        let wrs: Vec<SendWr> = (0..3)
            .map(|i| send_wr(i, vec![Sge { addr: 0x1000, length: 64, lkey: 5 }]))
            .collect();
        unsafe { rig.qp.post_send(&wrs).unwrap() };
        assert_eq!(doorbells(&rig), 1);

        for wr_id in 0..3u64 {
            let d = rig.sq_fake.device_pop().unwrap();
            assert!(!d.device_writable);
            assert_eq!(d.len as usize, SQ_HDR + SGE_SIZE);
            let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
            assert_eq!(hdr.wr_id, wr_id);
            assert_eq!(hdr.num_sge, 1);
            assert_eq!(hdr.opcode, wire::VIRTIO_IB_WR_SEND);
            let sge = unsafe { ptr::read((d.addr as usize + SQ_HDR) as *const wire::VirtioSge) };
            assert_eq!(sge.addr, 0x1000);
            assert_eq!(sge.length, 64);
            assert_eq!(sge.lkey, 5);
        }
        assert!(rig.sq_fake.device_pop().is_none());
    }

    #[test]
    fn exhausted_pool_reports_the_failing_index() {
        let mut rig = rig(QpType::RC, 1);
        let wrs: Vec<SendWr> = (0..3).map(|i| send_wr(i, vec![])).collect();
        let err = unsafe { rig.qp.post_send(&wrs).unwrap_err() };
        assert_eq!(err.index, 1);
        assert!(matches!(err.error, Error::ResourceExhausted));

        // the request before the failure was still published and notified
        assert_eq!(doorbells(&rig), 1);
        let d = rig.sq_fake.device_pop().unwrap();
        let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
        assert_eq!(hdr.wr_id, 0);
    }

    #[test]
    fn consumed_slots_are_reclaimed_before_posting() {
        let mut rig = rig(QpType::RC, 1);
        unsafe { rig.qp.post_send(&[send_wr(1, vec![])]).unwrap() };
        let d = rig.sq_fake.device_pop().unwrap();
        rig.sq_fake.device_push_used(d.index, d.len);

        // pool depth is 1, so this only works if the used slot comes back
        unsafe { rig.qp.post_send(&[send_wr(2, vec![])]).unwrap() };
        let d = rig.sq_fake.device_pop().unwrap();
        let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
        assert_eq!(hdr.wr_id, 2);
    }

    #[test]
    fn inline_payload_is_copied_into_the_slot() {
        let mut rig = rig(QpType::RC, 8);
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6, 7, 8];
        let wr = SendWr {
            wr_id: 42,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::SIGNALED | SendFlags::INLINE,
            imm_data: 0,
            sg_list: vec![
                Sge { addr: a.as_ptr() as u64, length: 4, lkey: 0 },
                Sge { addr: b.as_ptr() as u64, length: 4, lkey: 0 },
            ],
            remote: None,
        };
        unsafe { rig.qp.post_send(&[wr]).unwrap() };

        let d = rig.sq_fake.device_pop().unwrap();
        assert_eq!(d.len as usize, SQ_HDR + 8);
        let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
        assert_eq!(hdr.num_sge, 0);
        assert_eq!(hdr.inline_len, 8);
        assert_ne!(hdr.send_flags & wire::VIRTIO_IB_SEND_INLINE, 0);
        let payload =
            unsafe { std::slice::from_raw_parts((d.addr as usize + SQ_HDR) as *const u8, 8) };
        assert_eq!(payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn oversized_inline_payload_is_rejected() {
        let rig = rig(QpType::RC, 8);
        let data = vec![0u8; SQ_ENTRY - SQ_HDR + 1];
        let wr = SendWr {
            wr_id: 1,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::INLINE,
            imm_data: 0,
            sg_list: vec![Sge {
                addr: data.as_ptr() as u64,
                length: data.len() as u32,
                lkey: 0,
            }],
            remote: None,
        };
        let err = unsafe { rig.qp.post_send(&[wr]).unwrap_err() };
        assert_eq!(err.index, 0);
        assert!(matches!(err.error, Error::InvalidArgument(_)));
        assert_eq!(doorbells(&rig), 0);
    }

    #[test]
    fn addressing_must_match_the_transport() {
        let rig = rig(QpType::UD, 8);
        let err = unsafe { rig.qp.post_send(&[send_wr(1, vec![])]).unwrap_err() };
        assert!(matches!(err.error, Error::InvalidArgument(_)));

        let rig = self::rig(QpType::RC, 8);
        let mut wr = send_wr(1, vec![]);
        wr.opcode = WrOpcode::RdmaWrite;
        let err = unsafe { rig.qp.post_send(&[wr]).unwrap_err() };
        assert!(matches!(err.error, Error::InvalidArgument(_)));

        let mut wr = send_wr(1, vec![]);
        wr.remote = Some(RemoteAddress::Ud {
            remote_qpn: 1,
            remote_qkey: 2,
            ah: 3,
        });
        let err = unsafe { rig.qp.post_send(&[wr]).unwrap_err() };
        assert!(matches!(err.error, Error::InvalidArgument(_)));
    }

    #[test]
    fn datagram_send_carries_the_ud_address() {
        let mut rig = rig(QpType::UD, 8);
        let mut wr = send_wr(1, vec![]);
        wr.remote = Some(RemoteAddress::Ud {
            remote_qpn: 17,
            remote_qkey: 0xdead,
            ah: 4,
        });
        unsafe { rig.qp.post_send(&[wr]).unwrap() };

        let d = rig.sq_fake.device_pop().unwrap();
        let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
        let ud = unsafe { hdr.addressing.ud };
        assert_eq!(ud.remote_qpn, 17);
        assert_eq!(ud.remote_qkey, 0xdead);
        assert_eq!(ud.ah, 4);
    }

    #[test]
    fn rdma_write_carries_the_remote_window() {
        let mut rig = rig(QpType::RC, 8);
        let wr = SendWr {
            wr_id: 1,
            opcode: WrOpcode::RdmaWrite,
            send_flags: SendFlags::empty(),
            imm_data: 0,
            sg_list: vec![Sge { addr: 0x2000, length: 128, lkey: 6 }],
            remote: Some(RemoteAddress::Rdma {
                remote_addr: 0xabcd_0000,
                rkey: 77,
            }),
        };
        unsafe { rig.qp.post_send(&[wr]).unwrap() };

        let d = rig.sq_fake.device_pop().unwrap();
        let hdr = unsafe { ptr::read(d.addr as *const wire::SqReqHdr) };
        assert_eq!(hdr.opcode, wire::VIRTIO_IB_WR_RDMA_WRITE);
        let rdma = unsafe { hdr.addressing.rdma };
        assert_eq!(rdma.remote_addr, 0xabcd_0000);
        assert_eq!(rdma.rkey, 77);
    }

    #[test]
    fn atomics_are_rejected_as_unsupported() {
        let rig = rig(QpType::RC, 8);
        let mut wr = send_wr(1, vec![]);
        wr.opcode = WrOpcode::AtomicCmpAndSwp;
        let err = unsafe { rig.qp.post_send(&[wr]).unwrap_err() };
        assert!(matches!(err.error, Error::Unsupported));
    }

    #[test]
    fn recv_requests_marshal_the_gather_list() {
        let mut rig = rig(QpType::RC, 8);
        let wrs = vec![RecvWr {
            wr_id: 21,
            sg_list: vec![
                Sge { addr: 0x3000, length: 32, lkey: 8 },
                Sge { addr: 0x4000, length: 32, lkey: 9 },
            ],
        }];
        unsafe { rig.qp.post_recv(&wrs).unwrap() };
        assert_eq!(doorbells(&rig), 1);

        let d = rig.rq_fake.device_pop().unwrap();
        assert_eq!(d.len as usize, RQ_HDR + 2 * SGE_SIZE);
        let hdr = unsafe { ptr::read(d.addr as *const wire::RqReqHdr) };
        assert_eq!(hdr.wr_id, 21);
        assert_eq!(hdr.num_sge, 2);
        let sge = unsafe {
            ptr::read((d.addr as usize + RQ_HDR + SGE_SIZE) as *const wire::VirtioSge)
        };
        assert_eq!(sge.addr, 0x4000);
        assert_eq!(sge.lkey, 9);
    }

    #[test]
    fn oversized_gather_list_is_rejected() {
        let rig = rig(QpType::RC, 8);
        let sge = Sge { addr: 0x3000, length: 8, lkey: 1 };
        let wrs = vec![RecvWr {
            wr_id: 1,
            sg_list: vec![sge; MAX_SGE + 1],
        }];
        let err = unsafe { rig.qp.post_recv(&wrs).unwrap_err() };
        assert_eq!(err.index, 0);
        assert!(matches!(err.error, Error::InvalidArgument(_)));
    }

    #[test]
    fn concurrent_posters_never_lose_a_slot() {
        let rig = rig(QpType::RC, 8);
        crossbeam::thread::scope(|s| {
            for t in 0..4u64 {
                let qp = &rig.qp;
                s.spawn(move |_| {
                    for i in 0..8u64 {
                        let wr = send_wr(t * 100 + i, vec![]);
                        // exhaustion is fine here, double handouts are not
                        let _ = unsafe { qp.post_send(&[wr]) };
                    }
                });
            }
        })
        .unwrap();

        let sq = rig.qp.sq.lock();
        assert_eq!(sq.queue.free_count() + sq.queue.in_ring(), 8);
        assert_eq!(sq.queue.in_ring(), 8);
    }
}
