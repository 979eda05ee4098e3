//! The split-ring transport and the buffer pool layered on top of it.
//!
//! A queue region the device hands out at creation contains, in order: the
//! descriptor table, the available (producer) ring, the used (consumer)
//! ring at a device-chosen offset, the fixed-size buffer slots the wire
//! records live in, and optionally a doorbell word at the very end.
//!
//! Ordering contract: a slot's payload must be globally visible before the
//! producer index update is, and the consumer must not read a slot before
//! it observed the matching used-index update. `push` and `pop_used` are
//! the only two places that enforce this.
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use crate::cmd::{Command, ControlPath, RingGeometry, RingSelector, Service};
use crate::{Error, Result};

/// Marks a descriptor as device-writable (completion buffers).
const VRING_DESC_F_WRITE: u16 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct VringDesc {
    pub(crate) addr: u64,
    pub(crate) len: u32,
    pub(crate) flags: u16,
    pub(crate) next: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct VringAvail {
    flags: u16,
    idx: u16,
    // ring: [u16; num] follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct VringUsedElem {
    pub(crate) id: u32,
    pub(crate) len: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct VringUsed {
    flags: u16,
    idx: u16,
    // ring: [VringUsedElem; num] follows
}

/// The buffer-slot extension of a queue region: the byte range past the
/// ring that descriptors point into, with its device-visible base address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Extension {
    base: *mut u8,
    device_addr: u64,
    len: usize,
}

/// A split ring interpreted over a pre-mapped queue region.
pub(crate) struct Vring {
    num: u16,
    desc: *mut VringDesc,
    avail: *mut VringAvail,
    avail_ring: *mut u16,
    used: *const VringUsed,
    used_ring: *const VringUsedElem,
    /// Shadow of the published producer index.
    avail_idx: u16,
    /// Consumer index; trails `used.idx`.
    last_used: u16,
}

// The raw pointers target the queue region, which outlives the ring (the
// owning CQ/QP holds the mapping) and is only touched under the owner's
// lock plus the ring's ordering protocol.
unsafe impl Send for Vring {}

impl Vring {
    /// Interprets a mapped queue region as a split ring using the geometry
    /// from the creation response. Returns the ring together with the slot
    /// extension it leaves untouched.
    pub(crate) fn map(
        base: *mut u8,
        region_len: usize,
        g: &RingGeometry,
    ) -> Result<(Vring, Extension)> {
        let num = g.ring_entries as usize;
        if num == 0 || !num.is_power_of_two() {
            return Err(Error::Setup("descriptor capacity is not a power of two"));
        }
        let driver_area = num * 16 + 4 + 2 * num;
        let used_off = g.used_offset as usize;
        let used_area = 4 + 8 * num;
        if used_off % 4 != 0 || used_off < driver_area {
            return Err(Error::Setup("used ring overlaps the driver area"));
        }
        if used_off + used_area > g.ring_size as usize {
            return Err(Error::Setup("used ring exceeds the ring area"));
        }
        // the extension holds repr(C) records with u64 fields
        if g.ring_size % 8 != 0 {
            return Err(Error::Setup("buffer extension is not 8-byte aligned"));
        }
        let tail = g.notifier_size as usize;
        if g.ring_size as usize + tail > region_len || region_len != g.region_size as usize {
            return Err(Error::Setup("ring geometry exceeds the mapped region"));
        }

        let ext_base = unsafe { base.add(g.ring_size as usize) };
        let ext = Extension {
            base: ext_base,
            device_addr: g.ext_addr,
            len: region_len - g.ring_size as usize - tail,
        };
        let desc = base as *mut VringDesc;
        let avail = unsafe { base.add(num * 16) } as *mut VringAvail;
        let avail_ring = unsafe { base.add(num * 16 + 4) } as *mut u16;
        let used = unsafe { base.add(used_off) } as *const VringUsed;
        let used_ring = unsafe { base.add(used_off + 4) } as *const VringUsedElem;

        Ok((
            Vring {
                num: g.ring_entries,
                desc,
                avail,
                avail_ring,
                used,
                used_ring,
                avail_idx: 0,
                last_used: 0,
            },
            ext,
        ))
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u16 {
        self.num
    }

    /// Publishes one descriptor. The slot's payload must be fully written
    /// before this call; the release fence below makes it visible to the
    /// device no later than the index update.
    fn push(&mut self, desc_idx: u16, addr: u64, len: u32, device_writable: bool) {
        let flags = if device_writable { VRING_DESC_F_WRITE } else { 0 };
        unsafe {
            let d = self.desc.add(desc_idx as usize);
            ptr::addr_of_mut!((*d).addr).write(addr);
            ptr::addr_of_mut!((*d).len).write(len);
            ptr::addr_of_mut!((*d).flags).write(flags);
            ptr::addr_of_mut!((*d).next).write(0);

            let slot = (self.avail_idx % self.num) as usize;
            self.avail_ring.add(slot).write_volatile(desc_idx);
        }
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        unsafe {
            ptr::addr_of_mut!((*self.avail).idx).write_volatile(self.avail_idx);
        }
    }

    /// Consumes one used element, or `None` when the device has returned
    /// nothing new. Non-blocking.
    fn pop_used(&mut self) -> Option<u16> {
        let used_idx = unsafe { ptr::addr_of!((*self.used).idx).read_volatile() };
        if used_idx == self.last_used {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = (self.last_used % self.num) as usize;
        let elem = unsafe { self.used_ring.add(slot).read_volatile() };
        self.last_used = self.last_used.wrapping_add(1);
        Some(elem.id as u16)
    }
}

/// Secondary index ring acting purely as the free list; decoupled from the
/// descriptor ring.
struct FreeList {
    slots: Box<[u16]>,
    head: usize,
    count: usize,
}

impl FreeList {
    fn with_capacity(cap: usize) -> Self {
        FreeList {
            slots: vec![0u16; cap].into_boxed_slice(),
            head: 0,
            count: 0,
        }
    }

    #[inline]
    fn push(&mut self, index: u16) {
        debug_assert!(self.count < self.slots.len());
        let tail = (self.head + self.count) % self.slots.len();
        self.slots[tail] = index;
        self.count += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<u16> {
        if self.count == 0 {
            return None;
        }
        let index = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        Some(index)
    }

    #[inline]
    fn len(&self) -> usize {
        self.count
    }
}

struct BufPoolEntry {
    data: *mut u8,
    device_addr: u64,
}

/// Fixed-depth array of fixed-size slots carved from the queue region's
/// extension. A slot is owned by exactly one of the free list, the ring
/// (device side), or the consumer at any instant; ownership moves only
/// through `flist_pop` → `add_one` → `get_one` → `flist_push`/`add_one`.
pub(crate) struct BufPool {
    entries: Box<[BufPoolEntry]>,
    entry_size: usize,
    device_writable: bool,
    flist: FreeList,
}

unsafe impl Send for BufPool {}

impl BufPool {
    /// Carves `count` slots of `entry_size` bytes from the extension and
    /// seeds the free list with every index. `device_writable` marks the
    /// slots as written by the device (completion buffers).
    pub(crate) fn carve(
        ext: &Extension,
        count: u32,
        entry_size: usize,
        device_writable: bool,
    ) -> Result<BufPool> {
        if count == 0 || entry_size == 0 {
            return Err(Error::Setup("empty buffer pool"));
        }
        let total = (count as usize)
            .checked_mul(entry_size)
            .ok_or(Error::Setup("buffer pool size overflow"))?;
        if total > ext.len {
            return Err(Error::Setup("buffer pool exceeds the queue extension"));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut flist = FreeList::with_capacity(count as usize);
        for i in 0..count as usize {
            let off = i * entry_size;
            entries.push(BufPoolEntry {
                data: unsafe { ext.base.add(off) },
                device_addr: ext.device_addr + off as u64,
            });
            flist.push(i as u16);
        }

        Ok(BufPool {
            entries: entries.into_boxed_slice(),
            entry_size,
            device_writable,
            flist,
        })
    }

    #[inline]
    pub(crate) fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    fn depth(&self) -> usize {
        self.entries.len()
    }
}

/// A split ring paired with its buffer pool; the unit both data-path
/// directions and the completion poller are built from.
pub(crate) struct VringQueue {
    ring: Vring,
    pool: BufPool,
    /// Per-slot record of which indices the device currently holds; guards
    /// the pool against a device returning an index it does not own.
    lent: Box<[bool]>,
    /// Slots currently lent to the device through the ring.
    in_ring: usize,
}

impl VringQueue {
    pub(crate) fn new(ring: Vring, pool: BufPool) -> Result<VringQueue> {
        // Descriptor index and slot index are the same namespace; the pool
        // can never be deeper than the descriptor table.
        if pool.depth() > ring.capacity() as usize {
            return Err(Error::Setup("buffer pool deeper than the ring"));
        }
        let lent = vec![false; pool.depth()].into_boxed_slice();
        Ok(VringQueue {
            ring,
            pool,
            lent,
            in_ring: 0,
        })
    }

    /// Publishes slot `index` with a record of `len` bytes.
    pub(crate) fn add_one(&mut self, index: u16, len: u32) {
        debug_assert!((index as usize) < self.pool.depth());
        debug_assert!(!self.lent[index as usize]);
        debug_assert!(len as usize <= self.pool.entry_size);
        let addr = self.pool.entries[index as usize].device_addr;
        self.ring.push(index, addr, len, self.pool.device_writable);
        self.lent[index as usize] = true;
        self.in_ring += 1;
    }

    /// Returns the slot index of the next device-completed descriptor, or
    /// `None` when the ring is empty. Never blocks. Used elements naming a
    /// slot the device does not hold (out of range, or already returned)
    /// are dropped so they cannot corrupt the pool accounting.
    pub(crate) fn get_one(&mut self) -> Option<u16> {
        let index = self.ring.pop_used()?;
        if index as usize >= self.pool.depth() {
            log::warn!("device returned out-of-range slot index {}", index);
            return None;
        }
        if !self.lent[index as usize] {
            log::warn!("device returned slot index {} it does not hold", index);
            return None;
        }
        self.lent[index as usize] = false;
        self.in_ring -= 1;
        Some(index)
    }

    #[inline]
    pub(crate) fn flist_pop(&mut self) -> Option<u16> {
        self.pool.flist.pop()
    }

    #[inline]
    pub(crate) fn flist_push(&mut self, index: u16) {
        debug_assert!((index as usize) < self.pool.depth());
        self.pool.flist.push(index)
    }

    #[inline]
    pub(crate) fn slot(&self, index: u16) -> *mut u8 {
        self.pool.entries[index as usize].data
    }

    #[inline]
    pub(crate) fn entry_size(&self) -> usize {
        self.pool.entry_size
    }

    #[inline]
    pub(crate) fn free_count(&self) -> usize {
        self.pool.flist.len()
    }

    #[inline]
    pub(crate) fn in_ring(&self) -> usize {
        self.in_ring
    }

    #[inline]
    pub(crate) fn depth(&self) -> usize {
        self.pool.depth()
    }
}

/// How the device is told that new descriptors are available. Selected once
/// at setup from the negotiated geometry, never branched on per call site.
pub(crate) enum Notifier {
    /// Memory-mapped doorbell word at the tail of the queue region.
    Doorbell {
        addr: *mut u32,
        queue_index: u16,
    },
    /// Zero-length control-plane post standing in for a doorbell.
    SlowPath {
        qp: virtio_rdma_api::QueuePair,
        ring: RingSelector,
    },
}

unsafe impl Send for Notifier {}

impl Notifier {
    pub(crate) fn notify(&self, service: &Service) -> Result<()> {
        match *self {
            Notifier::Doorbell { addr, queue_index } => {
                unsafe { addr.write_volatile(queue_index as u32) };
                Ok(())
            }
            Notifier::SlowPath { qp, ring } => {
                let resp = service.submit(Command::RingDoorbell(qp, ring))?;
                crate::cmd::rx_match!(resp, RingDoorbell)
            }
        }
    }
}
