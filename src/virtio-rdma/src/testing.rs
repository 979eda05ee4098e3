//! Unit-test scaffolding: a device-side view of a queue region and control
//! path stubs. The integration tests carry their own full mock device.
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cmd::{Command, CompletionKind, ControlPath, RingGeometry, Service};
use crate::vring::{VringDesc, VringUsedElem};
use crate::{Error, Result};

/// A descriptor as the device sees it after consuming the available ring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceDesc {
    pub(crate) index: u16,
    pub(crate) addr: u64,
    pub(crate) len: u32,
    pub(crate) device_writable: bool,
}

/// One queue region with the device's half of the split-ring protocol.
/// Slot addresses are identity mapped: the geometry's `ext_addr` is the
/// region's own virtual address, so `DeviceDesc::addr` can be dereferenced
/// directly in tests.
pub(crate) struct FakeRing {
    mem: Box<[u64]>,
    pub(crate) geo: RingGeometry,
    region_len: usize,
    avail_seen: u16,
    used_idx: u16,
}

impl FakeRing {
    pub(crate) fn new(
        ring_entries: u16,
        pool_entries: u32,
        entry_size: usize,
        notifier: bool,
    ) -> FakeRing {
        let num = ring_entries as usize;
        let driver_area = num * 16 + 4 + 2 * num;
        let used_off = (driver_area + 3) & !3;
        let ring_size = (used_off + 4 + 8 * num + 7) & !7;
        let notifier_size = if notifier { 4 } else { 0 };
        let region_len =
            (ring_size + pool_entries as usize * entry_size + notifier_size + 7) & !7;

        let mem = vec![0u64; region_len / 8].into_boxed_slice();
        let base = mem.as_ptr() as u64;
        let geo = RingGeometry {
            ring_entries,
            queue_index: 7,
            region_offset: 0,
            region_size: region_len as u32,
            ring_size: ring_size as u32,
            used_offset: used_off as u32,
            ext_addr: base + ring_size as u64,
            notifier_size: notifier_size as u32,
        };
        FakeRing {
            mem,
            geo,
            region_len,
            avail_seen: 0,
            used_idx: 0,
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.mem.as_ptr() as *mut u8
    }

    pub(crate) fn len(&self) -> usize {
        self.region_len
    }

    pub(crate) fn doorbell(&self) -> *mut u32 {
        unsafe {
            self.base()
                .add(self.region_len - self.geo.notifier_size as usize) as *mut u32
        }
    }

    pub(crate) fn doorbell_value(&self) -> u32 {
        unsafe { (self.doorbell() as *const u32).read_volatile() }
    }

    fn num(&self) -> u16 {
        self.geo.ring_entries
    }

    fn avail_idx_ptr(&self) -> *const u16 {
        unsafe { self.base().add(self.num() as usize * 16 + 2) as *const u16 }
    }

    fn avail_ring_ptr(&self) -> *const u16 {
        unsafe { self.base().add(self.num() as usize * 16 + 4) as *const u16 }
    }

    fn used_idx_ptr(&self) -> *mut u16 {
        unsafe { self.base().add(self.geo.used_offset as usize + 2) as *mut u16 }
    }

    fn used_ring_ptr(&self) -> *mut VringUsedElem {
        unsafe { self.base().add(self.geo.used_offset as usize + 4) as *mut VringUsedElem }
    }

    /// Device side: consume the next available descriptor, if any.
    pub(crate) fn device_pop(&mut self) -> Option<DeviceDesc> {
        let avail_idx = unsafe { self.avail_idx_ptr().read_volatile() };
        if avail_idx == self.avail_seen {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = (self.avail_seen % self.num()) as usize;
        let index = unsafe { self.avail_ring_ptr().add(slot).read_volatile() };
        self.avail_seen = self.avail_seen.wrapping_add(1);

        let desc =
            unsafe { ptr::read_volatile((self.base() as *const VringDesc).add(index as usize)) };
        Some(DeviceDesc {
            index,
            addr: desc.addr,
            len: desc.len,
            device_writable: desc.flags & 2 != 0,
        })
    }

    /// Device side: mark descriptor `id` as used, carrying `len` bytes.
    pub(crate) fn device_push_used(&mut self, id: u16, len: u32) {
        let slot = (self.used_idx % self.num()) as usize;
        unsafe {
            self.used_ring_ptr().add(slot).write_volatile(VringUsedElem {
                id: id as u32,
                len,
            });
        }
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        unsafe { self.used_idx_ptr().write_volatile(self.used_idx) };
    }
}

/// Control path stub that acknowledges teardown and doorbell commands and
/// rejects everything else. Enough for data-path unit tests.
pub(crate) struct StubControlPath {
    pub(crate) doorbells: AtomicUsize,
}

impl ControlPath for StubControlPath {
    fn submit(&self, cmd: Command) -> Result<CompletionKind> {
        match cmd {
            Command::RingDoorbell(..) => {
                self.doorbells.fetch_add(1, Ordering::SeqCst);
                Ok(CompletionKind::RingDoorbell)
            }
            Command::DestroyQp(_) => Ok(CompletionKind::DestroyQp),
            Command::DestroyCq(_) => Ok(CompletionKind::DestroyCq),
            Command::DestroyAh(_) => Ok(CompletionKind::DestroyAh),
            Command::DeallocPd(_) => Ok(CompletionKind::DeallocPd),
            other => Err(Error::Control(format!("unexpected command {:?}", other))),
        }
    }

    fn map_queue(&self, _offset: u64, _len: usize) -> Result<mmap::Mmap> {
        Err(Error::Control("stub has no queue regions".to_string()))
    }
}

pub(crate) fn null_service() -> Service {
    Arc::new(StubControlPath {
        doorbells: AtomicUsize::new(0),
    })
}

pub(crate) fn counting_service() -> Arc<StubControlPath> {
    Arc::new(StubControlPath {
        doorbells: AtomicUsize::new(0),
    })
}
