//! The device context: the entry point that verifies the command ABI and
//! creates every other resource.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use virtio_rdma_api as api;
use virtio_rdma_api::{AccessFlags, AhAttr, QpInitAttr};

use crate::cmd::{rx_match, Command, ControlPath, Service};
use crate::cq::CompletionQueue;
use crate::qp::QueuePair;
use crate::{wire, Error, Result};

pub struct Context {
    service: Service,
    fw_ver: u64,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("fw_ver", &self.fw_ver)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Opens the device context. Fails when the device speaks a different
    /// command ABI than this driver.
    pub fn new(service: Arc<dyn ControlPath>) -> Result<Context> {
        let resp = service.submit(Command::GetContext)?;
        rx_match!(resp, GetContext, info, {
            if info.abi_version != wire::VIRTIO_RDMA_ABI_VERSION {
                return Err(Error::ProtocolMismatch(format!(
                    "device command ABI {} does not match driver ABI {}",
                    info.abi_version,
                    wire::VIRTIO_RDMA_ABI_VERSION
                )));
            }
            log::info!("opened virtio-rdma context, fw_ver {:#x}", info.fw_ver);
            Ok(Context {
                service,
                fw_ver: info.fw_ver,
            })
        })
    }

    #[inline]
    pub fn fw_ver(&self) -> u64 {
        self.fw_ver
    }

    pub fn alloc_pd(&self) -> Result<ProtectionDomain> {
        let resp = self.service.submit(Command::AllocPd)?;
        rx_match!(resp, AllocPd, ret, {
            Ok(ProtectionDomain {
                handle: ret.handle,
                pdn: ret.pdn,
                service: Service::clone(&self.service),
                freed: AtomicBool::new(false),
            })
        })
    }

    pub fn create_cq(&self, min_cqe: u32) -> Result<CompletionQueue> {
        CompletionQueue::create(&self.service, min_cqe)
    }

    pub fn create_qp(&self, pd: &ProtectionDomain, attr: QpInitAttr) -> Result<QueuePair> {
        QueuePair::create(&self.service, pd.handle, attr)
    }

    /// Registers `len` bytes at `addr` with the device so data-path requests
    /// can reference them by key. The memory is not touched here; posting a
    /// request against it is the unsafe step.
    pub fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegion> {
        let resp = self
            .service
            .submit(Command::RegMr(pd.handle, addr, len, access))?;
        rx_match!(resp, RegMr, ret, {
            Ok(MemoryRegion {
                handle: ret.handle,
                lkey: ret.lkey,
                rkey: ret.rkey,
                service: Service::clone(&self.service),
                freed: AtomicBool::new(false),
            })
        })
    }

    pub fn create_ah(&self, pd: &ProtectionDomain, attr: AhAttr) -> Result<AddressHandle> {
        let resp = self.service.submit(Command::CreateAh(pd.handle, attr))?;
        rx_match!(resp, CreateAh, ret, {
            Ok(AddressHandle {
                handle: ret.handle,
                ah_num: ret.ah_num,
                service: Service::clone(&self.service),
                freed: AtomicBool::new(false),
            })
        })
    }
}

pub struct ProtectionDomain {
    handle: api::ProtectionDomain,
    pdn: u32,
    service: Service,
    freed: AtomicBool,
}

impl ProtectionDomain {
    #[inline]
    pub fn handle(&self) -> api::ProtectionDomain {
        self.handle
    }

    #[inline]
    pub fn pdn(&self) -> u32 {
        self.pdn
    }

    pub fn dealloc(&self) -> Result<()> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = self
            .service
            .submit(Command::DeallocPd(self.handle))
            .map_err(|e| e.teardown())?;
        rx_match!(resp, DeallocPd).map_err(|e| e.teardown())
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        if !self.freed.load(Ordering::SeqCst) {
            self.service
                .as_ref()
                .submit_or_warn(Command::DeallocPd(self.handle));
        }
    }
}

pub struct MemoryRegion {
    handle: api::MemoryRegion,
    lkey: u32,
    rkey: u32,
    service: Service,
    freed: AtomicBool,
}

impl MemoryRegion {
    #[inline]
    pub fn handle(&self) -> api::MemoryRegion {
        self.handle
    }

    /// Key for local scatter-gather references.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Key a peer uses to address this region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn dereg(&self) -> Result<()> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = self
            .service
            .submit(Command::DeregMr(self.handle))
            .map_err(|e| e.teardown())?;
        rx_match!(resp, DeregMr).map_err(|e| e.teardown())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.freed.load(Ordering::SeqCst) {
            self.service
                .as_ref()
                .submit_or_warn(Command::DeregMr(self.handle));
        }
    }
}

pub struct AddressHandle {
    handle: api::AddressHandle,
    ah_num: u32,
    service: Service,
    freed: AtomicBool,
}

impl AddressHandle {
    #[inline]
    pub fn handle(&self) -> api::AddressHandle {
        self.handle
    }

    /// Device-assigned number referenced by datagram send requests.
    #[inline]
    pub fn ah_num(&self) -> u32 {
        self.ah_num
    }

    pub fn destroy(&self) -> Result<()> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = self
            .service
            .submit(Command::DestroyAh(self.handle))
            .map_err(|e| e.teardown())?;
        rx_match!(resp, DestroyAh).map_err(|e| e.teardown())
    }
}

impl Drop for AddressHandle {
    fn drop(&mut self) {
        if !self.freed.load(Ordering::SeqCst) {
            self.service
                .as_ref()
                .submit_or_warn(Command::DestroyAh(self.handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{returned, CompletionKind};
    use std::sync::atomic::AtomicUsize;
    use virtio_rdma_api::Handle;

    struct CountingControl {
        abi_version: u32,
        dealloc_count: AtomicUsize,
    }

    impl ControlPath for CountingControl {
        fn submit(&self, cmd: Command) -> Result<CompletionKind> {
            match cmd {
                Command::GetContext => Ok(CompletionKind::GetContext(returned::ContextInfo {
                    abi_version: self.abi_version,
                    fw_ver: 0x100,
                })),
                Command::AllocPd => Ok(CompletionKind::AllocPd(returned::ProtectionDomain {
                    handle: api::ProtectionDomain(Handle(5)),
                    pdn: 1,
                })),
                Command::DeallocPd(_) => {
                    self.dealloc_count.fetch_add(1, Ordering::SeqCst);
                    Ok(CompletionKind::DeallocPd)
                }
                Command::RegMr(..) => Ok(CompletionKind::RegMr(returned::MemoryRegion {
                    handle: api::MemoryRegion(Handle(6)),
                    lkey: 0x10,
                    rkey: 0x20,
                })),
                Command::DeregMr(_) => Ok(CompletionKind::DeregMr),
                Command::CreateAh(..) => Ok(CompletionKind::CreateAh(returned::AddressHandle {
                    handle: api::AddressHandle(Handle(7)),
                    ah_num: 2,
                })),
                Command::DestroyAh(_) => Ok(CompletionKind::DestroyAh),
                other => Err(Error::Control(format!("unexpected command {:?}", other))),
            }
        }

        fn map_queue(&self, _offset: u64, _len: usize) -> Result<mmap::Mmap> {
            Err(Error::Control("no queue regions in this test".to_string()))
        }
    }

    fn control(abi_version: u32) -> Arc<CountingControl> {
        Arc::new(CountingControl {
            abi_version,
            dealloc_count: AtomicUsize::new(0),
        })
    }

    #[test]
    fn context_rejects_a_foreign_abi() {
        let err = Context::new(control(wire::VIRTIO_RDMA_ABI_VERSION + 1)).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[test]
    fn context_reports_the_firmware_version() {
        let ctx = Context::new(control(wire::VIRTIO_RDMA_ABI_VERSION)).unwrap();
        assert_eq!(ctx.fw_ver(), 0x100);
    }

    #[test]
    fn resources_carry_their_device_keys() {
        let ctx = Context::new(control(wire::VIRTIO_RDMA_ABI_VERSION)).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        assert_eq!(pd.pdn(), 1);

        let buf = [0u8; 64];
        let mr = ctx
            .reg_mr(&pd, buf.as_ptr() as u64, buf.len(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        assert_eq!(mr.lkey(), 0x10);
        assert_eq!(mr.rkey(), 0x20);

        let ah = ctx
            .create_ah(
                &pd,
                AhAttr {
                    dlid: 3,
                    sl: 0,
                    src_path_bits: 0,
                    port_num: 1,
                    is_global: false,
                },
            )
            .unwrap();
        assert_eq!(ah.ah_num(), 2);
    }

    #[test]
    fn drop_releases_the_pd_exactly_once() {
        let service = control(wire::VIRTIO_RDMA_ABI_VERSION);
        let ctx = Context::new(service.clone()).unwrap();
        {
            let pd = ctx.alloc_pd().unwrap();
            pd.dealloc().unwrap();
            // drop must not send a second DeallocPd
        }
        assert_eq!(service.dealloc_count.load(Ordering::SeqCst), 1);

        {
            let _pd = ctx.alloc_pd().unwrap();
        }
        assert_eq!(service.dealloc_count.load(Ordering::SeqCst), 2);
    }
}
