//! A small mmap wrapper on top of nix. The driver maps queue regions the
//! device describes by (offset, length) on the command fd; tests map memfds.
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

#[derive(Debug, Clone)]
pub struct MmapOptions {
    /// Mapped length. Mandatory; queue regions are not whole files.
    map_len: Option<usize>,
    /// Memory protection flags
    prot_flags: ProtFlags,
    /// Additional parameter for mmap
    map_flags: MapFlags,
    /// The file descriptor to the memory object
    fd: Option<RawFd>,
    /// The map starts at `file_off` offset in the memory object. `file_off` must be
    /// a multiple of the page size as returned by sysconf(_SC_PAGE_SIZE).
    file_off: i64,
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self {
            map_len: None,
            prot_flags: ProtFlags::empty(),
            map_flags: MapFlags::empty(),
            fd: None,
            file_off: 0,
        }
    }
}

impl MmapOptions {
    pub fn new() -> Self {
        MmapOptions::default()
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.file_off = i64::try_from(offset).expect("invalid arguments");
        self
    }

    pub fn len(&mut self, len: usize) -> &mut Self {
        self.map_len = Some(len);
        self
    }

    pub fn set_fd(&mut self, fd: RawFd) -> &mut Self {
        self.fd = Some(fd);
        self
    }

    /* ==================== Mmap Flags ==================== */
    pub fn shared(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_SHARED, enable);
        self
    }

    pub fn private(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_PRIVATE, enable);
        self
    }

    pub fn anon(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_ANONYMOUS, enable);
        self
    }

    /* ==================== Protection Flags ==================== */
    pub fn read(&mut self, enable: bool) -> &mut Self {
        self.prot_flags.set(ProtFlags::PROT_READ, enable);
        self
    }

    pub fn write(&mut self, enable: bool) -> &mut Self {
        self.prot_flags.set(ProtFlags::PROT_WRITE, enable);
        self
    }

    pub fn mmap(&self) -> io::Result<Mmap> {
        let map_len = self
            .map_len
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping length not set"))?;
        let fd = self.fd.unwrap_or(-1);
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                map_len,
                self.prot_flags,
                self.map_flags,
                fd,
                self.file_off,
            )?
        };

        Ok(Mmap { ptr, len: map_len })
    }
}

#[repr(C)]
pub struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr, self.len).unwrap_or_else(|e| eprintln!("failed to munmap: {}", e))
        };
    }
}

impl Mmap {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Returns an unsafe mutable pointer to the mapping. The other side of
    /// the mapping is the device; reads and writes through this pointer race
    /// with it by design and must follow the ring's ordering protocol.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }
}

// The mapping itself is plain process-shared memory. Synchronization with
// the device is the ring protocol's job, not the mapping's.
unsafe impl Sync for Mmap {}
unsafe impl Send for Mmap {}

impl Deref for Mmap {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

impl DerefMut for Mmap {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

impl AsRef<[u8]> for Mmap {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}

impl fmt::Debug for Mmap {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Mmap")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
