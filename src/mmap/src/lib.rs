//! Process-shared memory mappings of device-exposed byte ranges.
mod mmap;

pub use crate::mmap::{Mmap, MmapOptions};

/// Returns the system page size. Queue-region offsets handed out by the
/// device are page aligned.
#[inline]
pub fn page_size() -> usize {
    page_size::get()
}
