//! Virtual page allocator (C3): composes the frame allocator (C1) and the
//! paging layer (C2) into "give me N pages of usable kernel memory" and its
//! inverse. Low-memory requests use the linear map, so no page table
//! entries need to be installed — `virt = P2L(phys)` is already valid the
//! moment the frame exists.
//!
//! Grounded on `original_source/kernel/memory/vmem_manager.c`.

use crate::arch;
use crate::boot_config::PAGE_SIZE;
use crate::kerrno::Errno;
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::{AddrOps, VirtAddr};
use bitflags::bitflags;
use core::ptr;

bitflags! {
    /// Options accepted by [`request_free_page`]/[`request_free_pages`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageOpts: u32 {
        /// Zero the returned pages before handing them back.
        const CLEAR = 1 << 0;
        /// Reserved: high memory not identity/linearly mapped. Not
        /// implemented in this core — requesting it is a caller bug.
        const HIGHMEM = 1 << 1;
    }
}

/// Allocates a single page of kernel-visible virtual memory, or
/// [`Errno::Nomem`] if no physical frame is available.
///
/// # Panics
///
/// If [`PageOpts::HIGHMEM`] is set — reserved, not implemented.
pub fn request_free_page(frames: &FrameAllocator, opts: PageOpts) -> Result<VirtAddr, Errno> {
    if opts.contains(PageOpts::HIGHMEM) {
        crate::kpanic!("request_free_page: HIGHMEM is reserved and not implemented");
    }

    let phys = frames.alloc_page()?;
    let virt = arch::p2l(phys);
    if opts.contains(PageOpts::CLEAR) {
        unsafe { ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE) };
    }
    Ok(virt)
}

/// Allocates `8 * n` contiguous pages of kernel-visible virtual memory.
///
/// # Panics
///
/// If [`PageOpts::HIGHMEM`] is set.
pub fn request_free_pages(frames: &FrameAllocator, opts: PageOpts, n: usize) -> Result<VirtAddr, Errno> {
    if opts.contains(PageOpts::HIGHMEM) {
        crate::kpanic!("request_free_pages: HIGHMEM is reserved and not implemented");
    }

    let phys = frames.alloc_pages(n)?;
    let virt = arch::p2l(phys);
    if opts.contains(PageOpts::CLEAR) {
        unsafe { ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE * 8 * n) };
    }
    Ok(virt)
}

/// Frees a page (or `n=0` single page / `8*n`-frame group) previously
/// returned by [`request_free_page`]/[`request_free_pages`].
pub fn free_page(frames: &FrameAllocator, virt: VirtAddr, n: usize) {
    assert!(virt.is_page_aligned());
    frames.free(arch::l2p(virt), n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::fake_backing_region;

    #[test]
    fn request_then_free_roundtrips() {
        let frames = FrameAllocator::new();
        frames.mark_region(fake_backing_region(16), 16 * PAGE_SIZE, true);

        let virt = request_free_page(&frames, PageOpts::empty()).unwrap();
        assert_eq!(frames.available_frames(), 15);

        free_page(&frames, virt, 0);
        assert_eq!(frames.available_frames(), 16);
    }

    #[test]
    fn clear_option_zeroes_the_page() {
        let frames = FrameAllocator::new();
        frames.mark_region(fake_backing_region(1), PAGE_SIZE, true);

        let virt = request_free_page(&frames, PageOpts::CLEAR).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(virt as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "HIGHMEM")]
    fn highmem_panics() {
        let frames = FrameAllocator::new();
        let _ = request_free_page(&frames, PageOpts::HIGHMEM);
    }

    #[test]
    fn exhaustion_returns_nomem() {
        let frames = FrameAllocator::new();
        frames.mark_region(fake_backing_region(1), PAGE_SIZE, true);
        request_free_page(&frames, PageOpts::empty()).unwrap();
        assert_eq!(request_free_page(&frames, PageOpts::empty()), Err(Errno::Nomem));
    }
}
