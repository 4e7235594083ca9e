//! Bitmap physical frame allocator (C1).
//!
//! One bit per 4 KiB frame across the whole 32-bit physical address space:
//! 2^32 / PAGE_SIZE / 8 = 131072 bytes, so the bitmap itself is a fixed-size
//! static array rather than something sized off the actual amount of
//! installed RAM. Simple and not space-efficient, but the word-at-a-time
//! scan with a search hint keeps allocation cheap in practice.
//!
//! Grounded on `original_source/kernel/memory/page_frame_manager.c`: the
//! same bitmap-plus-hint design, the same 8-frame group granularity for
//! `alloc_pages`/`free` (`original_source` calls a group of 8 frames a
//! "page", matching the boot_config `NPAGES_PER_SEGMENT` convention of
//! counting in units of 8 frames throughout the heap/page layers).

use crate::boot_config::PAGE_SIZE;
use crate::data_structures::bitmap::Bitmap;
use crate::kerrno::Errno;
use crate::memory::{AddrOps, PhysAddr};
use spin::Mutex;

/// 4 GiB of address space / PAGE_SIZE frames / 8 bits per byte.
const BITMAP_BYTES: usize = (1usize << 32) / PAGE_SIZE / 8;

/// Frames per group — `alloc_pages(n)` hands out `8n` consecutive frames,
/// one group at a time.
pub const FRAMES_PER_GROUP: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameAllocatorStats {
    pub total: usize,
    pub available: usize,
}

struct Inner {
    bitmap: Bitmap<BITMAP_BYTES>,
    /// Byte index to resume the next single-frame search from. A frame
    /// freed at a lower index pulls this back down so the search doesn't
    /// miss it.
    first_available_byte: usize,
    n_available_frames: usize,
    n_frames: usize,
}

unsafe impl Send for Inner {}

pub struct FrameAllocator(Mutex<Inner>);

impl FrameAllocator {
    pub const fn new() -> Self {
        FrameAllocator(Mutex::new(Inner {
            bitmap: Bitmap::new(None),
            first_available_byte: 0,
            n_available_frames: 0,
            n_frames: 0,
        }))
    }

    /// Initialises the bitmap from a boot memory map: marks every `{base,
    /// length}` segment available, then carves the kernel image's own
    /// frames back out as unavailable, per spec.md §3's "the kernel
    /// image's frames are never free" invariant.
    pub fn init(&self, memmap: &[(PhysAddr, usize)], kernel_start: PhysAddr, kernel_end: PhysAddr) {
        crate::assert_called_once!("FrameAllocator::init() must not be called more than once");
        for &(base, length) in memmap {
            let base = base.align_down(PAGE_SIZE);
            let length = length.align_down(PAGE_SIZE);
            if length > 0 {
                self.mark_region(base, length, true);
            }
        }

        let k_start = kernel_start.align_down(PAGE_SIZE);
        let k_end = kernel_end.align_up(PAGE_SIZE);
        self.mark_region(k_start, k_end - k_start, false);
    }

    /// Marks `[addr, addr + length)` as available or unavailable. `addr`
    /// and `length` must both be page-aligned. Callers run this once per
    /// memory-map segment at boot, then again to carve the kernel image's
    /// own frames back out as unavailable.
    pub fn mark_region(&self, addr: PhysAddr, length: usize, available: bool) {
        assert!(addr.is_page_aligned());
        assert!(length.is_page_aligned());

        let mut inner = self.0.lock();
        let start_frame = addr / PAGE_SIZE;
        let end_frame = (addr + length) / PAGE_SIZE;

        for frame in start_frame..end_frame {
            let was_available = inner.bitmap.get(frame).unwrap_or(false);
            inner.bitmap.set(frame, available);

            match (was_available, available) {
                (false, true) => inner.n_available_frames += 1,
                (true, false) => inner.n_available_frames -= 1,
                _ => {}
            }
        }

        if available {
            inner.first_available_byte = 0;
        }
        if inner.n_frames < end_frame {
            inner.n_frames = end_frame;
        }
    }

    /// Allocates one physical frame, returning its base address, or
    /// [`Errno::Nomem`] if none is available.
    pub fn alloc_page(&self) -> Result<PhysAddr, Errno> {
        let mut inner = self.0.lock();
        let frame = inner.find_available_frame().ok_or(Errno::Nomem)?;
        inner.bitmap.set(frame, false);
        inner.n_available_frames -= 1;
        Ok(frame * PAGE_SIZE)
    }

    /// Allocates `8 * n` consecutive frames, returning the base address of
    /// the group. `n == 1` is the common case and is special-cased to a
    /// byte-aligned search for a byte whose value is `0xFF` (all 8 bits of
    /// that byte set), per spec.md §4.1.
    pub fn alloc_pages(&self, n: usize) -> Result<PhysAddr, Errno> {
        assert!(n >= 1);
        let group_frames = FRAMES_PER_GROUP * n;

        let mut inner = self.0.lock();
        let start_frame = inner.find_available_group(group_frames).ok_or(Errno::Nomem)?;

        for frame in start_frame..start_frame + group_frames {
            inner.bitmap.set(frame, false);
        }
        inner.n_available_frames -= group_frames;

        Ok(start_frame * PAGE_SIZE)
    }

    /// Frees a previously-allocated frame (`n == 0`) or an `8 * n`-frame
    /// group, per spec.md §4.1. Panics on a double free or an unaligned
    /// address — both indicate caller bugs, not recoverable conditions.
    pub fn free(&self, addr: PhysAddr, n: usize) {
        assert!(addr.is_page_aligned(), "frame_allocator: unaligned free at {addr:#x}");
        let frame_count = if n == 0 { 1 } else { FRAMES_PER_GROUP * n };
        let start_frame = addr / PAGE_SIZE;

        let mut inner = self.0.lock();
        for frame in start_frame..start_frame + frame_count {
            if inner.bitmap.get(frame).unwrap_or(false) {
                crate::kpanic!("frame_allocator: double free at {:#x}", frame * PAGE_SIZE);
            }
            inner.bitmap.set(frame, true);
        }
        inner.n_available_frames += frame_count;

        let byte = start_frame / 8;
        if byte < inner.first_available_byte {
            inner.first_available_byte = byte;
        }
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        let inner = self.0.lock();
        FrameAllocatorStats { total: inner.n_frames, available: inner.n_available_frames }
    }

    pub fn available_frames(&self) -> usize {
        self.0.lock().n_available_frames
    }

    pub fn total_frames(&self) -> usize {
        self.0.lock().n_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Scans the bitmap four bytes at a time starting from the search
    /// hint, returning the first available frame number.
    fn find_available_frame(&mut self) -> Option<usize> {
        let bitmap_bytes = self.bitmap.len();
        let mut byte = self.first_available_byte & !0b11;

        while byte < bitmap_bytes {
            let word = self.read_word(byte);
            if word != 0 {
                for bit in 0..32 {
                    if word & (1 << bit) != 0 {
                        self.first_available_byte = byte;
                        return Some(byte * 8 + bit);
                    }
                }
            }
            byte += 4;
        }

        None
    }

    /// Finds the first frame number starting a run of `group_frames`
    /// consecutive available frames. For the common `group_frames == 8`
    /// case this degenerates to scanning for a whole byte of `0xFF`.
    fn find_available_group(&mut self, group_frames: usize) -> Option<usize> {
        let bitmap_bytes = self.bitmap.len();

        if group_frames == FRAMES_PER_GROUP {
            for byte in 0..bitmap_bytes {
                if self.bitmap_byte(byte) == 0xFF {
                    return Some(byte * 8);
                }
            }
            return None;
        }

        // General case: groups are always byte-aligned (a multiple of 8
        // frames), so we only need to check every `group_frames / 8`
        // bytes' worth of bits are all set.
        let bytes_needed = group_frames.div_ceil(8);
        let mut byte = 0;
        while byte + bytes_needed <= bitmap_bytes {
            if (byte..byte + bytes_needed).all(|b| self.bitmap_byte(b) == 0xFF) {
                return Some(byte * 8);
            }
            byte += 1;
        }
        None
    }

    fn bitmap_byte(&self, byte: usize) -> u8 {
        unsafe { self.bitmap.data_ptr().add(byte).read() }
    }

    /// Reads 4 bitmap bytes starting at `byte` as one little-endian word.
    /// `byte` is always a multiple of 4 and always within bounds: the
    /// bitmap's byte length is a compile-time constant divisible by 4.
    fn read_word(&self, byte: usize) -> u32 {
        debug_assert!(byte + 4 <= self.bitmap.len());
        let ptr = unsafe { self.bitmap.data_ptr().add(byte) as *const u32 };
        unsafe { ptr.read_unaligned() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_roundtrips() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, 16 * PAGE_SIZE, true);
        assert_eq!(alloc.available_frames(), 16);

        let frame = alloc.alloc_page().unwrap();
        assert_eq!(alloc.available_frames(), 15);

        alloc.free(frame, 0);
        assert_eq!(alloc.available_frames(), 16);
    }

    #[test]
    fn allocate_returns_lowest_available_frame_first() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, 16 * PAGE_SIZE, true);
        alloc.mark_region(0, PAGE_SIZE, false);

        let frame = alloc.alloc_page().unwrap();
        assert_eq!(frame, PAGE_SIZE);
    }

    #[test]
    fn exhausting_all_frames_errors() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, 2 * PAGE_SIZE, true);
        alloc.alloc_page().unwrap();
        alloc.alloc_page().unwrap();
        assert_eq!(alloc.alloc_page(), Err(Errno::Nomem));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_an_already_free_frame_panics() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, PAGE_SIZE, true);
        alloc.free(0, 0);
    }

    #[test]
    fn alloc_pages_returns_an_8_frame_aligned_group() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, 32 * PAGE_SIZE, true);
        // Take frame 0 so the first byte is no longer 0xFF; the next
        // group must come from the second byte (frames 8..16).
        alloc.mark_region(0, PAGE_SIZE, false);

        let group = alloc.alloc_pages(1).unwrap();
        assert_eq!(group, 8 * PAGE_SIZE);
        assert_eq!(alloc.available_frames(), 32 - 1 - 8);
    }

    #[test]
    fn alloc_pages_exhaustion_errors() {
        let alloc = FrameAllocator::new();
        alloc.mark_region(0, 8 * PAGE_SIZE, true);
        alloc.alloc_pages(1).unwrap();
        assert_eq!(alloc.alloc_pages(1), Err(Errno::Nomem));
    }

    #[test]
    fn init_excludes_kernel_range() {
        let alloc = FrameAllocator::new();
        alloc.init(&[(0, 16 * PAGE_SIZE)], 4 * PAGE_SIZE, 6 * PAGE_SIZE);
        let stats = alloc.stats();
        assert_eq!(stats.total, 16);
        assert_eq!(stats.available, 14);
    }
}
