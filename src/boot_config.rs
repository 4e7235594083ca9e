//! Compile-time tunables. The kernel this core grew out of hardcoded these
//! as preprocessor macros scattered across the files that used them; they
//! are collected here as `pub const` items since there is no runtime
//! configuration surface at this layer (no filesystem, no argv).

/// Size of a physical page / page table entry's mapped region, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages a single heap segment grows by when the allocator needs
/// more address space. Taken from the heap allocator this module is
/// modeled on (`NPAGES_PER_SEGMENT`).
pub const NPAGES_PER_SEGMENT: usize = 16;

/// Minimum segment allocation in bytes (`NPAGES_PER_SEGMENT * PAGE_SIZE`).
pub const MIN_SEGMENT_ALLOC: usize = NPAGES_PER_SEGMENT * PAGE_SIZE;

/// Alignment guaranteed to every heap allocation — `max_align_t` on i386.
pub const HEAP_ALIGNMENT: usize = 8;

/// Length of a round-robin time slice, in nanoseconds, before a running
/// task becomes eligible for preemption.
pub const TIME_SLICE_NS: u64 = 50_000_000;

/// Upper bound on the number of memory-map segments accepted from the boot
/// handoff record.
pub const MEMMAP_SEGMENT_MAX: usize = 32;

/// Number of entries in a page directory / page table (i386 two-level
/// paging, 4 bytes per entry).
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Initial capacity of the timed-event queue before it first grows.
pub const TIMER_QUEUE_INITIAL_CAPACITY: usize = 10;

/// Size of the architecture's interrupt vector table (i386: 256 IDT
/// entries).
pub const N_INTERRUPT_VECTORS: usize = 256;

/// One `{base, length}` run of usable physical memory, as reported by
/// whatever bootloader protocol the (out-of-scope) boot stub parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySegment {
    pub base: usize,
    pub length: usize,
}

/// Architecture-independent boot handoff record, built by the boot stub
/// before it calls [`crate::core_init`]. Grounded on
/// `original_source/kernel/include/arch/boot.h`'s `struct boot_data`: an
/// initrd location, the total installed memory, and a fixed-size array of
/// memory-map segments (`mmap_len` of the `mmap` array are populated, the
/// rest are left zeroed).
#[derive(Debug, Clone, Copy)]
pub struct BootData {
    pub initrd_base: usize,
    pub initrd_size: usize,
    pub mem_size: usize,
    pub mmap_len: usize,
    pub mmap: [MemorySegment; MEMMAP_SEGMENT_MAX],
    pub kernel_start: usize,
    pub kernel_end: usize,
}

impl BootData {
    /// The populated prefix of [`BootData::mmap`], as `(base, length)`
    /// pairs — the shape [`crate::memory::frame_allocator::FrameAllocator::init`]
    /// wants.
    pub fn memory_map(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.mmap[..self.mmap_len].iter().map(|seg| (seg.base, seg.length))
    }
}
