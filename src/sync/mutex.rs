//! Mutex (C10): a semaphore of `max_count = 1`, per spec.md §4.9.

use super::Semaphore;

pub struct Mutex(Semaphore);

impl Mutex {
    pub const fn new() -> Self {
        Mutex(Semaphore::new(1, 0))
    }

    pub fn lock(&self) {
        self.0.acquire();
    }

    pub fn unlock(&self) {
        self.0.release();
    }

    pub fn is_locked(&self) -> bool {
        self.0.current_count() == 1
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::FrameAllocator;
    use crate::memory::test_support::fake_backing_region;
    use crate::sched;
    use crate::task::{self, TaskState};

    fn frames_with(pages: usize) -> FrameAllocator {
        let frames = FrameAllocator::new();
        frames.mark_region(fake_backing_region(pages), pages * crate::boot_config::PAGE_SIZE, true);
        frames
    }

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        loop {}
    }

    fn reset() -> (FrameAllocator, core::ptr::NonNull<task::Tcb>) {
        sched::reset_for_test();
        let frames = frames_with(16);
        let root = task::create_root_task();
        sched::set_current_task_for_test(Some(root));
        (frames, root)
    }

    #[test]
    fn lock_then_unlock_roundtrips() {
        let (_frames, _root) = reset();
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        mutex.lock();
        assert!(mutex.is_locked());
        mutex.unlock();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn second_locker_blocks_until_release() {
        let (frames, root) = reset();
        let mutex = Mutex::new();
        mutex.lock();

        let waiter = task::create_task(&frames, dummy_entry, 0).unwrap();
        sched::unblock(waiter);
        sched::set_current_task_for_test(Some(waiter));
        mutex.lock();
        assert_eq!(unsafe { waiter.as_ref() }.state(), TaskState::Blocked);

        sched::set_current_task_for_test(Some(root));
        mutex.unlock();
        assert_eq!(unsafe { waiter.as_ref() }.state(), TaskState::ReadyToRun);
        assert!(mutex.is_locked());
    }
}
