//! Blocking primitives (C10): counting semaphores and mutexes layered on
//! the task queues (C8) and scheduler (C9).
//!
//! Grounded on spec.md §4.9's prose description — there is no single
//! `original_source` file this corresponds to 1:1 (the kernel this core
//! grew out of spreads semaphore/mutex across `klib/semaphore.c` and
//! `klib/mutex.c`), so both are built directly from the invariant spec.md
//! §3 states: `0 ≤ current_count ≤ max_count`, and the waiters queue is
//! nonempty only while `current_count == max_count`.

pub mod mutex;
pub mod semaphore;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
