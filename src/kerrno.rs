//! POSIX-flavoured error taxonomy, mirrored from the `errno.h` this core's
//! kernel used. `Result<T, Errno>` is the return type for every operation
//! spec.md calls a "recoverable error returned to the caller"; invariant
//! violations (double free, unmapping an unmapped page, ...) still go
//! through [`crate::panic::kpanic`], never through `Errno`.

/// Recoverable error codes. Only [`Errno::Inval`], [`Errno::Nomem`] and
/// [`Errno::Already`] are ever produced by this core; the rest exist so a
/// `Result<T, Errno>` can carry the error code of an external collaborator
/// (a driver, a filesystem) through a core API without the core needing to
/// know about that collaborator's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Invalid argument.
    Inval,
    /// Out of memory.
    Nomem,
    /// The resource already exists / is already registered.
    Already,
    /// No such device.
    Nodev,
    /// No such file or directory.
    Noent,
    /// File exists.
    Exist,
    /// Bad file descriptor.
    Badf,
    /// Operation not permitted.
    Perm,
    /// Device or resource busy.
    Busy,
    /// Not a directory.
    Notdir,
    /// Is a directory.
    Isdir,
}

impl Errno {
    /// The numeric value this crate's `Errno` carries at the `-errno.h`
    /// boundary, should a collaborator need it.
    pub const fn as_i32(self) -> i32 {
        match self {
            Errno::Perm => 1,
            Errno::Noent => 2,
            Errno::Badf => 9,
            Errno::Nomem => 12,
            Errno::Exist => 17,
            Errno::Notdir => 20,
            Errno::Isdir => 21,
            Errno::Inval => 22,
            Errno::Nodev => 19,
            Errno::Busy => 16,
            Errno::Already => 114,
        }
    }
}

pub type KResult<T> = Result<T, Errno>;
