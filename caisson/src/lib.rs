//! Composing a hermetic container runtime view.
//!
//! caisson assembles the root filesystem for a sandboxed native program
//! (typically a game) out of two independent sources: a stable *runtime*
//! image that provides a known `/usr`, and the *host* system's graphics
//! drivers, locale data, and (when newer) libc. The result is a mount
//! plan for a bubblewrap-compatible sandbox launcher, plus a directory
//! of per-architecture overrides that shadow the runtime's libraries
//! where the host's copies must win.
//!
//! The crate is a library; argument parsing and actually spawning the
//! launcher are the caller's business. The typical sequence is:
//!
//!  1. [`Runtime::new`]: validate inputs, lock the runtime image, and
//!     (optionally) prepare a temporary mutable copy of it.
//!  2. [`Runtime::bind`]: compose the container view and fill in a
//!     [`MountPlan`].
//!  3. [`Runtime::append_lock_args`]: hand the runtime lock over to the
//!     process that will outlive us inside the container.

#![warn(missing_docs)]

pub use self::{
    bwrap::MountPlan,
    compose::{Runtime, RuntimeFlags},
    lock::{FileLock, LockError, LockFlags},
};

pub mod arch;
pub mod bwrap;
pub mod capture;
pub mod compose;
pub mod lock;
pub mod probe;
pub mod store;
