//! Child process bookkeeping and orphan cleanup

pub mod cleanup;
pub mod tree;

#[cfg(unix)]
pub mod pgid;

pub use cleanup::{kill_all_descendants, CleanupRegistry, TERMINATION_GRACE_PERIOD};

#[cfg(unix)]
pub use pgid::{kill_process_group, ProcessGroupAnchor};
