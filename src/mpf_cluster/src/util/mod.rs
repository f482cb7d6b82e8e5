//! Small shared helpers

pub mod log_dir;
pub mod logging;
pub mod timestamp;
