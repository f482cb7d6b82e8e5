//! Command handlers

pub mod check_config;
pub(crate) mod common;
pub(crate) mod signal_handler;
pub mod standalone;

pub use check_config::handle_check_config;
pub use standalone::handle_standalone;
