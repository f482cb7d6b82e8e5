//! Command-line surface

pub mod config;
pub mod options;
