//! CLI module for the cascade-impact engine

pub mod commands;
pub mod format;

pub use commands::*;
pub use format::*;
