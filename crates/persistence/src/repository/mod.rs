//! Repository implementations for database operations

pub mod optimization;

pub use optimization::*;
