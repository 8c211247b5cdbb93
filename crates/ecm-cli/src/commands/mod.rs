//! Command implementations.

pub mod image;
pub mod migrate;
