//! Repository implementations for database operations

pub mod strategies;

pub use strategies::*;
