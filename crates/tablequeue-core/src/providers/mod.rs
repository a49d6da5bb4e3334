//! Storage engine implementations.
//!
//! This module contains concrete implementations of the [`QueueStorage`]
//! trait.
//!
//! [`QueueStorage`]: crate::storage::QueueStorage

pub mod memory;

pub use memory::{InMemoryStorage, InMemoryTransaction};
