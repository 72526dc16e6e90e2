//! Memoization layer for the Soffio document pipeline.
//!
//! Expensive, deterministic async operations (fetching remote images,
//! rendering diagrams) are wrapped with [`memo::MemoCache::wrap`]. Results are
//! shared between concurrent callers, persisted through a
//! [`store::EntryStore`] and evicted per namespace by age.

pub mod config;
pub mod error;
pub mod images;
pub mod infra;
pub mod memo;
pub mod store;
