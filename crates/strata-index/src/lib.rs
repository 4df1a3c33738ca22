//! Concurrent B+tree index for Strata.
//!
//! This crate provides:
//! - An ordered tree of tiers tolerating any number of equal keys
//! - Lock-coupled readers and a single escalating writer per tree
//! - Queries with deferred, batched tier writes
//! - Cursors that iterate leaves in key order
//! - A pluggable tier store, in memory or over encoded pages

mod copacetic;
mod cursor;
mod decision;
mod descent;
mod level;
mod mutation;
mod operation;
mod query;
mod schema;
mod storage;
mod tier;

pub use cursor::Cursor;
pub use query::{Query, Strata};
pub use schema::{FieldExtractor, Schema};
pub use storage::{decode_tier, encode_tier, InMemoryStorage, PagedStorage, Record, Storage};
pub use tier::{Branch, Bucket, ChildType, InnerTier, LeafTier, Tier, TierBody, TierRef};
