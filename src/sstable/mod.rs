//! The on-disk table format the engine consumes.
//!
//! Tables are immutable once their file number is committed to a
//! descriptor. The engine only relies on the operations exposed here:
//! open by path and size, point lookup by internal key with a visitor,
//! forward iteration, and approximate offsets. Block caching, bloom
//! filters, and compression live outside this crate.

pub mod block;
pub mod table;

pub use table::{Table, TableBuilder, TableIterator};
