//! Offset tracking and storage
//!
//! [`OffsetTracker`] follows what has been processed on each owned partition
//! and commits it through an [`OffsetStore`]. The committed value of a
//! partition is the last processed offset; consumption resumes one past it.

pub mod store;
pub mod tracker;

pub use store::{CommitPoint, Fence, OffsetStore};
pub use tracker::OffsetTracker;
