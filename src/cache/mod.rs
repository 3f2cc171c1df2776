//! Switch cache bookkeeping.
//!
//! - [`allocator`]: first-fit slot allocation over the value tables
//! - [`ids`]: counter/validity register indices
//! - [`directory`]: key -> switch location, value striping and publication

pub mod allocator;
pub mod directory;
pub mod ids;
