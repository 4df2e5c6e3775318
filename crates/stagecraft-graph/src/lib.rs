//! Stagecraft stage graph
//!
//! Static stage dependencies and the staleness rules built on them.
//!
//! - [`StageGraph`]: DAG of stage dependencies with transitive queries
//! - [`FileUnit`]: per-file expansion of CODE_GEN
//! - [`Invalidator`]: recomputes input fingerprints and flags stale stages

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod graph;
mod invalidator;
mod units;

pub use error::GraphError;
pub use graph::StageGraph;
pub use invalidator::{
    stage_input_hash, FileState, Invalidator, Snapshot, StageLineage, StageStatus, StaleReason,
};
pub use units::FileUnit;
