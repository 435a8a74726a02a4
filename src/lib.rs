#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod blueprint;
mod config;
mod core;
mod engine;
mod error;
mod graph;
mod staleness;
mod state;
mod task;
mod utils;

pub use crate::artifact::Artifact;
pub use crate::blueprint::TaskDef;
pub use crate::config::{Config, DATA_DIR, STATE_DIR};
pub use crate::core::{Dynamic, Fingerprint, NEVER, ParseFingerprintError};
pub use crate::engine::{
    ArtifactEntry, Diagnostics, Engine, Execution, TaskExecution, TaskStatus,
};
pub use crate::error::*;
pub use crate::graph::{EdgeSnapshot, GraphSnapshot};
pub use crate::staleness::Staleness;
pub use crate::task::{Declaration, Registration, Task, TaskContext};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
