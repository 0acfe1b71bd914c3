//! Core types for the tally task index.
//!
//! This crate holds the pieces every other tally crate shares: the task data
//! model, the checklist line parser, document fingerprints, configuration and
//! the error type.

pub mod config;
pub mod error;
pub mod hash;
pub mod parser;
pub mod types;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use hash::{fingerprint, FileStateHash};
pub use parser::{parse_line, parse_line_strict, render_line, with_block_id, LineParser, ParsedLine};

// Re-export main types for convenience
pub use types::{CacheStatus, ListItem, Location, Task, TaskId, TaskInstance};
