//! Addman
//!
//! Keeps a set of GitHub-hosted game add-ons up to date: resolves the
//! current release of each one, downloads it and replaces only the
//! directories the add-on owns.
//!
//! # Architecture
//!
//! - **Addons Module**: Config, release resolution, extraction and run orchestration
//! - **Pool Module**: Bounded worker pools for network, disk and per add-on work
//! - **Style Module**: Terminal colors for user-facing output
//! - **Logging Module**: Diagnostic `tracing` setup

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod addons;
pub mod logging;
pub mod pool;
pub mod style;
pub mod test_utils;

// Re-export main types
pub use addons::{AddonManager, Orchestrator, RunReport, RunSettings};
pub use pool::{PoolError, ResultPool, TaskPool, TaskSubmitter};
pub use style::Palette;
