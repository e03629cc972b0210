//! Add-on update engine.
//!
//! Keeps GitHub-hosted add-ons in sync with their latest release and
//! remembers which directories each one owns on disk.
//!
//! # Architecture
//!
//! - **types**: Core data structures (`Addon`, `DirRules`, `UpdateInfo`, `DownloadAsset`)
//! - **storage**: JSON config load, validation and atomic save
//! - **fetcher**: Cache-aware HTTP fetching, optionally through the network pool
//! - **github**: Release resolution against the GitHub REST API
//! - **installer**: Selective zip extraction on the disk pool
//! - **updater**: Per add-on resolve, compare, download, extract, record
//! - **manager**: Run orchestration, log fan-in and status aggregation
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use addman::addons::{AddonManager, HttpTransport};
//! use addman::style::Palette;
//!
//! let mut manager = AddonManager::load("addons.json".into(), Palette::plain())?;
//! let settings = manager.settings();
//! let report = manager.run(Arc::new(HttpTransport::new()), settings, &mut std::io::stdout())?;
//! println!("{} failed", report.failed());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod fetcher;
pub mod github;
pub mod installer;
pub mod manager;
pub mod storage;
pub mod types;
pub mod updater;

pub use error::{ExtractError, FetchError, ResolveError, UpdateError};
pub use fetcher::{CachedFetcher, Fetch, HttpTransport, PooledFetcher, Transport};
pub use github::{GitHubEndpoints, Resolver};
pub use installer::{extract, open_archive, Archive};
pub use manager::{AddonManager, Orchestrator, RunError, RunReport, RunSettings};
pub use storage::{AddonCfg, AddonManagerCfg, ConfigError, ConfigStore, ValidationReport};
pub use types::{
    Addon, AddonName, DirRules, DownloadAsset, ReleaseKind, ReleaseStrategy, UpdateInfo,
};
pub use updater::{has_update, run_update, AddonLog, AddonStatus, UpdateContext, UpdateOutcome};
