//! Add-on error types.
//!
//! Every error here is scoped to a single add-on; none of them aborts a run.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::types::ReleaseStrategy;
use crate::pool::PoolError;

/// Failure to produce the bytes behind a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection or body transfer failed.
    #[error("error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-success status.
    #[error("error fetching {url}: {status}")]
    Status { url: String, status: u16 },

    /// Body could not be copied into the destination.
    #[error("error copying data from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: io::Error,
    },

    /// Cache file could not be read or written.
    #[error("cache error on {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The network pool rejected or lost the request.
    #[error("network pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Failure to determine the current release artifact.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("error fetching {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: FetchError,
    },

    #[error("error decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Neither the manifest nor the fallback scan produced an asset.
    #[error("no matching asset found")]
    NoAssetFound,

    /// The release manifest names a mainline file the release does not carry.
    #[error("no matching asset found from release manifest (expected {filename})")]
    ManifestAssetMissing { filename: String },

    #[error("did not find valid ref for {name}")]
    NoTaggedRef { name: String },
}

/// Failure while replacing an add-on's directories.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("error removing previously installed addon dir {}: {source}", path.display())]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stored owned directory is not a plain directory name.
    #[error("refusing to remove invalid owned dir {0:?}")]
    InvalidOwnedDir(String),

    #[error("error creating dir {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error writing file {}: {source}", path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Entry name would escape the destination directory.
    #[error("archive entry {0:?} has an unsafe path")]
    UnsafePath(String),

    #[error("error reading archive entry {index}: {source}")]
    Entry {
        index: usize,
        #[source]
        source: zip::result::ZipError,
    },

    /// Some file units never reported success (panicked or skipped).
    #[error("error unzipping archive: {written} of {expected} files written")]
    Incomplete { written: usize, expected: usize },

    #[error("disk pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Add-on scoped update failure, as reported in a run status.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("could not find update data for {addon}: {source}")]
    Resolve {
        addon: String,
        #[source]
        source: ResolveError,
    },

    #[error("resolved a {found} asset for {addon}, configured for {expected}")]
    StrategyMismatch {
        addon: String,
        expected: ReleaseStrategy,
        found: ReleaseStrategy,
    },

    #[error("unable to download update for {addon}: {source}")]
    Download {
        addon: String,
        #[source]
        source: FetchError,
    },

    #[error("addon update for {addon} not zip format: {source}")]
    NotZip {
        addon: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("error extracting update for {addon}: {source}")]
    Extract {
        addon: String,
        #[source]
        source: ExtractError,
    },

    /// The update task died without reporting a status.
    #[error("update task for {addon} did not complete: {reason}")]
    Aborted { addon: String, reason: String },
}
