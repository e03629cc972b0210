//! Add-on type definitions.
//!
//! Core data structures shared by the resolver, the extractor and the
//! update coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of concurrent network fetches.
pub const DEFAULT_NET_TASKS: usize = 2;
/// Upper bound on concurrent network fetches.
pub const MAX_NET_TASKS: usize = 8;
/// Default number of concurrent file writes.
pub const DEFAULT_DISK_TASKS: usize = 32;
/// Upper bound on concurrent file writes.
pub const MAX_DISK_TASKS: usize = 4096;
/// Upper bound on add-ons updated at the same time.
pub const MAX_ADDON_TASKS: usize = 64;

/// How an add-on publishes its releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReleaseStrategy {
    /// Formal GitHub release with downloadable assets.
    #[default]
    ReleaseAsset,
    /// Raw tag references, downloaded as source archives.
    TaggedRef,
}

impl TryFrom<u8> for ReleaseStrategy {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ReleaseAsset),
            1 => Ok(Self::TaggedRef),
            other => Err(format!("unknown release type {}", other)),
        }
    }
}

impl From<ReleaseStrategy> for u8 {
    fn from(strategy: ReleaseStrategy) -> Self {
        match strategy {
            ReleaseStrategy::ReleaseAsset => 0,
            ReleaseStrategy::TaggedRef => 1,
        }
    }
}

impl fmt::Display for ReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseAsset => write!(f, "release asset"),
            Self::TaggedRef => write!(f, "tagged ref"),
        }
    }
}

/// Validated "owner/slug" identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddonName {
    full: String,
    split: usize,
}

impl AddonName {
    /// Parses an "owner/slug" name. Exactly one `/` with non-empty,
    /// non-blank parts on both sides is accepted.
    pub fn parse(name: &str) -> Result<Self, String> {
        if name.trim().is_empty() || name.trim() == "/" {
            return Err("addon name cannot be empty or whitespace, expected Project/Addon".into());
        }

        match name.find('/') {
            Some(split)
                if split > 0
                    && split < name.len() - 1
                    && name.matches('/').count() == 1
                    && !name[..split].trim().is_empty()
                    && !name[split + 1..].trim().is_empty() =>
            {
                Ok(Self {
                    full: name.to_string(),
                    split,
                })
            }
            _ => Err("addon name misformatted, expected Project/Addon".into()),
        }
    }

    /// Full "owner/slug" name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Owner part including the separator ("owner/").
    #[must_use]
    pub fn project_part(&self) -> &str {
        &self.full[..=self.split]
    }

    /// Slug part ("slug"), used for cache file names and error messages.
    #[must_use]
    pub fn short_part(&self) -> &str {
        &self.full[self.split + 1..]
    }
}

impl fmt::Display for AddonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Ensures a configured directory ends with a `/`. Idempotent.
#[must_use]
pub fn normalize_dir(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Include/exclude prefixes derived from a raw directory spec.
///
/// Entries starting with `-` are exclusions. Exclusion always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirRules {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl DirRules {
    /// Builds rules from raw user entries, normalizing each one.
    #[must_use]
    pub fn from_spec<S: AsRef<str>>(spec: &[S]) -> Self {
        let mut rules = Self::default();
        for dir in spec {
            let dir = normalize_dir(dir.as_ref());
            match dir.strip_prefix('-') {
                Some(excluded) => rules.exclude.push(excluded.to_string()),
                None => rules.include.push(dir),
            }
        }
        rules
    }

    #[must_use]
    pub fn include_dirs(&self) -> &[String] {
        &self.include
    }

    #[must_use]
    pub fn exclude_dirs(&self) -> &[String] {
        &self.exclude
    }

    /// Returns true if an archive entry path passes the inclusion test.
    #[must_use]
    pub fn should_extract(&self, path: &str) -> bool {
        if self.exclude.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Persisted update state of one add-on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateInfo {
    /// Display label of the installed release.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Upload time of the installed release asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_on: Option<DateTime<Utc>>,
    /// Installed tag reference.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ref_sha: String,
    /// Top-level directories owned on disk, deleted before the next update.
    #[serde(default)]
    pub extracted_dirs: Vec<String>,
}

/// A tracked add-on, ready to be updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Addon {
    pub name: AddonName,
    /// Raw directory rules as configured.
    pub dir_spec: Vec<String>,
    pub rules: DirRules,
    pub strategy: ReleaseStrategy,
    /// Check for updates but never download.
    pub skip: bool,
    pub update_info: UpdateInfo,
}

impl Addon {
    /// Creates an add-on with empty update state.
    pub fn new(name: &str, dir_spec: &[&str], strategy: ReleaseStrategy) -> Result<Self, String> {
        let name = AddonName::parse(name)?;
        let dir_spec: Vec<String> = dir_spec.iter().map(|d| (*d).to_string()).collect();

        Ok(Self {
            rules: DirRules::from_spec(&dir_spec),
            name,
            dir_spec,
            strategy,
            skip: false,
            update_info: UpdateInfo::default(),
        })
    }

    /// Sets the skip flag.
    #[must_use]
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Sets the stored update state.
    #[must_use]
    pub fn with_update_info(mut self, update_info: UpdateInfo) -> Self {
        self.update_info = update_info;
        self
    }
}

/// Artifact kind of a resolved asset.
pub type ReleaseKind = ReleaseStrategy;

/// Remote artifact chosen for download. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAsset {
    pub name: String,
    pub size: u64,
    pub download_url: String,
    pub content_type: String,
    /// Upload time; absent for tag archives.
    pub updated_at: Option<DateTime<Utc>>,
    pub ref_sha: String,
    pub version: String,
    pub kind: ReleaseKind,
}
