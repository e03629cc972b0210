//! Add-on config persistence.
//!
//! Reads, validates and writes the JSON config document. The document keeps
//! the shape the user wrote (skip markers, directory order) so saving it back
//! only normalizes directories and refreshes the update state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::types::{
    Addon, AddonName, DirRules, ReleaseStrategy, UpdateInfo, DEFAULT_DISK_TASKS,
    DEFAULT_NET_TASKS, MAX_DISK_TASKS, MAX_NET_TASKS,
};

/// Config errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error saving addons to file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error decoding json config: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("error encoding addons: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("error loading addon manager: {0}")]
    Validation(ValidationReport),
}

/// Problems found for one configured add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonProblems {
    pub name: String,
    /// Zero for the first occurrence of a name, n for its n-th duplicate.
    pub occurrence: usize,
    pub errors: Vec<String>,
}

/// Aggregated validation failures of a config document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub addons: Vec<AddonProblems>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "validation errors found:")?;

        for problems in &self.addons {
            let name = if problems.name.is_empty() {
                "<empty>"
            } else {
                problems.name.as_str()
            };

            if problems.occurrence > 0 {
                writeln!(f, "  {} ({}):", name, problems.occurrence)?;
            } else {
                writeln!(f, "  {}:", name)?;
            }
            for error in &problems.errors {
                writeln!(f, "    - {}", error)?;
            }
        }

        Ok(())
    }
}

/// One entry of the `Addons` list, as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddonCfg {
    /// "Project/Addon"; a leading `-` marks the add-on as skipped.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Top-level dirs to extract; entries starting with `-` are excluded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirs: Vec<String>,

    /// Raw release type code, checked during validation.
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub rel_type: u8,
}

impl AddonCfg {
    /// Name without the skip marker.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        self.name.strip_prefix('-').unwrap_or(&self.name)
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.name.starts_with('-')
    }
}

/// The persisted config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddonManagerCfg {
    #[serde(default)]
    pub addons: Vec<AddonCfg>,

    /// Add-ons not managed by this tool, usually a list of URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmanaged_addons: Vec<String>,

    /// Add-on name to update state.
    #[serde(default)]
    pub update_info: BTreeMap<String, UpdateInfo>,

    /// Development cache; empty disables caching.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cache_dir: String,

    /// Extraction root; empty selects the default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addons_dir: String,

    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub net_tasks: i64,

    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub disk_tasks: i64,
}

fn is_zero_u8(value: &u8) -> bool {
    *value == 0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

impl AddonManagerCfg {
    /// Checks invariants and fixes minor infractions in place.
    ///
    /// Every add-on is checked; all problems are reported together. Task
    /// counts are clamped, dirs get a trailing `/` and every add-on gets an
    /// update state entry, even when validation fails.
    pub fn validate(&mut self) -> Result<(), ValidationReport> {
        let mut report = ValidationReport::default();
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();

        self.net_tasks = self.net_tasks.clamp(0, MAX_NET_TASKS as i64);
        self.disk_tasks = self.disk_tasks.clamp(0, MAX_DISK_TASKS as i64);

        for addon in &mut self.addons {
            let name = addon.canonical_name().to_string();
            let mut errors = Vec::new();

            let count = seen.entry(name.clone()).or_insert(0);
            if *count > 0 {
                errors.push("found duplicate addon".to_string());
            }
            *count += 1;
            let occurrence = *count - 1;

            if let Err(e) = AddonName::parse(&name) {
                errors.push(e);
            }

            if ReleaseStrategy::try_from(addon.rel_type).is_err() {
                errors.push(format!("unknown release type {}", addon.rel_type));
            }

            if addon
                .dirs
                .iter()
                .any(|dir| matches!(dir.trim(), "" | "-"))
            {
                errors.push("found empty directory".to_string());
            } else {
                for dir in &mut addon.dirs {
                    if !dir.ends_with('/') {
                        dir.push('/');
                    }
                }
            }

            self.update_info.entry(name.clone()).or_default();

            if !errors.is_empty() {
                report.addons.push(AddonProblems {
                    name,
                    occurrence,
                    errors,
                });
            }
        }

        if report.is_empty() {
            Ok(())
        } else {
            Err(report)
        }
    }

    /// Builds runnable add-ons from a validated document.
    pub fn addons(&self) -> Result<Vec<Addon>, ConfigError> {
        let mut addons = Vec::with_capacity(self.addons.len());

        for cfg in &self.addons {
            let (name, strategy) = AddonName::parse(cfg.canonical_name())
                .and_then(|name| {
                    ReleaseStrategy::try_from(cfg.rel_type).map(|strategy| (name, strategy))
                })
                .map_err(|e| {
                    ConfigError::Validation(ValidationReport {
                        addons: vec![AddonProblems {
                            name: cfg.canonical_name().to_string(),
                            occurrence: 0,
                            errors: vec![e],
                        }],
                    })
                })?;

            let update_info = self
                .update_info
                .get(name.as_str())
                .cloned()
                .unwrap_or_default();

            addons.push(Addon {
                rules: DirRules::from_spec(&cfg.dirs),
                dir_spec: cfg.dirs.clone(),
                name,
                strategy,
                skip: cfg.is_skipped(),
                update_info,
            });
        }

        Ok(addons)
    }

    /// Network pool size, defaulting when unset.
    #[must_use]
    pub fn net_tasks(&self) -> usize {
        effective_tasks(self.net_tasks, DEFAULT_NET_TASKS, MAX_NET_TASKS)
    }

    /// Disk pool size, defaulting when unset.
    #[must_use]
    pub fn disk_tasks(&self) -> usize {
        effective_tasks(self.disk_tasks, DEFAULT_DISK_TASKS, MAX_DISK_TASKS)
    }

    /// Cache root, if caching is enabled.
    #[must_use]
    pub fn cache_dir(&self) -> Option<PathBuf> {
        if self.cache_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.cache_dir))
        }
    }

    /// Extraction root: `AddonsDir`, else `{CacheDir}/addons` when caching,
    /// else the working directory.
    #[must_use]
    pub fn addons_dir(&self) -> PathBuf {
        if !self.addons_dir.is_empty() {
            PathBuf::from(&self.addons_dir)
        } else if let Some(cache) = self.cache_dir() {
            cache.join("addons")
        } else {
            PathBuf::from(".")
        }
    }

    /// Drops update state of add-ons no longer configured, returning the
    /// removed names.
    pub fn prune_update_info(&mut self) -> Vec<String> {
        let tracked: BTreeSet<&str> = self.addons.iter().map(AddonCfg::canonical_name).collect();

        let orphans: Vec<String> = self
            .update_info
            .keys()
            .filter(|name| !tracked.contains(name.as_str()))
            .cloned()
            .collect();

        for name in &orphans {
            self.update_info.remove(name);
        }
        orphans
    }
}

fn effective_tasks(configured: i64, default: usize, max: usize) -> usize {
    match usize::try_from(configured) {
        Ok(0) | Err(_) => default,
        Ok(n) => n.min(max),
    }
}

/// Storage manager for the config document.
#[derive(Debug)]
pub struct ConfigStore {
    /// Path to the JSON config file.
    config_path: PathBuf,
}

impl ConfigStore {
    /// Creates a store for the given config path.
    #[must_use]
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reads, decodes and validates the config.
    pub fn load(&self) -> Result<AddonManagerCfg, ConfigError> {
        debug!("loading addon config {}", self.config_path.display());

        let data = fs::read(&self.config_path).map_err(|source| ConfigError::Read {
            path: self.config_path.clone(),
            source,
        })?;

        let mut cfg: AddonManagerCfg =
            serde_json::from_slice(&data).map_err(ConfigError::Decode)?;
        cfg.validate().map_err(ConfigError::Validation)?;

        Ok(cfg)
    }

    /// Prunes orphaned update state and writes the config atomically.
    pub fn save(&self, cfg: &mut AddonManagerCfg) -> Result<(), ConfigError> {
        let removed = cfg.prune_update_info();
        if !removed.is_empty() {
            debug!("removed untracked addons from update list: {:?}", removed);
        }

        let mut data = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
        cfg.serialize(&mut serializer).map_err(ConfigError::Encode)?;
        data.push(b'\n');

        let tmp_path = temp_path(&self.config_path);
        let write_err = |source| ConfigError::Write {
            path: self.config_path.clone(),
            source,
        };

        let result = fs::File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&data)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.config_path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(write_err(e));
        }

        debug!("saved addon config {}", self.config_path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "addons.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cfg_with(names: &[&str]) -> AddonManagerCfg {
        AddonManagerCfg {
            addons: names
                .iter()
                .map(|name| AddonCfg {
                    name: (*name).to_string(),
                    ..AddonCfg::default()
                })
                .collect(),
            ..AddonManagerCfg::default()
        }
    }

    #[test]
    fn test_validate_minimal_config() {
        let mut cfg = cfg_with(&["Project/Addon"]);
        cfg.validate().unwrap();

        assert!(cfg.update_info.contains_key("Project/Addon"));
        assert_eq!(cfg.net_tasks(), DEFAULT_NET_TASKS);
        assert_eq!(cfg.disk_tasks(), DEFAULT_DISK_TASKS);
    }

    #[test]
    fn test_validate_keeps_skip_marker() {
        let mut cfg = cfg_with(&["-Project/Addon"]);
        cfg.validate().unwrap();

        assert_eq!(cfg.addons[0].name, "-Project/Addon");
        assert!(cfg.update_info.contains_key("Project/Addon"));

        let addons = cfg.addons().unwrap();
        assert!(addons[0].skip);
        assert_eq!(addons[0].name.as_str(), "Project/Addon");
    }

    #[test]
    fn test_validate_normalizes_dirs() {
        let mut cfg = cfg_with(&["Project/Addon"]);
        cfg.addons[0].dirs = vec!["dir1".into(), "dir2/".into(), "-dir3".into()];
        cfg.validate().unwrap();

        assert_eq!(cfg.addons[0].dirs, vec!["dir1/", "dir2/", "-dir3/"]);

        let addons = cfg.addons().unwrap();
        assert_eq!(addons[0].rules.include_dirs(), ["dir1/", "dir2/"]);
        assert_eq!(addons[0].rules.exclude_dirs(), ["dir3/"]);
    }

    #[test]
    fn test_validate_clamps_tasks() {
        let mut cfg = cfg_with(&["Project/Addon"]);
        cfg.net_tasks = MAX_NET_TASKS as i64 + 1;
        cfg.disk_tasks = -33;
        cfg.validate().unwrap();

        assert_eq!(cfg.net_tasks, MAX_NET_TASKS as i64);
        assert_eq!(cfg.disk_tasks, 0);
        assert_eq!(cfg.disk_tasks(), DEFAULT_DISK_TASKS);
    }

    #[test]
    fn test_validate_aggregates_errors() {
        let mut cfg = cfg_with(&["Project/Addon", "-Project/Addon", "NoSlash", ""]);
        cfg.addons[2].rel_type = 7;
        cfg.addons[0].dirs = vec!["ok".into(), " ".into()];

        let report = cfg.validate().unwrap_err();
        let names: Vec<(&str, usize)> = report
            .addons
            .iter()
            .map(|p| (p.name.as_str(), p.occurrence))
            .collect();
        assert_eq!(
            names,
            vec![("Project/Addon", 0), ("Project/Addon", 1), ("NoSlash", 0), ("", 0)]
        );

        let text = report.to_string();
        assert!(text.starts_with("validation errors found:\n"));
        assert!(text.contains("  Project/Addon (1):\n    - found duplicate addon\n"));
        assert!(text.contains("    - found empty directory\n"));
        assert!(text.contains("    - unknown release type 7\n"));
        assert!(text.contains("  <empty>:\n"));
    }

    #[test]
    fn test_addons_dir_defaults() {
        let mut cfg = AddonManagerCfg::default();
        assert_eq!(cfg.addons_dir(), PathBuf::from("."));

        cfg.cache_dir = "cache".into();
        assert_eq!(cfg.addons_dir(), PathBuf::from("cache").join("addons"));

        cfg.addons_dir = "/games/AddOns".into();
        assert_eq!(cfg.addons_dir(), PathBuf::from("/games/AddOns"));
    }

    #[test]
    fn test_store_load() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "Addons": [
                    {{"Name": "proj/addon1", "Dirs": ["dir1", "-dir2", "dir3"]}},
                    {{"Name": "-proj/addon2", "RelType": 1}}
                ],
                "UnmanagedAddons": ["https://example.com/other"],
                "UpdateInfo": {{
                    "proj/addon1": {{"Version": "v1.0", "UpdatedOn": "2024-05-01T10:00:00Z", "ExtractedDirs": ["dir1"]}}
                }},
                "NetTasks": 3
            }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let store = ConfigStore::new(file.path().to_path_buf());
        let cfg = store.load().unwrap();
        let addons = cfg.addons().unwrap();

        assert_eq!(addons.len(), 2);
        assert_eq!(addons[0].update_info.version, "v1.0");
        assert_eq!(addons[0].update_info.extracted_dirs, vec!["dir1"]);
        assert_eq!(addons[1].strategy, ReleaseStrategy::TaggedRef);
        assert!(addons[1].skip);
        assert_eq!(cfg.net_tasks(), 3);
        assert_eq!(cfg.unmanaged_addons, vec!["https://example.com/other"]);
    }

    #[test]
    fn test_store_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nope.json"));
        assert!(matches!(store.load(), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_store_load_malformed_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{\"Addons\": [").unwrap();
        file.flush().unwrap();

        let store = ConfigStore::new(file.path().to_path_buf());
        assert!(matches!(store.load(), Err(ConfigError::Decode(_))));
    }

    #[test]
    fn test_store_save_prunes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addons.json");
        let store = ConfigStore::new(path.clone());

        let mut cfg = cfg_with(&["proj/kept"]);
        cfg.update_info.insert("proj/gone".into(), UpdateInfo::default());
        cfg.validate().unwrap();
        store.save(&mut cfg).unwrap();

        let saved = fs::read_to_string(&path).unwrap();
        assert!(saved.contains("proj/kept"));
        assert!(!saved.contains("proj/gone"));
        assert!(!dir.path().join("addons.json.tmp").exists());

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.update_info.len(), 1);
        assert_eq!(reloaded.addons, cfg.addons);
    }
}
