//! Per add-on update coordination.
//!
//! One add-on at a time: resolve the current release, compare it with the
//! stored state, download, extract and record. Every step reports a line to
//! the add-on's own log queue. Failures stay scoped to the add-on and come
//! back as part of its [`AddonStatus`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use crossbeam::channel::Sender;
use tracing::debug;

use super::error::UpdateError;
use super::fetcher::Fetch;
use super::github::{GitHubEndpoints, Resolver};
use super::installer::{extract, open_archive};
use super::types::{Addon, AddonName, DownloadAsset, ReleaseKind, UpdateInfo};
use crate::pool::TaskSubmitter;
use crate::style::Palette;

/// Upper bound on the download buffer reserved from an asset's reported size.
const MAX_PREALLOCATION: usize = 16 << 20;

/// Run-scoped collaborators shared by every coordinator.
pub struct UpdateContext {
    pub fetcher: Arc<dyn Fetch>,
    pub endpoints: GitHubEndpoints,
    /// Root the add-on directories are extracted into.
    pub addons_dir: PathBuf,
    pub disk: TaskSubmitter,
    pub palette: Palette,
}

/// Prefixed writer into one add-on's log queue.
pub struct AddonLog {
    prefix: String,
    sink: Sender<String>,
}

impl AddonLog {
    #[must_use]
    pub fn new(name: &AddonName, palette: Palette, sink: Sender<String>) -> Self {
        let prefix = format!(
            "[{}{}] ",
            palette.dim(name.project_part()),
            palette.cyan(name.short_part())
        );
        Self { prefix, sink }
    }

    /// Queues one line. Blocks while the queue is full; a gone reader drops
    /// the line.
    pub fn line(&self, message: impl fmt::Display) {
        let _ = self.sink.send(format!("{}{}", self.prefix, message));
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Installed release is current.
    UpToDate,
    /// A newer release exists but the add-on is marked skip.
    UpdateSkipped { version: String },
    /// A newer release was downloaded and extracted.
    Updated { version: String },
}

/// Final report of one coordinator.
#[derive(Debug)]
pub struct AddonStatus {
    pub name: AddonName,
    pub result: Result<UpdateOutcome, UpdateError>,
    pub elapsed: Duration,
    /// State to persist. On failure only the owned directories may differ
    /// from what was stored.
    pub update_info: UpdateInfo,
}

/// Returns true if `asset` is newer than the installed state.
///
/// Release assets compare upload times, a never-updated add-on always
/// updates. Tagged refs compare the reference itself.
#[must_use]
pub fn has_update(stored: &UpdateInfo, asset: &DownloadAsset) -> bool {
    match asset.kind {
        ReleaseKind::ReleaseAsset => asset.updated_at > stored.updated_on,
        ReleaseKind::TaggedRef => stored.ref_sha != asset.ref_sha,
    }
}

/// Updates one add-on and reports how it went.
pub fn run_update(addon: &Addon, ctx: &UpdateContext, log: &AddonLog) -> AddonStatus {
    let start = Instant::now();
    let mut update_info = addon.update_info.clone();

    let result = update(addon, ctx, log, &mut update_info);
    if let Err(e) = &result {
        log.line(format!("{} {}", ctx.palette.red("error updating addon"), e));
    }

    let elapsed = start.elapsed();
    debug!("[UPDATE] {} finished in {:?}", addon.name, elapsed);

    AddonStatus {
        name: addon.name.clone(),
        result,
        elapsed,
        update_info,
    }
}

fn update(
    addon: &Addon,
    ctx: &UpdateContext,
    log: &AddonLog,
    info: &mut UpdateInfo,
) -> Result<UpdateOutcome, UpdateError> {
    let short = addon.name.short_part();
    let palette = ctx.palette;
    let mut buf = Vec::new();

    log.line(format!(
        "checking for update ({} on {})",
        palette.green(&info.version),
        palette.dim(&state_label(addon.strategy, info.updated_on, &info.ref_sha))
    ));

    let asset = Resolver::new(ctx.fetcher.as_ref(), &ctx.endpoints, &mut buf)
        .resolve(addon)
        .map_err(|source| UpdateError::Resolve {
            addon: short.to_string(),
            source,
        })?;

    if asset.kind != addon.strategy {
        return Err(UpdateError::StrategyMismatch {
            addon: short.to_string(),
            expected: addon.strategy,
            found: asset.kind,
        });
    }

    let found = format!(
        "{} on {}",
        palette.green(&asset.version),
        palette.dim(&state_label(asset.kind, asset.updated_at, &asset.ref_sha))
    );

    if !has_update(info, &asset) {
        log.line(format!("no update found     ({})", found));
        return Ok(UpdateOutcome::UpToDate);
    }
    if addon.skip {
        log.line(format!("skipping update     ({})", found));
        return Ok(UpdateOutcome::UpdateSkipped {
            version: asset.version,
        });
    }

    log.line(format!("downloading update  ({}) {}", found, asset.name));
    buf.clear();
    buf.reserve(usize::try_from(asset.size).map_or(0, |size| size.min(MAX_PREALLOCATION)));
    let cache_key = format!("{}-{}", short, asset.name);
    ctx.fetcher
        .fetch(&asset.download_url, &cache_key, &mut buf)
        .map_err(|source| UpdateError::Download {
            addon: short.to_string(),
            source,
        })?;

    let mut archive = open_archive(buf).map_err(|source| UpdateError::NotZip {
        addon: short.to_string(),
        source,
    })?;

    log.line("unzipping");
    extract(
        &mut archive,
        &addon.rules,
        &mut info.extracted_dirs,
        &ctx.addons_dir,
        &ctx.disk,
    )
    .map_err(|source| UpdateError::Extract {
        addon: short.to_string(),
        source,
    })?;
    log.line(format!(
        "extracted {}",
        palette.magenta_dim(&format!("[{}]", info.extracted_dirs.join(" ")))
    ));

    info.version.clone_from(&asset.version);
    info.updated_on = asset.updated_at;
    info.ref_sha = asset.ref_sha;

    Ok(UpdateOutcome::Updated {
        version: asset.version,
    })
}

/// Release date for release assets, the reference for tagged refs.
fn state_label(kind: ReleaseKind, updated: Option<DateTime<Utc>>, ref_sha: &str) -> String {
    match kind {
        ReleaseKind::ReleaseAsset => match updated {
            Some(at) => at.with_timezone(&Local).format("%b %-d, %Y").to_string(),
            None => "never".to_string(),
        },
        ReleaseKind::TaggedRef => ref_sha.to_string(),
    }
}
