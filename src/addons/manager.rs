//! Run orchestration.
//!
//! Fans one coordinator per add-on out onto a bounded coordinator pool,
//! forwards each add-on's log lines to the output as one uninterrupted
//! block, and folds the returned statuses into the authoritative update
//! state map.
//!
//! Log fan-in works in start order: every coordinator opens its own bounded
//! log queue and announces it before doing anything else. The output thread
//! drains announced queues one at a time, each until its coordinator hangs
//! up, so blocks never interleave while coordinators keep running
//! concurrently behind the one being printed.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use thiserror::Error;
use tracing::{info, warn};

use super::error::UpdateError;
use super::fetcher::{CachedFetcher, PooledFetcher, Transport};
use super::github::GitHubEndpoints;
use super::storage::{AddonManagerCfg, ConfigError, ConfigStore};
use super::types::{Addon, AddonName, UpdateInfo, MAX_ADDON_TASKS};
use super::updater::{run_update, AddonLog, AddonStatus, UpdateContext, UpdateOutcome};
use crate::pool::{PoolError, ResultPool, TaskPool};
use crate::style::Palette;

/// Lines buffered per add-on before its coordinator waits for the output.
const LOG_QUEUE_CAPACITY: usize = 64;

/// Run-level failures. Add-on failures never end up here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not create cache dir {}: {source}", path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Knobs of one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub net_tasks: usize,
    pub disk_tasks: usize,
    pub cache_dir: Option<PathBuf>,
    pub addons_dir: PathBuf,
    pub endpoints: GitHubEndpoints,
    pub palette: Palette,
}

impl RunSettings {
    /// Settings taken from a validated config document.
    #[must_use]
    pub fn from_config(cfg: &AddonManagerCfg, palette: Palette) -> Self {
        Self {
            net_tasks: cfg.net_tasks(),
            disk_tasks: cfg.disk_tasks(),
            cache_dir: cfg.cache_dir(),
            addons_dir: cfg.addons_dir(),
            endpoints: GitHubEndpoints::default(),
            palette,
        }
    }
}

/// Result of one run, statuses in configured add-on order.
#[derive(Debug)]
pub struct RunReport {
    pub statuses: Vec<AddonStatus>,
    pub elapsed: Duration,
}

impl RunReport {
    #[must_use]
    pub fn updated(&self) -> usize {
        self.count(|r| matches!(r, Ok(UpdateOutcome::Updated { .. })))
    }

    #[must_use]
    pub fn up_to_date(&self) -> usize {
        self.count(|r| matches!(r, Ok(UpdateOutcome::UpToDate)))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r, Ok(UpdateOutcome::UpdateSkipped { .. })))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(Result::is_err)
    }

    fn count(&self, pred: impl Fn(&Result<UpdateOutcome, UpdateError>) -> bool) -> usize {
        self.statuses.iter().filter(|s| pred(&s.result)).count()
    }

    /// One-line run summary.
    #[must_use]
    pub fn summary(&self, palette: Palette) -> String {
        let failed = format!("{} failed", self.failed());
        format!(
            "{} updated, {} up to date, {} skipped, {} in {:.1}s",
            self.updated(),
            self.up_to_date(),
            self.skipped(),
            if self.failed() > 0 {
                palette.red(&failed)
            } else {
                failed
            },
            self.elapsed.as_secs_f64()
        )
    }
}

/// Drives one update run over a set of add-ons.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    settings: RunSettings,
}

impl Orchestrator {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: RunSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Updates every add-on, writing their log blocks to `out` and their
    /// final state into `update_info`.
    pub fn run(
        &self,
        addons: Vec<Addon>,
        update_info: &mut BTreeMap<String, UpdateInfo>,
        out: &mut dyn Write,
    ) -> Result<RunReport, RunError> {
        let start = Instant::now();
        let settings = &self.settings;

        if let Some(cache) = &settings.cache_dir {
            fs::create_dir_all(cache).map_err(|source| RunError::CacheDir {
                path: cache.clone(),
                source,
            })?;
        }

        let total = addons.len();
        let names: Vec<AddonName> = addons.iter().map(|a| a.name.clone()).collect();
        let workers = total.clamp(1, MAX_ADDON_TASKS);
        let net_tasks = settings.net_tasks.max(1);
        let disk_tasks = settings.disk_tasks.max(1);
        info!(
            "[RUN] updating {} addons ({} coordinators, {} net, {} disk workers)",
            total, workers, net_tasks, disk_tasks
        );

        let net = TaskPool::spawn("net", net_tasks, total.max(1))?;
        let disk = TaskPool::spawn("disk", disk_tasks, disk_tasks * 2)?;
        let mut coordinators = ResultPool::<AddonStatus>::spawn("addon", workers, total.max(1))?;

        let cached = Arc::new(CachedFetcher::new(
            Arc::clone(&self.transport),
            settings.cache_dir.clone(),
        ));
        let ctx = Arc::new(UpdateContext {
            fetcher: Arc::new(PooledFetcher::new(cached, net.submitter())),
            endpoints: settings.endpoints.clone(),
            addons_dir: settings.addons_dir.clone(),
            disk: disk.submitter(),
            palette: settings.palette,
        });

        let (streams_tx, streams_rx) = channel::unbounded::<Receiver<String>>();
        for addon in addons {
            let ctx = Arc::clone(&ctx);
            let streams = streams_tx.clone();

            let submitted = coordinators.submit(Box::new(move || {
                let (log_tx, log_rx) = channel::bounded(LOG_QUEUE_CAPACITY);
                let _ = streams.send(log_rx);
                drop(streams);

                let log = AddonLog::new(&addon.name, ctx.palette, log_tx);
                run_update(&addon, &ctx, &log)
            }));

            if let Err(e) = submitted {
                coordinators.cancel();
                return Err(e.into());
            }
        }
        coordinators.close();
        drop(streams_tx);
        drop(ctx);

        drain_logs(&streams_rx, out);

        let results: Vec<_> = coordinators.results().iter().collect();
        let statuses = collect_statuses(&names, results);

        for status in &statuses {
            if let Err(e @ UpdateError::Aborted { .. }) = &status.result {
                let log_line = format!(
                    "[{}{}] {} {}",
                    settings.palette.dim(status.name.project_part()),
                    settings.palette.cyan(status.name.short_part()),
                    settings.palette.red("error updating addon"),
                    e
                );
                let _ = writeln!(out, "{}\n", log_line);
                continue;
            }
            update_info.insert(status.name.to_string(), status.update_info.clone());
        }

        net.close();
        disk.close();

        let report = RunReport {
            statuses,
            elapsed: start.elapsed(),
        };
        info!(
            "[RUN] done: {} updated, {} failed in {:?}",
            report.updated(),
            report.failed(),
            report.elapsed
        );
        Ok(report)
    }
}

/// Prints each announced log stream to completion, in announcement order,
/// followed by a blank line. Output errors stop printing but not draining.
fn drain_logs(streams: &Receiver<Receiver<String>>, out: &mut dyn Write) {
    let mut broken = false;

    for stream in streams.iter() {
        for line in stream.iter() {
            if !broken {
                broken = writeln!(out, "{}", line).is_err();
            }
        }
        if !broken {
            broken = writeln!(out).is_err();
        }
    }

    if broken {
        warn!("[RUN] output closed, remaining add-on logs dropped");
    }
}

/// Matches coordinator results back to add-ons, in configured order.
///
/// A coordinator that died without a status is reported as aborted and
/// keeps its stored state.
fn collect_statuses(
    names: &[AddonName],
    results: Vec<Result<AddonStatus, PoolError>>,
) -> Vec<AddonStatus> {
    let mut by_name: HashMap<String, AddonStatus> = HashMap::with_capacity(names.len());
    let mut lost: Vec<String> = Vec::new();

    for result in results {
        match result {
            Ok(status) => {
                by_name.insert(status.name.to_string(), status);
            }
            Err(e) => {
                warn!("[RUN] coordinator failed: {}", e);
                lost.push(e.to_string());
            }
        }
    }

    let reason = if lost.is_empty() {
        PoolError::TaskLost.to_string()
    } else {
        lost.join("; ")
    };

    names
        .iter()
        .map(|name| {
            by_name.remove(name.as_str()).unwrap_or_else(|| AddonStatus {
                name: name.clone(),
                result: Err(UpdateError::Aborted {
                    addon: name.short_part().to_string(),
                    reason: reason.clone(),
                }),
                elapsed: Duration::ZERO,
                update_info: UpdateInfo::default(),
            })
        })
        .collect()
}

/// Loads a config, runs it and saves the result.
pub struct AddonManager {
    store: ConfigStore,
    cfg: AddonManagerCfg,
    palette: Palette,
    check_only: bool,
}

impl AddonManager {
    /// Loads and validates the config at `path`.
    pub fn load(path: PathBuf, palette: Palette) -> Result<Self, ConfigError> {
        let store = ConfigStore::new(path);
        let cfg = store.load()?;

        Ok(Self {
            store,
            cfg,
            palette,
            check_only: false,
        })
    }

    /// Report available updates without downloading or saving anything.
    #[must_use]
    pub fn check_only(mut self, check_only: bool) -> Self {
        self.check_only = check_only;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AddonManagerCfg {
        &self.cfg
    }

    /// Run settings derived from the loaded config.
    #[must_use]
    pub fn settings(&self) -> RunSettings {
        RunSettings::from_config(&self.cfg, self.palette)
    }

    /// Updates every configured add-on, prints the unmanaged list and a
    /// summary, then persists the new state unless in check mode.
    pub fn run(
        &mut self,
        transport: Arc<dyn Transport>,
        settings: RunSettings,
        out: &mut dyn Write,
    ) -> Result<RunReport, RunError> {
        let mut addons = self.cfg.addons()?;
        if self.check_only {
            for addon in &mut addons {
                addon.skip = true;
            }
        }

        let report =
            Orchestrator::new(transport, settings).run(addons, &mut self.cfg.update_info, out)?;

        for entry in &self.cfg.unmanaged_addons {
            let _ = writeln!(out, "{}", self.palette.blue(entry));
        }
        if !self.cfg.unmanaged_addons.is_empty() {
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "{}", report.summary(self.palette));

        if !self.check_only {
            self.store.save(&mut self.cfg)?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, result: Result<UpdateOutcome, UpdateError>) -> AddonStatus {
        AddonStatus {
            name: AddonName::parse(name).unwrap(),
            result,
            elapsed: Duration::from_millis(5),
            update_info: UpdateInfo {
                version: "v1".into(),
                ..UpdateInfo::default()
            },
        }
    }

    #[test]
    fn test_collect_statuses_keeps_configured_order() {
        let names: Vec<AddonName> = ["p/a", "p/b", "p/c"]
            .iter()
            .map(|n| AddonName::parse(n).unwrap())
            .collect();
        let results = vec![
            Ok(status("p/c", Ok(UpdateOutcome::UpToDate))),
            Ok(status("p/a", Ok(UpdateOutcome::UpToDate))),
            Ok(status("p/b", Ok(UpdateOutcome::UpToDate))),
        ];

        let statuses = collect_statuses(&names, results);
        let order: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["p/a", "p/b", "p/c"]);
    }

    #[test]
    fn test_collect_statuses_reports_panicked_coordinator() {
        let names: Vec<AddonName> = ["p/a", "p/b"]
            .iter()
            .map(|n| AddonName::parse(n).unwrap())
            .collect();
        let results = vec![
            Ok(status("p/a", Ok(UpdateOutcome::UpToDate))),
            Err(PoolError::TaskPanicked("boom".into())),
        ];

        let statuses = collect_statuses(&names, results);

        assert!(statuses[0].result.is_ok());
        assert!(matches!(
            &statuses[1].result,
            Err(UpdateError::Aborted { addon, reason }) if addon == "b" && reason.contains("boom")
        ));
    }

    #[test]
    fn test_report_counts_and_summary() {
        let report = RunReport {
            statuses: vec![
                status("p/a", Ok(UpdateOutcome::Updated { version: "v2".into() })),
                status("p/b", Ok(UpdateOutcome::UpToDate)),
                status("p/c", Ok(UpdateOutcome::UpdateSkipped { version: "v3".into() })),
                status(
                    "p/d",
                    Err(UpdateError::Aborted {
                        addon: "d".into(),
                        reason: "lost".into(),
                    }),
                ),
            ],
            elapsed: Duration::from_millis(1500),
        };

        assert_eq!(report.updated(), 1);
        assert_eq!(report.up_to_date(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.summary(Palette::plain()),
            "1 updated, 1 up to date, 1 skipped, 1 failed in 1.5s"
        );
    }

    #[test]
    fn test_drain_logs_prints_streams_in_order() {
        let (streams_tx, streams_rx) = channel::unbounded();
        let (a_tx, a_rx) = channel::unbounded();
        let (b_tx, b_rx) = channel::unbounded();
        streams_tx.send(a_rx).unwrap();
        streams_tx.send(b_rx).unwrap();
        drop(streams_tx);

        b_tx.send("b1".to_string()).unwrap();
        a_tx.send("a1".to_string()).unwrap();
        b_tx.send("b2".to_string()).unwrap();
        a_tx.send("a2".to_string()).unwrap();
        drop(a_tx);
        drop(b_tx);

        let mut out = Vec::new();
        drain_logs(&streams_rx, &mut out);
        assert_eq!(String::from_utf8(out).unwrap(), "a1\na2\n\nb1\nb2\n\n");
    }

    #[test]
    fn test_run_with_no_addons() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunSettings {
            net_tasks: 1,
            disk_tasks: 1,
            cache_dir: None,
            addons_dir: dir.path().to_path_buf(),
            endpoints: GitHubEndpoints::default(),
            palette: Palette::plain(),
        };
        let transport = Arc::new(crate::test_utils::MemoryTransport::new());
        let mut info = BTreeMap::new();
        let mut out = Vec::new();

        let report = Orchestrator::new(transport, settings)
            .run(Vec::new(), &mut info, &mut out)
            .unwrap();

        assert!(report.statuses.is_empty());
        assert!(out.is_empty());
    }
}
