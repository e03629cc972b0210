//! Selective zip extraction.
//!
//! Replaces the top-level directories an add-on owns with the contents of a
//! freshly downloaded archive. Directories are created up front on the
//! calling thread; file contents are written by the disk pool.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::error::ExtractError;
use super::types::DirRules;
use crate::pool::TaskSubmitter;

/// Downloaded archive bytes, shared read-only between disk tasks.
#[derive(Debug, Clone)]
pub struct SharedBytes(Arc<Vec<u8>>);

impl From<Vec<u8>> for SharedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }
}

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// In-memory archive; cloning shares the bytes and the parsed index.
pub type Archive = ZipArchive<Cursor<SharedBytes>>;

/// Writes the archive entry at an index to a path.
type WriteUnit = fn(&mut Archive, usize, &Path) -> Result<(), ExtractError>;

/// Parses downloaded bytes as a zip archive.
pub fn open_archive(bytes: Vec<u8>) -> zip::result::ZipResult<Archive> {
    ZipArchive::new(Cursor::new(SharedBytes::from(bytes)))
}

/// Extracts the entries of `archive` accepted by `rules` into `dest`.
///
/// Previously owned directories listed in `extracted_dirs` are removed
/// first, then the list is rebuilt from the top-level directories created
/// by this archive. On failure the list holds whatever was created before
/// the error, so the next run cleans it up.
///
/// Returns the number of files written.
pub fn extract(
    archive: &mut Archive,
    rules: &DirRules,
    extracted_dirs: &mut Vec<String>,
    dest: &Path,
    disk: &TaskSubmitter,
) -> Result<usize, ExtractError> {
    remove_owned_dirs(extracted_dirs, dest)?;
    extracted_dirs.clear();

    let files = create_dirs(archive, rules, extracted_dirs, dest)?;
    debug!(
        "[EXTRACT] {} dirs created, {} files queued in {}",
        extracted_dirs.len(),
        files.len(),
        dest.display()
    );

    write_files(archive, files, disk, write_entry)
}

/// Deletes every owned directory under `dest`. Missing ones are fine.
fn remove_owned_dirs(extracted_dirs: &[String], dest: &Path) -> Result<(), ExtractError> {
    // Validate everything before deleting anything.
    let paths = extracted_dirs
        .iter()
        .map(|dir| owned_dir_path(dest, dir))
        .collect::<Result<Vec<_>, _>>()?;

    for path in paths {
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!("[EXTRACT] removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(ExtractError::RemoveStale { path, source }),
        }
    }

    Ok(())
}

/// Resolves a stored directory name, refusing anything but a plain name.
fn owned_dir_path(dest: &Path, dir: &str) -> Result<PathBuf, ExtractError> {
    let name = dir.strip_suffix('/').unwrap_or(dir);
    let mut components = Path::new(name).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if !name.contains(['/', '\\']) => {
            Ok(dest.join(part))
        }
        _ => Err(ExtractError::InvalidOwnedDir(dir.to_string())),
    }
}

/// First pass: filters entries, creates directories and records owned
/// top-level names. Returns the file entries left to write.
fn create_dirs(
    archive: &mut Archive,
    rules: &DirRules,
    extracted_dirs: &mut Vec<String>,
    dest: &Path,
) -> Result<Vec<(usize, PathBuf)>, ExtractError> {
    let mut files = Vec::with_capacity(archive.len());
    let mut seen: HashSet<String> = HashSet::new();

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|source| ExtractError::Entry { index, source })?;

        let name = entry.name().to_string();
        if !rules.should_extract(&name) {
            continue;
        }

        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ExtractError::UnsafePath(name.clone()))?;
        let is_dir = entry.is_dir();
        drop(entry);

        let dir = if is_dir {
            Some(relative.as_path())
        } else {
            relative.parent().filter(|p| !p.as_os_str().is_empty())
        };

        if let Some(dir) = dir {
            if let Some(Component::Normal(top)) = dir.components().next() {
                let top = top.to_string_lossy().into_owned();
                if seen.insert(top.clone()) {
                    extracted_dirs.push(top);
                }
            }

            let path = dest.join(dir);
            fs::create_dir_all(&path).map_err(|source| ExtractError::CreateDir { path, source })?;
        }

        if !is_dir {
            files.push((index, dest.join(&relative)));
        }
    }

    Ok(files)
}

/// Raises the shared failure flag when a unit unwinds.
struct FailOnPanic(Arc<AtomicBool>);

impl Drop for FailOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Second pass: writes file contents on the disk pool and waits for all of
/// them. Tasks not yet started when a failure is seen do nothing; a panicking
/// task counts as a failure.
fn write_files(
    archive: &Archive,
    files: Vec<(usize, PathBuf)>,
    disk: &TaskSubmitter,
    write: WriteUnit,
) -> Result<usize, ExtractError> {
    let expected = files.len();
    let failed = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = channel::unbounded::<Result<(), ExtractError>>();
    let mut submit_error = None;

    for (index, path) in files {
        if failed.load(Ordering::Acquire) {
            break;
        }

        let mut archive = archive.clone();
        let failed_flag = Arc::clone(&failed);
        let done_tx = done_tx.clone();

        let submitted = disk.submit(Box::new(move || {
            let guard = FailOnPanic(failed_flag);
            if guard.0.load(Ordering::Acquire) {
                return;
            }
            let result = write(&mut archive, index, &path);
            if result.is_err() {
                guard.0.store(true, Ordering::Release);
            }
            let _ = done_tx.send(result);
        }));

        if let Err(e) = submitted {
            failed.store(true, Ordering::Release);
            submit_error = Some(e);
            break;
        }
    }
    drop(done_tx);

    // Every task drops its sender when it finishes, panics or is skipped.
    let mut written = 0;
    let mut first_error = None;
    for result in done_rx.iter() {
        match result {
            Ok(()) => written += 1,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if let Some(e) = submit_error {
        return Err(ExtractError::Pool(e));
    }
    if written != expected {
        warn!("[EXTRACT] only {} of {} files written", written, expected);
        return Err(ExtractError::Incomplete { written, expected });
    }

    Ok(written)
}

fn write_entry(archive: &mut Archive, index: usize, path: &Path) -> Result<(), ExtractError> {
    let mut entry = archive
        .by_index(index)
        .map_err(|source| ExtractError::Entry { index, source })?;

    let write_err = |source| ExtractError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    io::copy(&mut entry, &mut writer).map_err(write_err)?;
    writer.flush().map_err(write_err)?;

    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)).map_err(write_err)?;
    }

    Ok(())
}
