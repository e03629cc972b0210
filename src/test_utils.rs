//! Test support: an in-memory HTTP transport and a zip archive builder.
//!
//! Public so integration tests can drive the whole update flow without
//! touching the network.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::addons::error::FetchError;
use crate::addons::fetcher::{copy_body, Transport};

/// Transport serving canned bodies by exact URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MemoryTransport {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every request open for `delay`, to make overlap observable.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, url: &str, body: Vec<u8>) {
        self.responses.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn insert_json(&self, url: &str, body: &serde_json::Value) {
        self.insert(url, serde_json::to_vec(body).unwrap());
    }

    pub fn remove(&self, url: &str) {
        self.responses.lock().unwrap().remove(url);
    }

    /// Number of requests made for `url`.
    #[must_use]
    pub fn requests(&self, url: &str) -> usize {
        self.requests.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().values().sum()
    }

    /// Highest number of requests observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        *self
            .requests
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let body = self.responses.lock().unwrap().get(url).cloned();
        let result = match body {
            Some(body) => copy_body(url, &mut body.as_slice(), sink),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Builds small stored (uncompressed) zip archives in memory.
pub struct ZipBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    }

    /// Adds a directory entry; `name` should end with `/`.
    #[must_use]
    pub fn dir(mut self, name: &str) -> Self {
        self.writer.add_directory(name, Self::options()).unwrap();
        self
    }

    #[must_use]
    pub fn file(mut self, name: &str, contents: &[u8]) -> Self {
        self.writer.start_file(name, Self::options()).unwrap();
        self.writer.write_all(contents).unwrap();
        self
    }

    /// Adds a file carrying unix permission bits.
    #[must_use]
    pub fn file_with_mode(mut self, name: &str, contents: &[u8], mode: u32) -> Self {
        self.writer
            .start_file(name, Self::options().unix_permissions(mode))
            .unwrap();
        self.writer.write_all(contents).unwrap();
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.writer.finish().unwrap().into_inner()
    }
}
