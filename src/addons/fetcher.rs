//! Cache-aware fetching of remote documents and archives.
//!
//! A [`CachedFetcher`] resolves a URL plus a logical cache key to bytes. With a
//! cache root configured, a cached file is returned verbatim without touching
//! the network; otherwise the body is fetched through a [`Transport`] and, if
//! caching, teed to the cache file. The cache is a development aid only and
//! is trusted unconditionally.
//!
//! [`PooledFetcher`] runs each fetch on the network pool so the number of
//! concurrent connections is bounded independently of the number of add-ons.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use tracing::{debug, warn};

use super::error::FetchError;
use crate::pool::{PoolError, TaskSubmitter};

/// User agent sent with every request; the GitHub API rejects requests
/// without one.
const USER_AGENT: &str = concat!("addman/", env!("CARGO_PKG_VERSION"));

/// Request timeout, covering the whole body transfer.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Suffix of cache files still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Blocking HTTP GET.
pub trait Transport: Send + Sync {
    /// Streams the body of `url` into `sink`, returning the number of bytes.
    fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
}

/// [`Transport`] backed by a blocking `reqwest` client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport with the default user agent and timeout.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self { client }
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        debug!("GET {}", url);
        let start = Instant::now();

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("GET {} failed: {}", url, status);
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = copy_body(url, &mut response, sink)?;

        debug!("GET {} -> {} bytes in {:?}", url, bytes, start.elapsed());
        Ok(bytes)
    }
}

/// Copies a response body into `sink`. Read and write failures alike are
/// reported as [`FetchError::Body`].
pub fn copy_body(url: &str, body: &mut dyn Read, sink: &mut dyn Write) -> Result<u64, FetchError> {
    io::copy(body, sink).map_err(|source| FetchError::Body {
        url: url.to_string(),
        source,
    })
}

/// Something that can fill a buffer with the bytes behind a URL.
pub trait Fetch: Send + Sync {
    /// Replaces the contents of `buf` with the body of `url`.
    ///
    /// `cache_key` names the cache file used when caching is enabled.
    fn fetch(&self, url: &str, cache_key: &str, buf: &mut Vec<u8>) -> Result<(), FetchError>;
}

/// Fetcher that consults an on-disk cache before the network.
pub struct CachedFetcher {
    transport: Arc<dyn Transport>,
    cache_root: Option<PathBuf>,
}

impl CachedFetcher {
    /// Creates a fetcher; `cache_root` of `None` disables caching.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, cache_root: Option<PathBuf>) -> Self {
        Self {
            transport,
            cache_root,
        }
    }

    /// Cache directory, if caching is enabled.
    #[must_use]
    pub fn cache_root(&self) -> Option<&Path> {
        self.cache_root.as_deref()
    }

    fn fetch_cached(
        &self,
        root: &Path,
        url: &str,
        cache_key: &str,
        buf: &mut Vec<u8>,
    ) -> Result<(), FetchError> {
        let path = root.join(cache_key);

        match File::open(&path) {
            Ok(mut file) => {
                debug!("reading {} from cache {}", url, path.display());
                file.read_to_end(buf)
                    .map_err(|source| FetchError::Cache { path, source })?;
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(FetchError::Cache { path, source }),
        }

        let partial = root.join(format!("{}{}", cache_key, PARTIAL_SUFFIX));
        let file = File::create(&partial).map_err(|source| FetchError::Cache {
            path: partial.clone(),
            source,
        })?;

        let mut tee = TeeWriter {
            primary: buf,
            copy: BufWriter::new(file),
        };
        let fetched = self.transport.get(url, &mut tee);
        let flushed = tee.copy.flush();
        drop(tee);

        let result = fetched.and_then(|_| {
            flushed.map_err(|source| FetchError::Cache {
                path: partial.clone(),
                source,
            })?;
            fs::rename(&partial, &path).map_err(|source| FetchError::Cache {
                path: path.clone(),
                source,
            })
        });

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        } else {
            debug!("cached {} as {}", url, path.display());
        }
        result
    }
}

impl Fetch for CachedFetcher {
    fn fetch(&self, url: &str, cache_key: &str, buf: &mut Vec<u8>) -> Result<(), FetchError> {
        buf.clear();

        match &self.cache_root {
            Some(root) => self.fetch_cached(root, url, cache_key, buf),
            None => self.transport.get(url, buf).map(|_| ()),
        }
    }
}

/// Writes every byte to the caller's buffer and to the cache file.
struct TeeWriter<'a> {
    primary: &'a mut Vec<u8>,
    copy: BufWriter<File>,
}

impl Write for TeeWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.copy.write_all(data)?;
        self.primary.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.copy.flush()
    }
}

/// Runs fetches of an inner [`CachedFetcher`] on the network pool.
#[derive(Clone)]
pub struct PooledFetcher {
    inner: Arc<CachedFetcher>,
    net: TaskSubmitter,
}

impl PooledFetcher {
    #[must_use]
    pub fn new(inner: Arc<CachedFetcher>, net: TaskSubmitter) -> Self {
        Self { inner, net }
    }
}

impl Fetch for PooledFetcher {
    fn fetch(&self, url: &str, cache_key: &str, buf: &mut Vec<u8>) -> Result<(), FetchError> {
        let (done_tx, done_rx) = channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        let cache_key = cache_key.to_string();
        // The buffer travels to the worker and back; nobody else touches it.
        let mut owned = std::mem::take(buf);

        self.net.submit(Box::new(move || {
            let result = inner.fetch(&url, &cache_key, &mut owned);
            let _ = done_tx.send((owned, result));
        }))?;

        match done_rx.recv() {
            Ok((returned, result)) => {
                *buf = returned;
                result
            }
            Err(_) => Err(FetchError::Pool(PoolError::TaskLost)),
        }
    }
}
