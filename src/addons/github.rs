//! GitHub release resolution.
//!
//! Decides which remote artifact is the current release of an add-on. Two
//! publication styles are supported:
//!
//! - Release assets: the latest GitHub release, narrowed by an optional
//!   `release.json` manifest naming the mainline build, else the first
//!   modern zip asset.
//! - Tagged refs: the last tag reference, downloaded as a source archive.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::error::ResolveError;
use super::fetcher::Fetch;
use super::types::{Addon, DownloadAsset, ReleaseKind, ReleaseStrategy};

/// Asset name of the optional release manifest.
const MANIFEST_NAME: &str = "release.json";

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_ZIP: &str = "application/zip";

/// Manifest flavor of the current retail game client.
const MAINLINE_FLAVOR: &str = "mainline";

/// Asset names built for legacy game clients.
#[allow(clippy::expect_used)]
static CLASSIC_FLAVORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)classic|bc|wrath|cata").expect("valid flavor regex"));

/// Base URLs of the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubEndpoints {
    /// REST API root.
    pub api: String,
    /// Web root, used for source archive downloads.
    pub web: String,
}

impl Default for GitHubEndpoints {
    fn default() -> Self {
        Self {
            api: "https://api.github.com".to_string(),
            web: "https://github.com".to_string(),
        }
    }
}

impl GitHubEndpoints {
    #[must_use]
    pub fn latest_release_url(&self, name: &str) -> String {
        format!("{}/repos/{}/releases/latest", self.api, name)
    }

    #[must_use]
    pub fn tag_refs_url(&self, name: &str) -> String {
        format!("{}/repos/{}/git/refs/tags", self.api, name)
    }

    #[must_use]
    pub fn archive_url(&self, name: &str, reference: &str) -> String {
        format!("{}/{}/archive/{}.zip", self.web, name, reference)
    }
}

/// `GET /repos/{name}/releases/latest` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestRelease {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// One downloadable file attached to a release.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GitHubAsset {
    fn is_manifest(&self) -> bool {
        self.name == MANIFEST_NAME && self.content_type == CONTENT_TYPE_JSON
    }

    fn is_zip(&self) -> bool {
        self.content_type == CONTENT_TYPE_ZIP
    }

    fn to_download(&self, version: &str) -> DownloadAsset {
        DownloadAsset {
            name: self.name.clone(),
            size: self.size,
            download_url: self.browser_download_url.clone(),
            content_type: self.content_type.clone(),
            updated_at: self.updated_at,
            ref_sha: String::new(),
            version: version.to_string(),
            kind: ReleaseKind::ReleaseAsset,
        }
    }
}

/// Contents of a `release.json` manifest asset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseManifest {
    #[serde(default)]
    pub releases: Vec<ManifestRelease>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestRelease {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub metadata: Vec<ManifestMetadata>,
}

impl ManifestRelease {
    fn is_mainline(&self) -> bool {
        self.metadata.iter().any(|m| m.flavor == MAINLINE_FLAVOR)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub interface: Option<u64>,
}

/// One entry of `GET /repos/{name}/git/refs/tags`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagRef {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub object: TagObject,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagObject {
    #[serde(default)]
    pub sha: String,
}

/// Picks the asset named by the first mainline manifest entry.
///
/// `None` when the manifest has no mainline entry. Once a mainline entry
/// exists the manifest is authoritative: a missing asset is an error.
pub fn select_mainline(
    release: &LatestRelease,
    manifest: &ReleaseManifest,
) -> Option<Result<DownloadAsset, ResolveError>> {
    let entry = manifest.releases.iter().find(|r| r.is_mainline())?;

    let selected = release
        .assets
        .iter()
        .find(|a| a.is_zip() && a.name == entry.filename)
        .map(|a| a.to_download(&entry.version))
        .ok_or_else(|| ResolveError::ManifestAssetMissing {
            filename: entry.filename.clone(),
        });

    Some(selected)
}

/// Picks the first zip asset not built for a legacy client.
///
/// Legacy detection is a loose name match, so a modern asset whose name
/// happens to contain e.g. "bc" is skipped as well.
pub fn first_modern_zip(release: &LatestRelease) -> Result<DownloadAsset, ResolveError> {
    release
        .assets
        .iter()
        .find(|a| a.is_zip() && !CLASSIC_FLAVORS.is_match(&a.name))
        .map(|a| a.to_download(&release.tag_name))
        .ok_or(ResolveError::NoAssetFound)
}

/// Builds the source archive asset for the last listed tag.
///
/// The provider's list order is trusted to put the newest tag last.
pub fn last_tagged_ref(
    endpoints: &GitHubEndpoints,
    name: &str,
    refs: &[TagRef],
) -> Result<DownloadAsset, ResolveError> {
    let tag = refs.last().ok_or_else(|| ResolveError::NoTaggedRef {
        name: name.to_string(),
    })?;

    let reference = tag.reference.as_str();
    let short = reference.rsplit('/').next().unwrap_or(reference);

    Ok(DownloadAsset {
        name: format!("{}.zip", short),
        size: 0,
        download_url: endpoints.archive_url(name, reference),
        content_type: CONTENT_TYPE_ZIP.to_string(),
        updated_at: None,
        ref_sha: reference.to_string(),
        version: reference.to_string(),
        kind: ReleaseKind::TaggedRef,
    })
}

/// Resolution steps.
#[derive(Debug)]
enum ResolveState {
    ResolveReleaseAsset,
    ResolveReleaseManifest(LatestRelease),
    SelectMainline(LatestRelease, ReleaseManifest),
    FallbackFirstModernZip(LatestRelease),
    ResolveTaggedRef,
    Done(DownloadAsset),
    Failed(ResolveError),
}

/// Resolves the current release of one add-on.
///
/// Fetched documents land in the caller's scratch buffer.
pub struct Resolver<'a> {
    fetcher: &'a dyn Fetch,
    endpoints: &'a GitHubEndpoints,
    buf: &'a mut Vec<u8>,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(fetcher: &'a dyn Fetch, endpoints: &'a GitHubEndpoints, buf: &'a mut Vec<u8>) -> Self {
        Self {
            fetcher,
            endpoints,
            buf,
        }
    }

    /// Runs the resolution state machine to completion.
    pub fn resolve(&mut self, addon: &Addon) -> Result<DownloadAsset, ResolveError> {
        let mut state = match addon.strategy {
            ReleaseStrategy::ReleaseAsset => ResolveState::ResolveReleaseAsset,
            ReleaseStrategy::TaggedRef => ResolveState::ResolveTaggedRef,
        };

        loop {
            state = match state {
                ResolveState::ResolveReleaseAsset => self.latest_release(addon),
                ResolveState::ResolveReleaseManifest(release) => self.manifest(addon, release),
                ResolveState::SelectMainline(release, manifest) => {
                    match select_mainline(&release, &manifest) {
                        Some(Ok(asset)) => ResolveState::Done(asset),
                        Some(Err(e)) => ResolveState::Failed(e),
                        None => ResolveState::FallbackFirstModernZip(release),
                    }
                }
                ResolveState::FallbackFirstModernZip(release) => match first_modern_zip(&release) {
                    Ok(asset) => ResolveState::Done(asset),
                    Err(e) => ResolveState::Failed(e),
                },
                ResolveState::ResolveTaggedRef => self.tagged_ref(addon),
                ResolveState::Done(asset) => {
                    debug!(
                        "[RESOLVE] {} -> {} ({})",
                        addon.name, asset.name, asset.version
                    );
                    return Ok(asset);
                }
                ResolveState::Failed(e) => {
                    debug!("[RESOLVE] {} failed: {}", addon.name, e);
                    return Err(e);
                }
            };
        }
    }

    fn latest_release(&mut self, addon: &Addon) -> ResolveState {
        let url = self.endpoints.latest_release_url(addon.name.as_str());
        let key = format!("{}-rel.json", addon.name.short_part());

        match self.fetch_json::<LatestRelease>("update info", &url, &key) {
            Ok(release) => {
                debug!(
                    "[RESOLVE] {} release {} has {} assets",
                    addon.name,
                    release.tag_name,
                    release.assets.len()
                );
                ResolveState::ResolveReleaseManifest(release)
            }
            Err(e) => ResolveState::Failed(e),
        }
    }

    fn manifest(&mut self, addon: &Addon, release: LatestRelease) -> ResolveState {
        let Some(url) = release
            .assets
            .iter()
            .find(|a| a.is_manifest())
            .map(|a| a.browser_download_url.clone())
        else {
            return ResolveState::FallbackFirstModernZip(release);
        };

        let key = format!("{}-addonRel.json", addon.name.short_part());
        match self.fetch_json::<ReleaseManifest>("release manifest", &url, &key) {
            Ok(manifest) => ResolveState::SelectMainline(release, manifest),
            Err(e) => ResolveState::Failed(e),
        }
    }

    fn tagged_ref(&mut self, addon: &Addon) -> ResolveState {
        let url = self.endpoints.tag_refs_url(addon.name.as_str());
        let key = format!("{}-ref.json", addon.name.short_part());

        match self
            .fetch_json::<Vec<TagRef>>("tagged ref", &url, &key)
            .and_then(|refs| last_tagged_ref(self.endpoints, addon.name.as_str(), &refs))
        {
            Ok(asset) => ResolveState::Done(asset),
            Err(e) => ResolveState::Failed(e),
        }
    }

    fn fetch_json<T: DeserializeOwned>(
        &mut self,
        what: &'static str,
        url: &str,
        cache_key: &str,
    ) -> Result<T, ResolveError> {
        self.fetcher
            .fetch(url, cache_key, self.buf)
            .map_err(|source| ResolveError::Fetch { what, source })?;

        serde_json::from_slice(self.buf.as_slice()).map_err(|source| ResolveError::Decode { what, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::fetcher::CachedFetcher;
    use crate::test_utils::MemoryTransport;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const API: &str = "https://api.test";
    const WEB: &str = "https://web.test";

    fn endpoints() -> GitHubEndpoints {
        GitHubEndpoints {
            api: API.to_string(),
            web: WEB.to_string(),
        }
    }

    fn zip_asset(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "size": 10,
            "browser_download_url": format!("{WEB}/dl/{name}"),
            "content_type": "application/zip",
            "updated_at": "2024-05-01T10:00:00Z",
        })
    }

    fn manifest_asset() -> serde_json::Value {
        serde_json::json!({
            "name": "release.json",
            "size": 100,
            "browser_download_url": format!("{WEB}/dl/release.json"),
            "content_type": "application/json",
            "updated_at": "2024-05-01T10:00:00Z",
        })
    }

    fn mainline_manifest(filename: &str) -> serde_json::Value {
        serde_json::json!({
            "releases": [
                {
                    "version": "v2.0-classic",
                    "filename": "addon-v2.0-classic.zip",
                    "metadata": [{"flavor": "classic", "interface": 11500}]
                },
                {
                    "version": "v2.0",
                    "filename": filename,
                    "metadata": [{"flavor": "mainline", "interface": 110000}]
                }
            ]
        })
    }

    fn resolve_with(
        transport: &Arc<MemoryTransport>,
        addon: &Addon,
    ) -> Result<DownloadAsset, ResolveError> {
        let fetcher = CachedFetcher::new(transport.clone(), None);
        let endpoints = endpoints();
        let mut buf = Vec::new();
        Resolver::new(&fetcher, &endpoints, &mut buf).resolve(addon)
    }

    fn release_addon() -> Addon {
        Addon::new("proj/addon", &[], ReleaseStrategy::ReleaseAsset).unwrap()
    }

    fn serve_release(transport: &MemoryTransport, assets: Vec<serde_json::Value>) {
        let release = serde_json::json!({"tag_name": "v2.0-tag", "assets": assets});
        transport.insert_json(&format!("{API}/repos/proj/addon/releases/latest"), &release);
    }

    #[test]
    fn test_mainline_selected_regardless_of_asset_order() {
        let mut assets = vec![
            zip_asset("addon-v2.0-classic.zip"),
            manifest_asset(),
            zip_asset("addon-v2.0.zip"),
        ];

        for _ in 0..2 {
            let transport = Arc::new(MemoryTransport::new());
            serve_release(&transport, assets.clone());
            transport.insert_json(&format!("{WEB}/dl/release.json"), &mainline_manifest("addon-v2.0.zip"));

            let asset = resolve_with(&transport, &release_addon()).unwrap();
            assert_eq!(asset.name, "addon-v2.0.zip");
            assert_eq!(asset.version, "v2.0");
            assert_eq!(asset.kind, ReleaseKind::ReleaseAsset);
            assert!(asset.updated_at.is_some());

            assets.reverse();
        }
    }

    #[test]
    fn test_fallback_to_first_modern_zip() {
        let transport = Arc::new(MemoryTransport::new());
        serve_release(
            &transport,
            vec![
                zip_asset("addon-wrath.zip"),
                zip_asset("addon-v2.0.zip"),
                zip_asset("addon-v2.0-other.zip"),
            ],
        );

        let asset = resolve_with(&transport, &release_addon()).unwrap();
        assert_eq!(asset.name, "addon-v2.0.zip");
        assert_eq!(asset.version, "v2.0-tag");
        assert_eq!(asset.download_url, format!("{WEB}/dl/addon-v2.0.zip"));
    }

    #[test]
    fn test_manifest_without_mainline_falls_back() {
        let transport = Arc::new(MemoryTransport::new());
        serve_release(
            &transport,
            vec![manifest_asset(), zip_asset("addon-Classic.zip"), zip_asset("addon.zip")],
        );
        transport.insert_json(
            &format!("{WEB}/dl/release.json"),
            &serde_json::json!({"releases": [{"version": "x", "filename": "addon-Classic.zip"}]}),
        );

        let asset = resolve_with(&transport, &release_addon()).unwrap();
        assert_eq!(asset.name, "addon.zip");
        assert_eq!(asset.version, "v2.0-tag");
    }

    #[test]
    fn test_only_classic_assets_fails() {
        let transport = Arc::new(MemoryTransport::new());
        serve_release(
            &transport,
            vec![zip_asset("addon-classic.zip"), zip_asset("addon-cata.zip")],
        );

        let err = resolve_with(&transport, &release_addon()).unwrap_err();
        assert!(matches!(err, ResolveError::NoAssetFound));
    }

    #[test]
    fn test_manifest_naming_missing_asset_fails() {
        let transport = Arc::new(MemoryTransport::new());
        serve_release(&transport, vec![manifest_asset(), zip_asset("addon-v1.9.zip")]);
        transport.insert_json(&format!("{WEB}/dl/release.json"), &mainline_manifest("addon-v2.0.zip"));

        let err = resolve_with(&transport, &release_addon()).unwrap_err();
        assert!(
            matches!(err, ResolveError::ManifestAssetMissing { ref filename } if filename == "addon-v2.0.zip")
        );
    }

    #[test]
    fn test_mainline_asset_must_be_zip() {
        let mut asset = zip_asset("addon-v2.0.zip");
        asset["content_type"] = serde_json::json!("application/octet-stream");

        let transport = Arc::new(MemoryTransport::new());
        serve_release(&transport, vec![manifest_asset(), asset]);
        transport.insert_json(&format!("{WEB}/dl/release.json"), &mainline_manifest("addon-v2.0.zip"));

        let err = resolve_with(&transport, &release_addon()).unwrap_err();
        assert!(matches!(err, ResolveError::ManifestAssetMissing { .. }));
    }

    #[test]
    fn test_classic_filter_is_loose() {
        // "bc" inside an unrelated word still reads as a legacy build.
        let release = LatestRelease {
            tag_name: "v1".into(),
            assets: vec![GitHubAsset {
                name: "abcaddon.zip".into(),
                content_type: CONTENT_TYPE_ZIP.into(),
                ..GitHubAsset::default()
            }],
        };
        assert!(matches!(first_modern_zip(&release), Err(ResolveError::NoAssetFound)));
    }

    #[test]
    fn test_malformed_release_json() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(&format!("{API}/repos/proj/addon/releases/latest"), b"{not json".to_vec());

        let err = resolve_with(&transport, &release_addon()).unwrap_err();
        assert!(matches!(err, ResolveError::Decode { what: "update info", .. }));
    }

    #[test]
    fn test_missing_release_is_fetch_error() {
        let transport = Arc::new(MemoryTransport::new());
        let err = resolve_with(&transport, &release_addon()).unwrap_err();
        assert!(matches!(err, ResolveError::Fetch { .. }));
    }

    #[test]
    fn test_tagged_ref_takes_last_entry() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_json(
            &format!("{API}/repos/proj/addon/git/refs/tags"),
            &serde_json::json!([
                {"ref": "refs/tags/30", "object": {"sha": "aaa"}},
                {"ref": "refs/tags/31", "object": {"sha": "bbb"}}
            ]),
        );
        let addon = Addon::new("proj/addon", &[], ReleaseStrategy::TaggedRef).unwrap();

        let asset = resolve_with(&transport, &addon).unwrap();
        assert_eq!(asset.name, "31.zip");
        assert_eq!(asset.version, "refs/tags/31");
        assert_eq!(asset.ref_sha, "refs/tags/31");
        assert_eq!(asset.download_url, format!("{WEB}/proj/addon/archive/refs/tags/31.zip"));
        assert_eq!(asset.content_type, "application/zip");
        assert_eq!(asset.size, 0);
        assert_eq!(asset.updated_at, None);
        assert_eq!(asset.kind, ReleaseKind::TaggedRef);
    }

    #[test]
    fn test_no_tagged_refs_fails() {
        let err = last_tagged_ref(&endpoints(), "proj/addon", &[]).unwrap_err();
        assert!(matches!(err, ResolveError::NoTaggedRef { ref name } if name == "proj/addon"));
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: ReleaseManifest =
            serde_json::from_str(r#"{"releases":[{"version":"1","filename":"a.zip"}]}"#).unwrap();
        assert!(manifest.releases[0].metadata.is_empty());

        let meta: ManifestMetadata = serde_json::from_str(r#"{"flavor":"mainline"}"#).unwrap();
        assert_eq!(meta.interface, None);
    }
}
