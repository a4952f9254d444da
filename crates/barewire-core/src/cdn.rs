//! Version-resolving, content-addressed CDN client.
//!
//! Files are addressed as `<base><pkg>@<version-or-range>/<path>`. When the
//! requested location is not canonical (range/tag version, or extension-less
//! path), the CDN answers with a redirect; the final response URL is parsed
//! back into an [`NpmLocation`] to discover the exact version and concrete
//! file path.
//!
//! Every cache memoizes *in-flight* shared futures, not just completed
//! results, so concurrent callers racing on the same location coalesce into a
//! single network request. Caches are owned by one `CachingCdn` instance and
//! live for one session; a `latest` resolution is only allowed to be stale
//! within that session.

use crate::error::CdnError;
use crate::specifier::{self, NpmLocation};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Default CDN prefix.
pub const DEFAULT_CDN: &str = "https://unpkg.com/";

/// A raw CDN response, after following redirects.
#[derive(Debug, Clone)]
pub struct CdnResponse {
    pub status: u16,
    /// Final URL (redirect target), used for canonicalization.
    pub url: String,
    pub body: String,
    pub content_type: Option<String>,
}

/// The injected HTTP fetch capability.
pub trait CdnFetch: Send + Sync + 'static {
    /// Perform one GET, following redirects.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<CdnResponse, CdnError>>;
}

/// Production fetch capability backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    /// Create a client with connect/read timeouts so an unresponsive CDN
    /// fails a crawl instead of stalling it forever.
    pub fn new() -> Result<Self, CdnError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("barewire/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CdnError::Network {
                url: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl CdnFetch for HttpFetch {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<CdnResponse, CdnError>> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| CdnError::Network {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
            let body = response.text().await.map_err(|e| CdnError::Network {
                url: url.clone(),
                message: e.to_string(),
            })?;
            Ok(CdnResponse {
                status,
                url: final_url,
                body,
                content_type,
            })
        }
        .boxed()
    }
}

/// A fetched CDN file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnFile {
    pub content: String,
    pub content_type: Option<String>,
}

/// The subset of `package.json` this system consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageJson {
    pub dependencies: Option<BTreeMap<String, String>>,
    pub main: Option<String>,
    pub module: Option<String>,
    pub types: Option<String>,
    pub typings: Option<String>,
}

impl PackageJson {
    /// Declared range for a dependency, if any.
    #[must_use]
    pub fn dependency_range(&self, pkg: &str) -> Option<&str> {
        self.dependencies
            .as_ref()
            .and_then(|deps| deps.get(pkg))
            .map(String::as_str)
    }
}

type EntryResult = Result<(NpmLocation, Arc<CdnFile>), CdnError>;
type SharedEntry = Shared<BoxFuture<'static, EntryResult>>;

/// Caching, canonicalizing CDN client.
pub struct CachingCdn<F: CdnFetch> {
    base_url: String,
    fetcher: Arc<F>,
    /// `pkg@range` -> resolved exact version.
    versions: Mutex<HashMap<String, String>>,
    /// Requested serialized location -> shared in-flight fetch.
    entries: Mutex<HashMap<String, SharedEntry>>,
}

impl<F: CdnFetch> CachingCdn<F> {
    /// Create a client for the given CDN prefix.
    ///
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL.
    pub fn new(base_url: impl Into<String>, fetcher: F) -> Result<Self, CdnError> {
        let mut base_url = base_url.into();
        Url::parse(&base_url).map_err(|e| CdnError::BaseUrl {
            url: base_url.clone(),
            message: e.to_string(),
        })?;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            base_url,
            fetcher: Arc::new(fetcher),
            versions: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// The CDN URL a location fetches from.
    #[must_use]
    pub fn url_for(&self, location: &NpmLocation) -> String {
        format!("{}{}", self.base_url, location.serialize())
    }

    /// Fetch a file, resolving the version first if it is not exact.
    ///
    /// At most one underlying request is made per distinct requested
    /// location, and per distinct canonical file.
    ///
    /// # Errors
    /// `CdnError::Status` on a non-200 response (carrying status and body).
    pub async fn fetch(&self, location: &NpmLocation) -> Result<Arc<CdnFile>, CdnError> {
        let (_, file) = self.entry(location).await?;
        Ok(file)
    }

    /// Resolve a location to exact version and concrete file path.
    ///
    /// A location that is already exact-versioned and has a file extension is
    /// returned unchanged without network activity; an already-resolved range
    /// is satisfied from the version cache.
    pub async fn canonicalize(&self, location: &NpmLocation) -> Result<NpmLocation, CdnError> {
        let mut location = location.clone();
        if !is_exact_version(&location.version) {
            let cached = {
                let versions = self.versions.lock().unwrap();
                versions.get(&version_key(&location)).cloned()
            };
            if let Some(version) = cached {
                location = location.with_version(version);
            }
        }
        if is_exact_version(&location.version) && specifier::file_extension(&location.path).is_some()
        {
            return Ok(location);
        }
        let (canonical, _) = self.entry(&location).await?;
        Ok(canonical)
    }

    /// Fetch and parse `package.json` for a package version.
    ///
    /// # Errors
    /// `CdnError::InvalidJson` (carrying the URL and body) when the body is
    /// not valid JSON.
    pub async fn fetch_package_json(
        &self,
        pkg: &str,
        version: &str,
    ) -> Result<PackageJson, CdnError> {
        let location = NpmLocation::new(pkg, version, "package.json");
        let (canonical, file) = self.entry(&location).await?;
        serde_json::from_str(&file.content).map_err(|e| CdnError::InvalidJson {
            url: self.url_for(&canonical),
            message: e.to_string(),
            body: file.content.clone(),
        })
    }

    /// Look up or start the shared fetch for a requested location.
    ///
    /// The check-then-insert below is synchronous (no suspension between
    /// lookup and insert), so two tasks discovering the same key always
    /// coalesce onto one future.
    async fn entry(&self, location: &NpmLocation) -> EntryResult {
        let key = location.serialize();
        let shared = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(existing) = entries.get(&key) {
                existing.clone()
            } else {
                let fut = fetch_entry(
                    self.fetcher.clone(),
                    self.base_url.clone(),
                    location.clone(),
                )
                .boxed()
                .shared();
                entries.insert(key, fut.clone());
                fut
            }
        };
        let (canonical, file) = shared.await?;
        if canonical != *location {
            self.record_canonical(location, &canonical, &file);
        }
        Ok((canonical, file))
    }

    /// Prime the caches under the canonical key discovered via redirect.
    fn record_canonical(&self, requested: &NpmLocation, canonical: &NpmLocation, file: &Arc<CdnFile>) {
        if requested.version != canonical.version {
            let mut versions = self.versions.lock().unwrap();
            versions
                .entry(version_key(requested))
                .or_insert_with(|| canonical.version.clone());
        }
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(canonical.serialize())
            .or_insert_with(|| {
                futures::future::ready(Ok((canonical.clone(), file.clone())))
                    .boxed()
                    .shared()
            });
    }
}

fn version_key(location: &NpmLocation) -> String {
    format!("{}@{}", location.pkg, location.version)
}

/// True when `version` is an exact semver triple (prerelease/build allowed).
#[must_use]
pub fn is_exact_version(version: &str) -> bool {
    semver::Version::parse(version).is_ok()
}

/// One underlying network request, yielding the canonical location parsed
/// from the final response URL along with the file.
async fn fetch_entry<F: CdnFetch>(
    fetcher: Arc<F>,
    base_url: String,
    location: NpmLocation,
) -> EntryResult {
    let url = format!("{base_url}{}", location.serialize());
    let response = fetcher.fetch(&url).await?;
    if response.status != 200 {
        return Err(CdnError::Status {
            status: response.status,
            url,
            body: response.body,
        });
    }
    let canonical = response
        .url
        .strip_prefix(&base_url)
        .and_then(NpmLocation::parse)
        .unwrap_or_else(|| location.clone());
    Ok((
        canonical,
        Arc::new(CdnFile {
            content: response.body,
            content_type: response.content_type,
        }),
    ))
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeCdn, FAKE_BASE};
    use super::*;
    use std::sync::atomic::Ordering;

    fn cdn_with(setup: impl FnOnce(&mut FakeCdn)) -> CachingCdn<FakeCdn> {
        let mut fake = FakeCdn::new();
        setup(&mut fake);
        CachingCdn::new(FAKE_BASE, fake).unwrap()
    }

    #[test]
    fn test_is_exact_version() {
        assert!(is_exact_version("1.0.0"));
        assert!(is_exact_version("2.0.0-rc.1"));
        assert!(!is_exact_version("^1.0.0"));
        assert!(!is_exact_version("1.x"));
        assert!(!is_exact_version("latest"));
        assert!(!is_exact_version(""));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(CachingCdn::new("not-a-url", FakeCdn::new()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_exact() {
        let cdn = cdn_with(|f| f.add_file("foo", "1.0.0", "index.js", "foo1"));
        let file = cdn
            .fetch(&NpmLocation::new("foo", "1.0.0", "index.js"))
            .await
            .unwrap();
        assert_eq!(file.content, "foo1");
        assert_eq!(file.content_type.as_deref(), Some("text/javascript"));
    }

    #[tokio::test]
    async fn test_fetch_resolves_range() {
        let cdn = cdn_with(|f| {
            f.add_file("foo", "1.0.0", "index.js", "foo1");
            f.add_file("foo", "1.5.0", "index.js", "foo15");
            f.add_file("foo", "2.0.0", "index.js", "foo2");
        });
        let file = cdn
            .fetch(&NpmLocation::new("foo", "^1.0.0", "index.js"))
            .await
            .unwrap();
        assert_eq!(file.content, "foo15");
    }

    #[tokio::test]
    async fn test_canonicalize_resolves_version_and_path() {
        let cdn = cdn_with(|f| {
            f.add_file("foo", "1.0.0", "lib/util.js", "u");
        });
        let canonical = cdn
            .canonicalize(&NpmLocation::new("foo", "latest", "lib/util"))
            .await
            .unwrap();
        assert_eq!(canonical, NpmLocation::new("foo", "1.0.0", "lib/util.js"));
    }

    #[tokio::test]
    async fn test_canonicalize_exact_is_offline() {
        let fake = FakeCdn::new(); // no files at all
        let counter = fake.request_counter();
        let cdn = CachingCdn::new(FAKE_BASE, fake).unwrap();
        let loc = NpmLocation::new("foo", "1.0.0", "index.js");
        assert_eq!(cdn.canonicalize(&loc).await.unwrap(), loc);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_version_cache_avoids_second_request() {
        let mut fake = FakeCdn::new();
        fake.add_file("foo", "1.2.0", "index.js", "a");
        fake.add_file("foo", "1.2.0", "other.js", "b");
        let counter = fake.request_counter();
        let cdn = CachingCdn::new(FAKE_BASE, fake).unwrap();

        cdn.fetch(&NpmLocation::new("foo", "^1.0.0", "index.js"))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The range is now resolved; canonicalizing another extensioned path
        // under the same range is satisfied from the version cache alone.
        let canonical = cdn
            .canonicalize(&NpmLocation::new("foo", "^1.0.0", "other.js"))
            .await
            .unwrap();
        assert_eq!(canonical.version, "1.2.0");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_coalesces_concurrent_requests() {
        let mut fake = FakeCdn::new();
        fake.add_file("foo", "1.0.0", "index.js", "x");
        let counter = fake.request_counter();
        let cdn = CachingCdn::new(FAKE_BASE, fake).unwrap();

        let loc = NpmLocation::new("foo", "latest", "index.js");
        let (a, b, c) = tokio::join!(cdn.fetch(&loc), cdn.fetch(&loc), cdn.fetch(&loc));
        assert_eq!(a.unwrap().content, "x");
        assert_eq!(b.unwrap().content, "x");
        assert_eq!(c.unwrap().content, "x");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canonical_request_reuses_redirected_content() {
        let mut fake = FakeCdn::new();
        fake.add_file("foo", "1.0.0", "index.js", "x");
        let counter = fake.request_counter();
        let cdn = CachingCdn::new(FAKE_BASE, fake).unwrap();

        cdn.fetch(&NpmLocation::new("foo", "latest", "index.js"))
            .await
            .unwrap();
        // Canonical key was primed by the redirect; no second request.
        cdn.fetch(&NpmLocation::new("foo", "1.0.0", "index.js"))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_package_is_status_error_with_body() {
        let cdn = cdn_with(|_| {});
        let err = cdn
            .fetch(&NpmLocation::new("nope", "latest", "index.js"))
            .await
            .unwrap_err();
        match err {
            CdnError::Status { status, body, .. } => {
                assert_eq!(status, 404);
                assert!(body.contains("Cannot find package 'nope'"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_package_json() {
        let cdn = cdn_with(|f| {
            f.add_file(
                "foo",
                "1.0.0",
                "package.json",
                r#"{"main": "lib/main.js", "dependencies": {"bar": "^2.0.0"}}"#,
            );
        });
        let pj = cdn.fetch_package_json("foo", "latest").await.unwrap();
        assert_eq!(pj.main.as_deref(), Some("lib/main.js"));
        assert_eq!(pj.dependency_range("bar"), Some("^2.0.0"));
        assert_eq!(pj.dependency_range("baz"), None);
    }

    #[tokio::test]
    async fn test_fetch_package_json_invalid_is_parse_error() {
        let cdn = cdn_with(|f| {
            f.add_file("foo", "1.0.0", "package.json", "not json at all");
        });
        let err = cdn.fetch_package_json("foo", "1.0.0").await.unwrap_err();
        match err {
            CdnError::InvalidJson { url, body, .. } => {
                assert!(url.contains("foo@1.0.0/package.json"));
                assert_eq!(body, "not json at all");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_package_json_ignores_unknown_fields() {
        let pj: PackageJson =
            serde_json::from_str(r#"{"name": "x", "version": "1.0.0", "module": "m.js"}"#).unwrap();
        assert_eq!(pj.module.as_deref(), Some("m.js"));
        assert!(pj.dependencies.is_none());
    }
}
