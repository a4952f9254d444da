//! Declaration file crawling and assembly.
//!
//! Starting from project source files, crawls the TypeScript declaration
//! closure of every referenced npm package: the package's own `types`/
//! `typings` entry when it ships declarations, otherwise the DefinitelyTyped
//! `@types/*` counterpart. Crawled packages are assembled into an npm-style
//! `node_modules/` tree (see [`crate::layout`]) so that TypeScript's node
//! resolution finds, for every import, the version the importing package
//! actually asked for.
//!
//! Each discovered dependency is crawled in its own task; `get_files` joins
//! them all (including tasks spawned by tasks) before computing the layout.

use crate::cdn::{CachingCdn, CdnFetch, CdnFile, PackageJson};
use crate::layout::{self, DependencyGraph};
use crate::output::BuildFile;
use crate::scan::{self, ReferenceKind};
use crate::specifier::{self, NpmLocation, SpecifierKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// The assembled declaration tree plus referenced built-in libs.
#[derive(Debug, Default)]
pub struct TypingsFiles {
    /// Declaration and manifest files, named under `node_modules/`.
    pub files: Vec<BuildFile>,
    /// `lib` names referenced via triple-slash directives (e.g. `"dom"`).
    pub libs: Vec<String>,
}

/// Crawls and assembles the declaration files for one project.
pub struct TypesFetcher<F: CdnFetch> {
    inner: Arc<Crawl<F>>,
}

struct Crawl<F: CdnFetch> {
    cdn: CachingCdn<F>,
    project_manifest: Option<PackageJson>,
    state: Mutex<CrawlState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct CrawlState {
    /// Serialized locations already fetched or in flight.
    handled: HashSet<String>,
    /// Packages required directly by project sources: pkg -> exact version.
    root_dependencies: BTreeMap<String, String>,
    /// Edges discovered through imports between declaration files.
    graph: DependencyGraph,
    /// Crawled packages: (pkg, exact version) -> collected typings.
    packages: BTreeMap<(String, String), PackageTypings>,
    libs: BTreeSet<String>,
}

#[derive(Default)]
struct PackageTypings {
    /// Path within the package -> fetched file.
    files: BTreeMap<String, Arc<CdnFile>>,
    /// Raw `package.json` body, when the package has one.
    manifest: Option<String>,
}

impl<F: CdnFetch> TypesFetcher<F> {
    /// Create a fetcher. `project_manifest` supplies declared version ranges
    /// for packages imported directly by project sources.
    #[must_use]
    pub fn new(cdn: CachingCdn<F>, project_manifest: Option<PackageJson>) -> Self {
        Self {
            inner: Arc::new(Crawl {
                cdn,
                project_manifest,
                state: Mutex::new(CrawlState::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Crawl the references of one project source file.
    ///
    /// Triple-slash `lib` directives are recorded and crawled as built-in
    /// lib modules; `types` directives and bare imports start a package
    /// crawl. Relative imports are project files the caller already has, so
    /// they are skipped.
    pub fn add_source_file(&self, source: &str) {
        for directive in scan::scan_reference_directives(source) {
            match directive.kind {
                ReferenceKind::Lib => self.add_lib_typings(&directive.name),
                ReferenceKind::Types => {
                    if let Some(request) = NpmLocation::parse(&directive.name) {
                        spawn_bare(&self.inner, None, request);
                    }
                }
            }
        }
        for occurrence in scan::scan_module_specifiers(source) {
            if specifier::classify(&occurrence.specifier) == SpecifierKind::Bare {
                if let Some(request) = NpmLocation::parse(&occurrence.specifier) {
                    spawn_bare(&self.inner, None, request);
                }
            }
        }
    }

    /// Crawl a built-in standard-library declaration module
    /// (`typescript/lib/lib.<name>.js` by convention).
    pub fn add_lib_typings(&self, name: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.libs.insert(name.to_string());
        }
        let request = NpmLocation::new("typescript", "", format!("lib/lib.{name}.js"));
        spawn_bare(&self.inner, None, request);
    }

    /// Wait for the crawl to finish and assemble the `node_modules/` tree.
    pub async fn get_files(self) -> TypingsFiles {
        // Tasks spawn further tasks; drain in rounds until none are left.
        loop {
            let batch = mem::take(&mut *self.inner.tasks.lock().unwrap());
            if batch.is_empty() {
                break;
            }
            for task in batch {
                let _ = task.await;
            }
        }

        let state = self.inner.state.lock().unwrap();
        let tree = layout::layout(&state.root_dependencies, &state.graph);

        let mut files = Vec::new();
        for ((pkg, version), typings) in &state.packages {
            for placement in tree.placements(pkg, version) {
                for (path, file) in &typings.files {
                    files.push(BuildFile {
                        name: format!("node_modules/{placement}/{path}"),
                        content: file.content.clone(),
                        content_type: file.content_type.clone(),
                    });
                }
                files.push(BuildFile {
                    name: format!("node_modules/{placement}/package.json"),
                    content: typings.manifest.clone().unwrap_or_else(|| "{}".to_string()),
                    content_type: Some("application/json".to_string()),
                });
            }
        }

        TypingsFiles {
            files,
            libs: state.libs.iter().cloned().collect(),
        }
    }
}

/// DefinitelyTyped package name for a package without its own typings
/// (`@scope/name` mangles to `@types/scope__name`).
fn types_package_name(pkg: &str) -> String {
    match pkg.strip_prefix('@').and_then(|rest| rest.split_once('/')) {
        Some((scope, name)) => format!("@types/{scope}__{name}"),
        None => format!("@types/{pkg}"),
    }
}

/// Declaration-file path for an imported path (`foo.js` -> `foo.d.ts`,
/// `lib/util` -> `lib/util.d.ts`).
fn declaration_path(path: &str) -> String {
    if path.ends_with(".d.ts") {
        path.to_string()
    } else {
        specifier::change_extension(path, "d.ts")
    }
}

fn spawn_bare<F: CdnFetch>(
    inner: &Arc<Crawl<F>>,
    referrer: Option<NpmLocation>,
    request: NpmLocation,
) {
    let task_inner = inner.clone();
    let task = tokio::spawn(async move {
        crawl_bare(task_inner, referrer, request).await;
    });
    inner.tasks.lock().unwrap().push(task);
}

fn spawn_file<F: CdnFetch>(inner: &Arc<Crawl<F>>, location: NpmLocation) {
    let task_inner = inner.clone();
    let task = tokio::spawn(async move {
        crawl_file(task_inner, location).await;
    });
    inner.tasks.lock().unwrap().push(task);
}

/// Resolve a bare package reference to a typed package and crawl its entry.
///
/// Tries the package itself first; when it ships no usable declarations,
/// falls back to its `@types/*` counterpart. A reference with no typings in
/// either place is skipped without failing the crawl.
async fn crawl_bare<F: CdnFetch>(
    inner: Arc<Crawl<F>>,
    referrer: Option<NpmLocation>,
    request: NpmLocation,
) {
    let referrer_manifest = match &referrer {
        Some(r) => inner.cdn.fetch_package_json(&r.pkg, &r.version).await.ok(),
        None => inner.project_manifest.clone(),
    };

    let mut candidates = vec![request.pkg.clone()];
    if !request.pkg.starts_with("@types/") {
        candidates.push(types_package_name(&request.pkg));
    }

    for candidate in candidates {
        let range = if request.version.is_empty() {
            referrer_manifest
                .as_ref()
                .and_then(|m| m.dependency_range(&candidate))
                .unwrap_or("latest")
                .to_string()
        } else {
            request.version.clone()
        };
        let Some(entry) = resolve_typed_entry(&inner, &candidate, &range, &request.path).await
        else {
            continue;
        };

        {
            let mut state = inner.state.lock().unwrap();
            match &referrer {
                Some(r) => {
                    state
                        .graph
                        .entry(r.pkg.clone())
                        .or_default()
                        .entry(r.version.clone())
                        .or_default()
                        .insert(entry.pkg.clone(), entry.version.clone());
                }
                None => {
                    state
                        .root_dependencies
                        .insert(entry.pkg.clone(), entry.version.clone());
                }
            }
        }
        crawl_file(inner, entry).await;
        return;
    }
}

/// Find the declaration entry file of `pkg` within `range`, verifying it
/// exists on the CDN. Records the package's manifest body along the way.
async fn resolve_typed_entry<F: CdnFetch>(
    inner: &Arc<Crawl<F>>,
    pkg: &str,
    range: &str,
    requested_path: &str,
) -> Option<NpmLocation> {
    let manifest_location = NpmLocation::new(pkg, range, "package.json");
    let manifest_body = inner.cdn.fetch(&manifest_location).await.ok()?;
    let manifest: Option<PackageJson> = serde_json::from_str(&manifest_body.content).ok();
    let version = inner
        .cdn
        .canonicalize(&manifest_location)
        .await
        .ok()?
        .version;

    // `types`/`typings` wins; a package with only `main` may still ship a
    // declaration sibling, so try that before the index.d.ts default.
    let path = if requested_path.is_empty() {
        manifest
            .as_ref()
            .and_then(|m| {
                m.types
                    .as_deref()
                    .or(m.typings.as_deref())
                    .or(m.main.as_deref())
            })
            .map_or_else(|| "index.d.ts".to_string(), |t| {
                declaration_path(t.trim_start_matches("./"))
            })
    } else {
        declaration_path(requested_path)
    };

    let entry = NpmLocation::new(pkg, version.clone(), path);
    inner.cdn.fetch(&entry).await.ok()?;

    let mut state = inner.state.lock().unwrap();
    state
        .packages
        .entry((pkg.to_string(), version))
        .or_default()
        .manifest
        .get_or_insert_with(|| manifest_body.content.clone());
    Some(entry)
}

/// Fetch one declaration file (at most once) and crawl what it references.
async fn crawl_file<F: CdnFetch>(inner: Arc<Crawl<F>>, location: NpmLocation) {
    {
        let mut state = inner.state.lock().unwrap();
        if !state.handled.insert(location.serialize()) {
            return;
        }
    }
    let Ok(file) = inner.cdn.fetch(&location).await else {
        return;
    };
    {
        let mut state = inner.state.lock().unwrap();
        state
            .packages
            .entry((location.pkg.clone(), location.version.clone()))
            .or_default()
            .files
            .insert(location.path.clone(), file.clone());
    }
    crawl_source(&inner, &file.content, &location);
}

/// Crawl the references of one fetched declaration file.
fn crawl_source<F: CdnFetch>(inner: &Arc<Crawl<F>>, source: &str, location: &NpmLocation) {
    for directive in scan::scan_reference_directives(source) {
        match directive.kind {
            ReferenceKind::Lib => {
                {
                    let mut state = inner.state.lock().unwrap();
                    state.libs.insert(directive.name.clone());
                }
                let request = NpmLocation::new(
                    "typescript",
                    "",
                    format!("lib/lib.{}.js", directive.name),
                );
                spawn_bare(inner, None, request);
            }
            ReferenceKind::Types => {
                if let Some(request) = NpmLocation::parse(&directive.name) {
                    spawn_bare(inner, Some(location.clone()), request);
                }
            }
        }
    }
    for occurrence in scan::scan_module_specifiers(source) {
        match specifier::classify(&occurrence.specifier) {
            SpecifierKind::Url => {}
            SpecifierKind::Relative => {
                let path = declaration_path(&specifier::resolve_relative(
                    &location.path,
                    &occurrence.specifier,
                ));
                spawn_file(inner, location.with_path(path));
            }
            SpecifierKind::Bare => {
                if let Some(request) = NpmLocation::parse(&occurrence.specifier) {
                    spawn_bare(inner, Some(location.clone()), request);
                }
            }
        }
    }
}
