//! Bare module specifier rewriting over a build output stream.
//!
//! Consumes a stream of build artifacts; passes non-JS artifacts through,
//! and for every JS artifact rewrites its import/export/dynamic-import
//! specifiers to relative URLs rooted at `node_modules/<pkg>@<version>/<path>`.
//! Every bare dependency discovered this way is fetched from the CDN and fed
//! back through the same rewriting, so the emitted stream eventually contains
//! the full transitively reachable dependency closure, interleaved with
//! diagnostics for whatever could not be resolved.
//!
//! All state (handled-set, the project manifest deferred value, the CDN's
//! caches) is scoped to one `process` run.

use crate::cdn::{CachingCdn, CdnFetch, PackageJson};
use crate::error::CdnError;
use crate::merge::{MergerHandle, StreamMerger};
use crate::output::{BuildFile, BuildOutput, Diagnostic, Range};
use crate::scan::{self, ImportOccurrence};
use crate::specifier::{self, NpmLocation, SpecifierKind};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Directory prefix dependency files are emitted under.
const NODE_MODULES: &str = "node_modules/";

type SharedManifest = Shared<BoxFuture<'static, Option<Arc<PackageJson>>>>;

/// Rewrites bare module specifiers in one project build.
///
/// One transformer serves one build session; construct a new one (with a
/// fresh [`CachingCdn`]) per compilation so no resolution state leaks across
/// unrelated builds.
pub struct BareModuleTransformer<F: CdnFetch> {
    cdn: CachingCdn<F>,
}

struct Session<F: CdnFetch> {
    cdn: CachingCdn<F>,
    /// Dependency keys already scheduled for fetching; the synchronous
    /// check-then-insert here is what breaks import cycles.
    handled: Mutex<HashSet<String>>,
    /// The project's `package.json`, resolved once it is seen in the input
    /// (or `None` once the input ends without one). Tasks started earlier
    /// all await this same deferred value.
    project_manifest: SharedManifest,
}

impl<F: CdnFetch> BareModuleTransformer<F> {
    /// Create a transformer for one build session.
    #[must_use]
    pub fn new(cdn: CachingCdn<F>) -> Self {
        Self { cdn }
    }

    /// Transform a stream of build artifacts into the rewritten output
    /// stream.
    ///
    /// Output ordering across files is arbitrary; consumers must treat the
    /// stream as an eventual set union of files and diagnostics.
    pub fn process(
        self,
        input: impl Stream<Item = BuildOutput> + Send + 'static,
    ) -> impl Stream<Item = BuildOutput> + Send {
        let (merger, handle) = StreamMerger::new();
        let (manifest_tx, manifest_rx) = oneshot::channel::<Arc<PackageJson>>();
        let session = Arc::new(Session {
            cdn: self.cdn,
            handled: Mutex::new(HashSet::new()),
            project_manifest: manifest_rx.map(Result::ok).boxed().shared(),
        });

        let driver_session = session.clone();
        let driver_handle = handle.clone();
        let mut manifest_tx = Some(manifest_tx);
        let driver = input.flat_map(move |artifact| {
            let passthrough = match artifact {
                BuildOutput::File { file } if is_js(&file.name) => {
                    driver_handle.add(rewrite_producer(
                        driver_session.clone(),
                        driver_handle.clone(),
                        file,
                    ));
                    None
                }
                BuildOutput::File { file } if file.name == "package.json" => {
                    // Best effort: an unparsable project manifest behaves as
                    // an absent one (the sender is simply dropped).
                    if let Some(tx) = manifest_tx.take() {
                        if let Ok(manifest) =
                            serde_json::from_str::<PackageJson>(&file.content)
                        {
                            let _ = tx.send(Arc::new(manifest));
                        }
                    }
                    Some(BuildOutput::File { file })
                }
                other => Some(other),
            };
            stream::iter(passthrough)
        });
        handle.add(driver);
        drop(handle);
        merger
    }
}

fn is_js(name: &str) -> bool {
    matches!(specifier::file_extension(name), Some("js" | "mjs" | "cjs"))
}

/// A producer that rewrites one module and emits its outputs in order.
fn rewrite_producer<F: CdnFetch>(
    session: Arc<Session<F>>,
    handle: MergerHandle<BuildOutput>,
    file: BuildFile,
) -> impl Stream<Item = BuildOutput> + Send {
    stream::once(rewrite_module(session, handle, file))
        .map(stream::iter)
        .flatten()
}

/// Rewrite every resolvable specifier occurrence in one JS module.
///
/// Edits are applied back-to-front on the original text so earlier byte
/// offsets stay valid. A specifier that fails to resolve is left in place and
/// paired with a diagnostic at its quoted range.
async fn rewrite_module<F: CdnFetch>(
    session: Arc<Session<F>>,
    handle: MergerHandle<BuildOutput>,
    file: BuildFile,
) -> Vec<BuildOutput> {
    let occurrences = scan::scan_module_specifiers(&file.content);
    let referrer = file.name.strip_prefix(NODE_MODULES).and_then(NpmLocation::parse);

    let mut outputs = Vec::new();
    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    for occurrence in &occurrences {
        match resolve_occurrence(&session, &handle, &file.name, referrer.as_ref(), occurrence)
            .await
        {
            Ok(Some(replacement)) => edits.push((occurrence.start, occurrence.end, replacement)),
            Ok(None) => {}
            Err(err) => outputs.push(BuildOutput::Diagnostic {
                filename: file.name.clone(),
                diagnostic: Diagnostic::error(err.to_string(), range_of(&file.content, occurrence)),
            }),
        }
    }

    let content = apply_edits(file.content, edits);
    outputs.insert(
        0,
        BuildOutput::File {
            file: BuildFile {
                name: file.name,
                content,
                content_type: file.content_type,
            },
        },
    );
    outputs
}

/// Resolve one specifier occurrence to its rewritten replacement text.
///
/// Returns `Ok(None)` when the specifier is intentionally left untouched
/// (URLs, and relative imports in project-local files).
async fn resolve_occurrence<F: CdnFetch>(
    session: &Arc<Session<F>>,
    handle: &MergerHandle<BuildOutput>,
    referrer_name: &str,
    referrer: Option<&NpmLocation>,
    occurrence: &ImportOccurrence,
) -> Result<Option<String>, CdnError> {
    let spec = occurrence.specifier.as_str();
    match specifier::classify(spec) {
        SpecifierKind::Url => Ok(None),
        SpecifierKind::Bare => {
            let location = NpmLocation::parse(spec)
                .ok_or_else(|| CdnError::InvalidSpecifier(spec.to_string()))?;
            let canonical = resolve_bare(session, location, referrer).await?;
            schedule_dependency(session, handle, &canonical);
            Ok(Some(specifier::relative_path_between(
                referrer_name,
                &format!("{NODE_MODULES}{}", canonical.serialize()),
            )))
        }
        SpecifierKind::Relative => {
            // Relative imports in project-local files never touch the CDN.
            let Some(referrer) = referrer else {
                return Ok(None);
            };
            let sibling = referrer.with_path(specifier::resolve_relative(&referrer.path, spec));
            // `./x` may publish as `./x.js` or `./x/index.js`; the CDN's
            // redirect decides.
            let canonical = session.cdn.canonicalize(&sibling).await?;
            schedule_dependency(session, handle, &canonical);
            Ok(Some(specifier::relative_path_between(
                referrer_name,
                &format!("{NODE_MODULES}{}", canonical.serialize()),
            )))
        }
    }
}

/// Resolve a bare location to a canonical one.
///
/// An unspecified version resolves against the nearest enclosing manifest's
/// declared range (the referrer package's own `package.json`, or the project
/// manifest for project files), defaulting to `latest`. An unspecified path
/// resolves through the dependency's `module`/`main` fields, defaulting to
/// `index.js`.
async fn resolve_bare<F: CdnFetch>(
    session: &Arc<Session<F>>,
    location: NpmLocation,
    referrer: Option<&NpmLocation>,
) -> Result<NpmLocation, CdnError> {
    let mut location = location;

    if location.version.is_empty() {
        let declared = match referrer {
            Some(r) => session
                .cdn
                .fetch_package_json(&r.pkg, &r.version)
                .await
                .ok()
                .and_then(|manifest| manifest.dependency_range(&location.pkg).map(String::from)),
            None => session
                .project_manifest
                .clone()
                .await
                .and_then(|manifest| manifest.dependency_range(&location.pkg).map(String::from)),
        };
        location = location.with_version(declared.unwrap_or_else(|| "latest".to_string()));
    }

    if location.path.is_empty() {
        let path = match session
            .cdn
            .fetch_package_json(&location.pkg, &location.version)
            .await
        {
            Ok(manifest) => manifest
                .module
                .or(manifest.main)
                .unwrap_or_else(|| "index.js".to_string()),
            // A dependency with an unparsable manifest still gets the
            // conventional entry point.
            Err(CdnError::InvalidJson { .. }) => "index.js".to_string(),
            Err(err) => return Err(err),
        };
        location = location.with_path(path.trim_start_matches("./"));
    }

    session.cdn.canonicalize(&location).await
}

/// Schedule the fetch (and recursive rewrite) of a dependency file, at most
/// once per canonical key.
fn schedule_dependency<F: CdnFetch>(
    session: &Arc<Session<F>>,
    handle: &MergerHandle<BuildOutput>,
    location: &NpmLocation,
) {
    let key = location.serialize();
    if !session.handled.lock().unwrap().insert(key) {
        return;
    }
    let session = session.clone();
    let task_handle = handle.clone();
    let location = location.clone();
    handle.add(
        stream::once(async move { fetch_dependency(session, task_handle, location).await })
            .map(stream::iter)
            .flatten(),
    );
}

/// Fetch one dependency file and run it through the same rewriting.
async fn fetch_dependency<F: CdnFetch>(
    session: Arc<Session<F>>,
    handle: MergerHandle<BuildOutput>,
    location: NpmLocation,
) -> Vec<BuildOutput> {
    let name = format!("{NODE_MODULES}{}", location.serialize());
    match session.cdn.fetch(&location).await {
        Ok(file) => {
            let file = BuildFile {
                name,
                content: file.content.clone(),
                content_type: file.content_type.clone(),
            };
            if is_js(&file.name) {
                rewrite_module(session, handle, file).await
            } else {
                vec![BuildOutput::File { file }]
            }
        }
        Err(err) => vec![BuildOutput::Diagnostic {
            filename: name,
            diagnostic: Diagnostic::error(err.to_string(), Range::default()),
        }],
    }
}

fn range_of(source: &str, occurrence: &ImportOccurrence) -> Range {
    Range {
        start: scan::position_at(source, occurrence.start),
        end: scan::position_at(source, occurrence.end),
    }
}

/// Splice replacements into the source, highest offset first.
fn apply_edits(source: String, mut edits: Vec<(usize, usize, String)>) -> String {
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = source;
    for (start, end, replacement) in edits {
        out.replace_range(start..end, &replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::fake::{FakeCdn, FAKE_BASE};
    use crate::output::{Position, Severity};

    fn transformer(setup: impl FnOnce(&mut FakeCdn)) -> BareModuleTransformer<FakeCdn> {
        let mut fake = FakeCdn::new();
        setup(&mut fake);
        BareModuleTransformer::new(CachingCdn::new(FAKE_BASE, fake).unwrap())
    }

    async fn run(
        transformer: BareModuleTransformer<FakeCdn>,
        artifacts: Vec<BuildOutput>,
    ) -> Vec<BuildOutput> {
        transformer.process(stream::iter(artifacts)).collect().await
    }

    fn files(outputs: &[BuildOutput]) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = outputs
            .iter()
            .filter_map(|o| match o {
                BuildOutput::File { file } => Some((file.name.as_str(), file.content.as_str())),
                BuildOutput::Diagnostic { .. } => None,
            })
            .collect();
        out.sort_unstable();
        out
    }

    fn diagnostics(outputs: &[BuildOutput]) -> Vec<(&str, &Diagnostic)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                BuildOutput::Diagnostic {
                    filename,
                    diagnostic,
                } => Some((filename.as_str(), diagnostic)),
                BuildOutput::File { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_rewrite() {
        let t = transformer(|f| f.add_file("foo", "1.0.0", "index.js", "foo1"));
        let outputs = run(t, vec![BuildOutput::file("index.js", "import \"foo/index.js\";")]).await;

        assert!(diagnostics(&outputs).is_empty());
        assert_eq!(
            files(&outputs),
            vec![
                ("index.js", "import \"./node_modules/foo@1.0.0/index.js\";"),
                ("node_modules/foo@1.0.0/index.js", "foo1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_main_entry_discovery_module_over_main() {
        let t = transformer(|f| {
            f.add_file(
                "foo",
                "1.0.0",
                "package.json",
                r#"{"main": "cjs/index.js", "module": "esm/index.js"}"#,
            );
            f.add_file("foo", "1.0.0", "esm/index.js", "esm");
            f.add_file("foo", "1.0.0", "cjs/index.js", "cjs");
        });
        let outputs = run(t, vec![BuildOutput::file("app.js", "import foo from \"foo\";")]).await;

        assert_eq!(
            files(&outputs),
            vec![
                ("app.js", "import foo from \"./node_modules/foo@1.0.0/esm/index.js\";"),
                ("node_modules/foo@1.0.0/esm/index.js", "esm"),
            ]
        );
    }

    #[tokio::test]
    async fn test_version_precedence_from_project_manifest() {
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "package.json", r#"{"main": "index.js"}"#);
            f.add_file("foo", "1.0.0", "index.js", "v1");
            f.add_file("foo", "2.0.0", "package.json", r#"{"main": "index.js"}"#);
            f.add_file("foo", "2.0.0", "index.js", "v2");
        });
        let outputs = run(
            t,
            vec![
                BuildOutput::file("package.json", r#"{"dependencies": {"foo": "^1.0.0"}}"#),
                BuildOutput::file("app.js", "import \"foo\";"),
            ],
        )
        .await;

        assert_eq!(
            files(&outputs),
            vec![
                ("app.js", "import \"./node_modules/foo@1.0.0/index.js\";"),
                ("node_modules/foo@1.0.0/index.js", "v1"),
                ("package.json", r#"{"dependencies": {"foo": "^1.0.0"}}"#),
            ]
        );
    }

    #[tokio::test]
    async fn test_manifest_seen_after_dependent_module() {
        // The module task starts before package.json arrives; it must wait
        // for the deferred manifest rather than defaulting to latest.
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "index.js", "v1");
            f.add_file("foo", "2.0.0", "index.js", "v2");
        });
        let outputs = run(
            t,
            vec![
                BuildOutput::file("app.js", "import \"foo/index.js\";"),
                BuildOutput::file("package.json", r#"{"dependencies": {"foo": "^1.0.0"}}"#),
            ],
        )
        .await;

        assert!(files(&outputs)
            .iter()
            .any(|(name, _)| *name == "node_modules/foo@1.0.0/index.js"));
    }

    #[tokio::test]
    async fn test_malformed_project_manifest_falls_back_to_latest() {
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "index.js", "v1");
            f.add_file("foo", "2.0.0", "index.js", "v2");
        });
        let outputs = run(
            t,
            vec![
                BuildOutput::file("package.json", "{ this is not json"),
                BuildOutput::file("app.js", "import \"foo/index.js\";"),
            ],
        )
        .await;

        assert!(diagnostics(&outputs).is_empty());
        assert_eq!(
            files(&outputs),
            vec![
                ("app.js", "import \"./node_modules/foo@2.0.0/index.js\";"),
                ("node_modules/foo@2.0.0/index.js", "v2"),
                ("package.json", "{ this is not json"),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_package_diagnostic() {
        let t = transformer(|_| {});
        let source = "import \"non-existent/index.js\";";
        let outputs = run(t, vec![BuildOutput::file("index.js", source)]).await;

        // Original import line left unchanged.
        assert_eq!(files(&outputs), vec![("index.js", source)]);

        let diags = diagnostics(&outputs);
        assert_eq!(diags.len(), 1);
        let (filename, diagnostic) = diags[0];
        assert_eq!(filename, "index.js");
        assert!(diagnostic
            .message
            .contains("Cannot find package 'non-existent'"));
        assert_eq!(diagnostic.severity, Some(Severity::Error));
        assert_eq!(diagnostic.range.start, Position { line: 0, character: 8 });
        assert_eq!(diagnostic.range.end, Position { line: 0, character: 29 });
    }

    #[tokio::test]
    async fn test_import_cycle_fetched_once() {
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "index.js", "import \"./other.js\"; export const a = 1;");
            f.add_file("foo", "1.0.0", "other.js", "import \"./index.js\"; export const b = 2;");
        });
        let outputs = run(t, vec![BuildOutput::file("app.js", "import \"foo/index.js\";")]).await;

        assert!(diagnostics(&outputs).is_empty());
        // app.js + exactly one copy of each cycle member.
        let names: Vec<&str> = files(&outputs).iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "app.js",
                "node_modules/foo@1.0.0/index.js",
                "node_modules/foo@1.0.0/other.js",
            ]
        );
    }

    #[tokio::test]
    async fn test_relative_in_dependency_canonicalized() {
        // Extension-less relative import inside a fetched dependency file.
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "index.js", "import \"./lib/util\";");
            f.add_file("foo", "1.0.0", "lib/util.js", "u");
        });
        let outputs = run(t, vec![BuildOutput::file("app.js", "import \"foo/index.js\";")]).await;

        assert_eq!(
            files(&outputs),
            vec![
                ("app.js", "import \"./node_modules/foo@1.0.0/index.js\";"),
                ("node_modules/foo@1.0.0/index.js", "import \"./lib/util.js\";"),
                ("node_modules/foo@1.0.0/lib/util.js", "u"),
            ]
        );
    }

    #[tokio::test]
    async fn test_cross_package_relative_rewrite() {
        let t = transformer(|f| {
            f.add_file("foo", "1.0.0", "index.js", "import \"bar\";");
            f.add_file("bar", "2.0.0", "package.json", r#"{"main": "main.js"}"#);
            f.add_file("bar", "2.0.0", "main.js", "bar");
        });
        let outputs = run(t, vec![BuildOutput::file("app.js", "import \"foo/index.js\";")]).await;

        // Bare import inside node_modules/foo@1.0.0 rewrites relative to it.
        assert!(files(&outputs).contains(&(
            "node_modules/foo@1.0.0/index.js",
            "import \"../bar@2.0.0/main.js\";"
        )));
    }

    #[tokio::test]
    async fn test_project_relative_and_url_untouched() {
        let t = transformer(|_| {});
        let source = "import \"./local.js\";\nimport \"https://cdn.example.com/x.js\";";
        let outputs = run(t, vec![BuildOutput::file("app.js", source)]).await;

        assert!(diagnostics(&outputs).is_empty());
        assert_eq!(files(&outputs), vec![("app.js", source)]);
    }

    #[tokio::test]
    async fn test_non_js_passed_through() {
        let t = transformer(|_| {});
        let outputs = run(
            t,
            vec![BuildOutput::file("styles.css", "body {}")],
        )
        .await;
        assert_eq!(files(&outputs), vec![("styles.css", "body {}")]);
    }

    #[tokio::test]
    async fn test_dynamic_import_rewritten() {
        let t = transformer(|f| f.add_file("foo", "1.0.0", "index.js", "foo1"));
        let outputs = run(
            t,
            vec![BuildOutput::file(
                "app.js",
                "const p = import(\"foo/index.js\");",
            )],
        )
        .await;

        assert!(files(&outputs).contains(&(
            "app.js",
            "const p = import(\"./node_modules/foo@1.0.0/index.js\");"
        )));
    }

    #[tokio::test]
    async fn test_multiple_occurrences_rewritten_back_to_front() {
        let t = transformer(|f| {
            f.add_file("a", "1.0.0", "index.js", "a");
            f.add_file("b", "1.0.0", "index.js", "b");
        });
        let source = "import \"a/index.js\";\nimport \"b/index.js\";";
        let outputs = run(t, vec![BuildOutput::file("app.js", source)]).await;

        assert!(files(&outputs).contains(&(
            "app.js",
            "import \"./node_modules/a@1.0.0/index.js\";\nimport \"./node_modules/b@1.0.0/index.js\";"
        )));
    }

    #[tokio::test]
    async fn test_failed_specifier_leaves_others_resolved() {
        let t = transformer(|f| f.add_file("good", "1.0.0", "index.js", "g"));
        let source = "import \"missing/x.js\";\nimport \"good/index.js\";";
        let outputs = run(t, vec![BuildOutput::file("app.js", source)]).await;

        assert_eq!(diagnostics(&outputs).len(), 1);
        assert!(files(&outputs).contains(&(
            "app.js",
            "import \"missing/x.js\";\nimport \"./node_modules/good@1.0.0/index.js\";"
        )));
    }
}
