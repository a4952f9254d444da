//! `barewire types` command implementation.

use super::rewrite::write_output;
use barewire_core::{CachingCdn, HttpFetch, PackageJson, TypesFetcher};
use miette::{IntoDiagnostic, Result};
use std::path::Path;
use tracing::{debug, info};

/// Run the types command.
///
/// Crawls the declaration closure of the packages `entry` imports and writes
/// the assembled `node_modules/` tree under `out`. A `package.json` next to
/// `entry` supplies version ranges.
pub async fn run(entry: &Path, out: &Path, cdn: &str) -> Result<()> {
    let cdn = CachingCdn::new(cdn, HttpFetch::new().into_diagnostic()?).into_diagnostic()?;
    let source = tokio::fs::read_to_string(entry).await.into_diagnostic()?;
    let manifest = read_sibling_manifest(entry).await;

    let fetcher = TypesFetcher::new(cdn, manifest);
    fetcher.add_source_file(&source);
    let typings = fetcher.get_files().await;

    for file in &typings.files {
        debug!(name = %file.name, "writing");
        write_output(out, &file.name, &file.content).await?;
    }
    info!(
        files = typings.files.len(),
        libs = ?typings.libs,
        "typings assembled"
    );
    Ok(())
}

/// The `package.json` next to the entry file, when present and parsable.
async fn read_sibling_manifest(entry: &Path) -> Option<PackageJson> {
    let path = entry.parent()?.join("package.json");
    let content = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}
