//! `barewire rewrite` command implementation.

use barewire_core::{BareModuleTransformer, BuildOutput, CachingCdn, HttpFetch};
use futures::stream::{self, StreamExt};
use miette::{miette, IntoDiagnostic, Result};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Run the rewrite command.
///
/// Feeds every file under `dir` through the transformer and writes the
/// rewritten files (plus the vendored dependency closure) under `out`.
/// Diagnostics are logged; the command fails if any were produced.
pub async fn run(dir: &Path, out: &Path, cdn: &str) -> Result<()> {
    let cdn = CachingCdn::new(cdn, HttpFetch::new().into_diagnostic()?).into_diagnostic()?;
    let artifacts = collect_artifacts(dir)?;
    debug!(count = artifacts.len(), "collected input files");

    let transformer = BareModuleTransformer::new(cdn);
    let mut outputs = transformer.process(stream::iter(artifacts));

    let mut diagnostics = 0usize;
    while let Some(output) = outputs.next().await {
        match output {
            BuildOutput::File { file } => {
                debug!(name = %file.name, "writing");
                write_output(out, &file.name, &file.content).await?;
            }
            BuildOutput::Diagnostic {
                filename,
                diagnostic,
            } => {
                diagnostics += 1;
                warn!(
                    file = %filename,
                    line = diagnostic.range.start.line,
                    character = diagnostic.range.start.character,
                    "{}",
                    diagnostic.message
                );
            }
        }
    }

    if diagnostics > 0 {
        return Err(miette!("{diagnostics} import(s) could not be resolved"));
    }
    Ok(())
}

/// Collect the input files as build artifacts, named by their
/// `/`-separated path relative to `dir`.
fn collect_artifacts(dir: &Path) -> Result<Vec<BuildOutput>> {
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.into_diagnostic()?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .into_diagnostic()?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => artifacts.push(BuildOutput::file(relative, content)),
            Err(err) => warn!(file = %relative, "skipping unreadable file: {err}"),
        }
    }
    Ok(artifacts)
}

/// Write one output file under `out`, creating parent directories.
///
/// Output names come from rewritten specifiers, so path traversal is refused
/// rather than sanitized.
pub(crate) async fn write_output(out: &Path, name: &str, content: &str) -> Result<()> {
    if name.split('/').any(|segment| segment == "..") || name.starts_with('/') {
        return Err(miette!("refusing to write outside output directory: {name}"));
    }
    let path = out.join(name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.into_diagnostic()?;
    }
    tokio::fs::write(&path, content).await.into_diagnostic()
}
