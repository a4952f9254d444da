//! Module specifier classification and npm-style location parsing.
//!
//! Classifies import specifiers like:
//! - `https://example.com/mod.js` (url)
//! - `./app.js`, `../lib/util.js` (relative)
//! - `lodash`, `@scope/name@^1.0.0/path.js` (bare)

use std::fmt;

/// The three kinds of module specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    /// Has a URL scheme, or is a scheme-relative URL (`//host/path`).
    Url,
    /// Starts with `./` or `../`.
    Relative,
    /// Anything else: an npm package reference.
    Bare,
}

/// Classify a module specifier.
#[must_use]
pub fn classify(specifier: &str) -> SpecifierKind {
    if specifier.starts_with("./") || specifier.starts_with("../") {
        return SpecifierKind::Relative;
    }
    if specifier.starts_with("//") || has_scheme(specifier) {
        return SpecifierKind::Url;
    }
    SpecifierKind::Bare
}

/// Check for a leading URL scheme (`protocol:`).
fn has_scheme(specifier: &str) -> bool {
    let Some(colon) = specifier.find(':') else {
        return false;
    };
    let scheme = &specifier[..colon];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

/// A parsed npm-style location: `[@scope/]name[@version][/path]`.
///
/// `version` may be empty (unspecified), a range, a dist-tag, or an exact
/// semver triple. `path` may be empty when the main entry has not been
/// resolved yet. Resolution always produces a new value; a location is never
/// mutated once it has been used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NpmLocation {
    /// Full package name (e.g., "lodash" or "@types/node").
    pub pkg: String,
    /// Version range, dist-tag, or exact version ("" = unspecified).
    pub version: String,
    /// Path within the package ("" = main entry not resolved).
    pub path: String,
}

impl NpmLocation {
    /// Create a location from parts.
    #[must_use]
    pub fn new(
        pkg: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            pkg: pkg.into(),
            version: version.into(),
            path: path.into(),
        }
    }

    /// Parse a bare specifier into a location.
    ///
    /// Scoped names consume exactly one extra `/`-segment before a possible
    /// version. Returns `None` on malformed input (empty name, `@scope`
    /// without a name, empty version after `@`).
    #[must_use]
    pub fn parse(specifier: &str) -> Option<Self> {
        let (pkg, rest) = if let Some(scoped) = specifier.strip_prefix('@') {
            let slash = scoped.find('/')?;
            if slash == 0 {
                return None;
            }
            let after = &scoped[slash + 1..];
            let name_end = after
                .find(|c| c == '@' || c == '/')
                .unwrap_or(after.len());
            if name_end == 0 {
                return None;
            }
            let pkg = format!("@{}/{}", &scoped[..slash], &after[..name_end]);
            (pkg, &after[name_end..])
        } else {
            let name_end = specifier
                .find(|c| c == '@' || c == '/')
                .unwrap_or(specifier.len());
            if name_end == 0 {
                return None;
            }
            (specifier[..name_end].to_string(), &specifier[name_end..])
        };

        let (version, path) = if let Some(rest) = rest.strip_prefix('@') {
            let version_end = rest.find('/').unwrap_or(rest.len());
            if version_end == 0 {
                return None;
            }
            let path = rest
                .get(version_end + 1..)
                .unwrap_or("")
                .to_string();
            (rest[..version_end].to_string(), path)
        } else if let Some(path) = rest.strip_prefix('/') {
            (String::new(), path.to_string())
        } else if rest.is_empty() {
            (String::new(), String::new())
        } else {
            return None;
        };

        Some(Self { pkg, version, path })
    }

    /// Serialize back to `pkg[@version][/path]` form.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = self.pkg.clone();
        if !self.version.is_empty() {
            out.push('@');
            out.push_str(&self.version);
        }
        if !self.path.is_empty() {
            out.push('/');
            out.push_str(&self.path);
        }
        out
    }

    /// New location with a different version.
    #[must_use]
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self::new(self.pkg.clone(), version, self.path.clone())
    }

    /// New location with a different path.
    #[must_use]
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self::new(self.pkg.clone(), self.version.clone(), path)
    }
}

impl fmt::Display for NpmLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// File extension of the last path segment, without the dot.
///
/// Returns `None` when the last segment has no dot, or only a leading dot.
#[must_use]
pub fn file_extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rfind('.') {
        Some(idx) if idx > 0 => Some(&segment[idx + 1..]),
        _ => None,
    }
}

/// Replace (or append) the extension of the last path segment.
#[must_use]
pub fn change_extension(path: &str, ext: &str) -> String {
    match file_extension(path) {
        Some(old) => format!("{}{ext}", &path[..path.len() - old.len()]),
        None => format!("{path}.{ext}"),
    }
}

/// Resolve a relative specifier against the path of the referencing file.
///
/// `base` is a file path; the resolution starts from its directory. `..`
/// segments never escape above the root (they are clamped), since both sides
/// live inside one package.
#[must_use]
pub fn resolve_relative(base: &str, relative: &str) -> String {
    let mut segments: Vec<&str> = base.split('/').collect();
    segments.pop(); // drop the file name

    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Relative URL from one file to another, as written into rewritten imports.
///
/// Both arguments are root-relative file paths. The result always starts with
/// `./` or `../` so that it parses as a relative specifier.
#[must_use]
pub fn relative_path_between(from: &str, to: &str) -> String {
    let mut from_dirs: Vec<&str> = from.split('/').collect();
    from_dirs.pop();
    let to_segments: Vec<&str> = to.split('/').collect();

    let common = from_dirs
        .iter()
        .zip(to_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let ups = from_dirs.len() - common;
    let mut out = String::new();
    if ups == 0 {
        out.push_str("./");
    } else {
        for _ in 0..ups {
            out.push_str("../");
        }
    }
    out.push_str(&to_segments[common..].join("/"));
    out
}
