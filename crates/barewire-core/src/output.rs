//! Build output stream items.
//!
//! The transformer emits an arbitrarily-ordered sequence of these; downstream
//! consumers serve file `name`/`content` bytes verbatim, so the serialized
//! shape is a stable contract.

use serde::{Deserialize, Serialize};

/// One item of a build's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BuildOutput {
    /// An emitted (possibly rewritten) file.
    File { file: BuildFile },
    /// A problem attached to a position in a named file.
    Diagnostic {
        filename: String,
        diagnostic: Diagnostic,
    },
}

impl BuildOutput {
    /// Shorthand for a file output.
    #[must_use]
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::File {
            file: BuildFile {
                name: name.into(),
                content: content.into(),
                content_type: None,
            },
        }
    }
}

/// A named file with its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    pub name: String,
    pub content: String,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A diagnostic message with a source range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl Diagnostic {
    /// An error-severity diagnostic.
    #[must_use]
    pub fn error(message: impl Into<String>, range: Range) -> Self {
        Self {
            message: message.into(),
            range,
            code: None,
            severity: Some(Severity::Error),
        }
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A half-open source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A 0-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}
