//! Module specifier scanner.
//!
//! Scans JavaScript/TypeScript source for import/export/dynamic-import
//! specifiers without full parsing. Unlike a lexer-grade scanner it is
//! comment-aware but not string-aware; that matches what the rewriting layer
//! needs and keeps the pass single and cheap.
//!
//! Every occurrence carries the byte offsets of the specifier text (quotes
//! excluded), so rewrites can splice the original source back-to-front.

use crate::output::Position;

/// Kind of specifier occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import ... from "x"` or `import "x"`.
    Static,
    /// `export ... from "x"`.
    ExportFrom,
    /// `import("x")` with a string-literal argument.
    Dynamic,
}

/// One specifier occurrence in source order.
///
/// Occurrences are not deduplicated; the same specifier imported twice is
/// reported twice, because each occurrence is rewritten in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOccurrence {
    /// Specifier text exactly as written (quotes excluded).
    pub specifier: String,
    /// Byte offset of the first specifier character.
    pub start: usize,
    /// Byte offset one past the last specifier character.
    pub end: usize,
    pub kind: ImportKind,
}

/// Scan source for statically analyzable module specifiers.
///
/// A dynamic `import(...)` whose argument is not a string literal is skipped:
/// there is nothing actionable to resolve or rewrite.
#[must_use]
pub fn scan_module_specifiers(source: &str) -> Vec<ImportOccurrence> {
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        // Skip single-line comments
        if bytes[i] == b'/' && i + 1 < len && bytes[i + 1] == b'/' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        // Skip block comments
        if bytes[i] == b'/' && i + 1 < len && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(len);
            continue;
        }

        if matches_keyword(bytes, i, b"import") {
            if let Some((occ, end)) = scan_import(source, bytes, i + 6) {
                out.push(occ);
                i = end;
            } else {
                i += 6;
            }
            continue;
        }

        if matches_keyword(bytes, i, b"export") {
            if let Some((occ, end)) = scan_export_from(source, bytes, i + 6) {
                out.push(occ);
                i = end;
            } else {
                i += 6;
            }
            continue;
        }

        i += 1;
    }

    out
}

/// Check if bytes at `pos` match a keyword with word boundaries on both sides.
fn matches_keyword(bytes: &[u8], pos: usize, keyword: &[u8]) -> bool {
    if pos + keyword.len() > bytes.len() || &bytes[pos..pos + keyword.len()] != keyword {
        return false;
    }
    if pos > 0 && is_ident_byte(bytes[pos - 1]) {
        return false;
    }
    if pos + keyword.len() < bytes.len() && is_ident_byte(bytes[pos + keyword.len()]) {
        return false;
    }
    true
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn is_quote(b: u8) -> bool {
    b == b'"' || b == b'\'' || b == b'`'
}

/// Read a string literal starting at the opening quote.
///
/// Returns the specifier occurrence bounds and the byte offset past the
/// closing quote.
fn scan_string(bytes: &[u8], quote_pos: usize) -> Option<(usize, usize, usize)> {
    let quote = bytes[quote_pos];
    let start = quote_pos + 1;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            return Some((start, i, i + 1));
        }
        i += 1;
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Scan after the `import` keyword: side-effect import, `from` clause, or
/// dynamic `import(...)`.
fn scan_import(source: &str, bytes: &[u8], after_kw: usize) -> Option<(ImportOccurrence, usize)> {
    let i = skip_whitespace(bytes, after_kw);
    if i >= bytes.len() {
        return None;
    }

    // Dynamic import: import("...")
    if bytes[i] == b'(' {
        let j = skip_whitespace(bytes, i + 1);
        if j < bytes.len() && is_quote(bytes[j]) {
            let (start, end, past) = scan_string(bytes, j)?;
            return Some((
                ImportOccurrence {
                    specifier: source[start..end].to_string(),
                    start,
                    end,
                    kind: ImportKind::Dynamic,
                },
                past,
            ));
        }
        // Non-literal argument: statically unresolvable, leave untouched.
        return None;
    }

    // Side-effect import: import "specifier"
    if is_quote(bytes[i]) {
        let (start, end, past) = scan_string(bytes, i)?;
        return Some((
            ImportOccurrence {
                specifier: source[start..end].to_string(),
                start,
                end,
                kind: ImportKind::Static,
            },
            past,
        ));
    }

    scan_from_clause(source, bytes, i, ImportKind::Static)
}

/// Scan after the `export` keyword for a `from "specifier"` clause.
fn scan_export_from(
    source: &str,
    bytes: &[u8],
    after_kw: usize,
) -> Option<(ImportOccurrence, usize)> {
    scan_from_clause(source, bytes, after_kw, ImportKind::ExportFrom)
}

/// Look ahead (bounded) for `from "specifier"`.
fn scan_from_clause(
    source: &str,
    bytes: &[u8],
    start: usize,
    kind: ImportKind,
) -> Option<(ImportOccurrence, usize)> {
    let limit = (start + 1000).min(bytes.len());
    let mut i = start;
    while i < limit {
        if bytes[i] == b';' {
            return None;
        }
        if matches_keyword(bytes, i, b"from") {
            let j = skip_whitespace(bytes, i + 4);
            if j < bytes.len() && is_quote(bytes[j]) {
                let (spec_start, spec_end, past) = scan_string(bytes, j)?;
                return Some((
                    ImportOccurrence {
                        specifier: source[spec_start..spec_end].to_string(),
                        start: spec_start,
                        end: spec_end,
                        kind,
                    },
                    past,
                ));
            }
            return None;
        }
        i += 1;
    }
    None
}

/// 0-based line/character position of a byte offset.
#[must_use]
pub fn position_at(source: &str, offset: usize) -> Position {
    let before = &source[..offset.min(source.len())];
    let line = before.bytes().filter(|&b| b == b'\n').count();
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let character = before[line_start..].chars().count();
    #[allow(clippy::cast_possible_truncation)]
    Position {
        line: line as u32,
        character: character as u32,
    }
}

/// Kind of triple-slash reference directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `/// <reference lib="..." />`
    Lib,
    /// `/// <reference types="..." />`
    Types,
}

/// A triple-slash reference directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDirective {
    pub kind: ReferenceKind,
    pub name: String,
}

/// Scan for `/// <reference lib="..."/>` and `/// <reference types="..."/>`.
#[must_use]
pub fn scan_reference_directives(source: &str) -> Vec<ReferenceDirective> {
    let mut out = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("///") else {
            continue;
        };
        let Some(tag_start) = rest.find("<reference") else {
            continue;
        };
        let attrs = &rest[tag_start + "<reference".len()..];
        if let Some(name) = extract_attr(attrs, "lib") {
            out.push(ReferenceDirective {
                kind: ReferenceKind::Lib,
                name,
            });
        } else if let Some(name) = extract_attr(attrs, "types") {
            out.push(ReferenceDirective {
                kind: ReferenceKind::Types,
                name,
            });
        }
    }
    out
}

/// Extract `name="value"` from a directive attribute list.
fn extract_attr(attrs: &str, name: &str) -> Option<String> {
    let idx = attrs.find(&format!("{name}="))?;
    let after = &attrs[idx + name.len() + 1..];
    let quote = after.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &after[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(source: &str) -> Vec<(String, ImportKind)> {
        scan_module_specifiers(source)
            .into_iter()
            .map(|o| (o.specifier, o.kind))
            .collect()
    }

    #[test]
    fn test_import_from() {
        assert_eq!(
            specs(r#"import { foo } from "./dep.js";"#),
            vec![("./dep.js".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_import_default() {
        assert_eq!(
            specs(r#"import foo from "lodash";"#),
            vec![("lodash".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_side_effect_import_offsets() {
        let source = r#"import "non-existent/index.js";"#;
        let occs = scan_module_specifiers(source);
        assert_eq!(occs.len(), 1);
        assert_eq!(occs[0].start, 8);
        assert_eq!(occs[0].end, 29);
        assert_eq!(&source[occs[0].start..occs[0].end], "non-existent/index.js");
    }

    #[test]
    fn test_import_star() {
        assert_eq!(
            specs(r#"import * as utils from "./utils.js";"#),
            vec![("./utils.js".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_dynamic_import() {
        assert_eq!(
            specs(r#"const m = await import("./lazy.js");"#),
            vec![("./lazy.js".to_string(), ImportKind::Dynamic)]
        );
    }

    #[test]
    fn test_dynamic_import_non_literal_skipped() {
        assert!(specs(r"const m = await import(moduleName);").is_empty());
        assert!(specs(r#"const m = await import("a" + ext);"#).len() == 1);
    }

    #[test]
    fn test_export_from() {
        assert_eq!(
            specs(r#"export { foo } from "./dep.js";"#),
            vec![("./dep.js".to_string(), ImportKind::ExportFrom)]
        );
        assert_eq!(
            specs(r#"export * from "bar";"#),
            vec![("bar".to_string(), ImportKind::ExportFrom)]
        );
    }

    #[test]
    fn test_export_without_from() {
        assert!(specs("export const x = 1;").is_empty());
    }

    #[test]
    fn test_ignores_comments() {
        let source = r#"
// import foo from "commented"
/* import bar from "also-commented" */
import real from "./real.js";
"#;
        assert_eq!(
            specs(source),
            vec![("./real.js".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_occurrences_not_deduplicated() {
        let source = r#"
import a from "./dep.js";
import b from "./dep.js";
"#;
        assert_eq!(scan_module_specifiers(source).len(), 2);
    }

    #[test]
    fn test_multiline_import() {
        let source = "import {\n  a,\n  b,\n} from \"pkg\";";
        assert_eq!(specs(source), vec![("pkg".to_string(), ImportKind::Static)]);
    }

    #[test]
    fn test_import_in_identifier_not_matched() {
        assert!(specs("const reimport = 1;").is_empty());
        assert!(specs("const importx = 1;").is_empty());
    }

    #[test]
    fn test_single_quotes() {
        assert_eq!(
            specs("import foo from './single.js';"),
            vec![("./single.js".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_scoped_package() {
        assert_eq!(
            specs(r#"import x from "@scope/pkg";"#),
            vec![("@scope/pkg".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_empty_source() {
        assert!(specs("").is_empty());
        assert!(specs("console.log('hi');").is_empty());
    }

    #[test]
    fn test_position_at() {
        let source = "import a from \"./a\";\n\nimport b from \"./b\";\n";
        assert_eq!(position_at(source, 0), Position { line: 0, character: 0 });
        assert_eq!(
            position_at(source, 15),
            Position {
                line: 0,
                character: 15
            }
        );
        let b_offset = source.find("./b").unwrap();
        assert_eq!(
            position_at(source, b_offset),
            Position {
                line: 2,
                character: 15
            }
        );
    }

    #[test]
    fn test_reference_directives() {
        let source = r#"
/// <reference lib="dom" />
/// <reference types="node" />
/// <reference path="./other.d.ts" />
import "x";
"#;
        let refs = scan_reference_directives(source);
        assert_eq!(
            refs,
            vec![
                ReferenceDirective {
                    kind: ReferenceKind::Lib,
                    name: "dom".to_string()
                },
                ReferenceDirective {
                    kind: ReferenceKind::Types,
                    name: "node".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_reference_directive_single_quotes() {
        let refs = scan_reference_directives("/// <reference lib='es2020' />");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "es2020");
    }
}
