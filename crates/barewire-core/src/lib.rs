#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

pub mod cdn;
pub mod error;
pub mod layout;
pub mod merge;
pub mod output;
pub mod scan;
pub mod specifier;
pub mod transform;
pub mod typings;

pub use cdn::{CachingCdn, CdnFetch, CdnFile, CdnResponse, HttpFetch, PackageJson, DEFAULT_CDN};
pub use error::CdnError;
pub use layout::{DependencyGraph, NodeModulesDirectory, NodeModulesEntry};
pub use merge::{MergerHandle, StreamMerger};
pub use output::{BuildFile, BuildOutput, Diagnostic, Position, Range, Severity};
pub use scan::{scan_module_specifiers, scan_reference_directives, ImportKind, ImportOccurrence};
pub use specifier::{classify, NpmLocation, SpecifierKind};
pub use transform::BareModuleTransformer;
pub use typings::{TypesFetcher, TypingsFiles};
