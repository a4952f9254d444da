//! Error types for CDN resolution.
//!
//! Errors are `Clone` because in-flight results are shared between concurrent
//! callers (request coalescing): every waiter gets the same failure.

use thiserror::Error;

/// Error raised while resolving or fetching through the CDN.
#[derive(Debug, Clone, Error)]
pub enum CdnError {
    /// The CDN answered with a non-200 status. Carries the response body so
    /// diagnostics can surface the CDN's own message (e.g. a 404 body).
    #[error("CDN returned {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The request never produced a response (DNS, connect, timeout).
    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    /// A fetched body that had to be JSON was not.
    #[error("invalid JSON from {url}: {message}\n{body}")]
    InvalidJson {
        url: String,
        message: String,
        body: String,
    },

    /// A bare specifier that does not parse as an npm location.
    #[error("invalid module specifier \"{0}\"")]
    InvalidSpecifier(String),

    /// The configured CDN base URL is not a valid URL.
    #[error("invalid CDN base URL '{url}': {message}")]
    BaseUrl { url: String, message: String },
}
