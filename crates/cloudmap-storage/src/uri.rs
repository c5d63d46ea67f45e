//! Storage URI parsing.
//!
//! URIs have the shape `scheme://authority[/path][?key=value&...]`. The
//! authority names the account or bucket, the path an optional container
//! and root inside it, and the query carries backend options.

use cloudmap_core::error::CloudMapError;
use cloudmap_core::Result;

/// A parsed storage URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub scheme: String,
    pub authority: String,
    /// Path after the authority, without leading or trailing `/`.
    pub path: String,
    query: Option<String>,
}

impl StorageUri {
    /// Parse `scheme://authority/path?query`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| CloudMapError::Config {
            message: format!("Storage URI must have the form 'scheme://...': {uri}"),
        })?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query.to_string())),
            None => (rest, None),
        };

        let mut parts = location.splitn(2, '/');
        let authority = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").trim_matches('/').to_string();

        if scheme.is_empty() || authority.is_empty() {
            return Err(CloudMapError::Config {
                message: format!("Storage URI must include a scheme and a name: {uri}"),
            });
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority,
            path,
            query,
        })
    }

    /// Value of a query parameter, if present.
    pub fn param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        extract_query_param(query, name)
    }

    /// Whether a boolean query flag is set to `true` or `1`.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.param(name).as_deref(), Some("true") | Some("1"))
    }

    /// Split the path into its first segment and the remainder.
    ///
    /// `container/root/dir` → `("container", "root/dir")`
    pub fn split_path(&self) -> (&str, &str) {
        match self.path.split_once('/') {
            Some((first, rest)) => (first, rest),
            None => (self.path.as_str(), ""),
        }
    }

    /// Fail unless the path has a non-empty first segment, naming it `what`.
    pub fn require_first_segment(&self, what: &str) -> Result<(&str, &str)> {
        let (first, rest) = self.split_path();
        if first.is_empty() {
            return Err(CloudMapError::Config {
                message: format!(
                    "{}:// URI must include a {what}: {}://{}",
                    self.scheme, self.scheme, self.authority
                ),
            });
        }
        Ok((first, rest))
    }
}

/// Extract a query parameter value from a query string.
fn extract_query_param(query: &str, param: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        if kv.next()? == param {
            return kv.next().map(|v| v.to_string());
        }
    }
    None
}
