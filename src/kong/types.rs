//! Wire types of the Kong Admin API.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for Kong Admin API calls.
///
/// Reconcilers branch on the taxonomy: not-found is a valid answer on reads,
/// conflicts are tolerated on upserts, everything else requeues.
#[derive(Debug, Error)]
pub enum KongError {
    /// The request never produced an HTTP response
    #[error("kong request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The gateway answered with a non-success status
    #[error("[{status}] {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Raw response body, useful for operator-facing messages
        body: String,
    },

    /// The gateway answered 2xx with a body we could not decode
    #[error("failed decoding kong response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Client-side regexp filter was invalid
    #[error("invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The gateway answered something structurally unexpected
    #[error("unexpected kong response: {0}")]
    InvalidResponse(String),
}

impl KongError {
    /// Returns true for a 404 answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Returns true for a 409 answer
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status: 409, .. })
    }
}

/// A Kong api object
/// ref: https://getkong.org/docs/0.10.x/admin-api/#api-object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Api {
    /// Server-assigned UUID; carrying it into a PUT updates in place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Client-chosen unique name, used as the primary key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Hostnames routed by this api
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Optional path prefixes routed by this api
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,

    /// Forward the original Host header to the upstream
    #[serde(default)]
    pub preserve_host: bool,

    /// Where the gateway forwards matched requests
    pub upstream_url: String,

    /// Creation timestamp in epoch milliseconds, server-assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// A page (or the concatenation of all pages) of Kong api objects
/// ref: https://getkong.org/docs/0.10.x/admin-api/#list-apis
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ApiList {
    /// Number of objects in this page
    #[serde(default)]
    pub total: u64,

    /// The api objects
    #[serde(default)]
    pub data: Vec<Api>,

    /// URL of the next page; empty or absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    /// Continuation token to request the next page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

/// Semantic version of a Kong node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KongVersion {
    /// Major version component
    pub major: u64,
    /// Minor version component
    pub minor: u64,
    /// Patch version component
    pub patch: u64,
}

impl KongVersion {
    /// Parse a `major.minor.patch` version string
    pub fn parse(version: &str) -> Result<Self, KongError> {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() < 3 {
            return Err(KongError::InvalidResponse(format!(
                "version not in semantic form: {version}"
            )));
        }
        let number = |s: &str| {
            s.parse::<u64>().map_err(|e| {
                KongError::InvalidResponse(format!("failed converting version '{version}': {e}"))
            })
        };
        Ok(Self {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
        })
    }
}

impl fmt::Display for KongVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_semantic_strings() {
        let v = KongVersion::parse("0.10.3").unwrap();
        assert_eq!(
            v,
            KongVersion {
                major: 0,
                minor: 10,
                patch: 3
            }
        );
        assert_eq!(v.to_string(), "v0.10.3");
    }

    #[test]
    fn version_rejects_short_or_garbage_strings() {
        assert!(KongVersion::parse("0.10").is_err());
        assert!(KongVersion::parse("a.b.c").is_err());
    }

    #[test]
    fn error_taxonomy_helpers() {
        let nf = KongError::Status {
            status: 404,
            body: "Not found".into(),
        };
        assert!(nf.is_not_found());
        assert!(!nf.is_conflict());

        let conflict = KongError::Status {
            status: 409,
            body: "already exists".into(),
        };
        assert!(conflict.is_conflict());
    }

    #[test]
    fn api_serializes_without_unset_optionals() {
        let api = Api {
            name: Some("app.example.io~default~300030".into()),
            hosts: vec!["app.example.io".into()],
            upstream_url: "http://web.default.svc.cluster.local:80".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&api).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("uris").is_none());
        assert!(json.get("created_at").is_none());
        assert_eq!(json["preserve_host"], false);
    }
}
