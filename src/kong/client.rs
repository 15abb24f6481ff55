//! HTTP client for the Kong Admin API.

use std::time::Duration;

use reqwest::Url;

use super::types::{KongError, KongVersion};

/// Deadline for individual Admin API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for a Kong node's Admin API.
///
/// Cheap to clone; holds a pooled [`reqwest::Client`] with a 2 second
/// request deadline.
#[derive(Clone, Debug)]
pub struct KongClient {
    pub(super) http: reqwest::Client,
    pub(super) base_url: Url,
}

impl KongClient {
    /// Create a client for the Admin API at `admin_host`,
    /// e.g. `http://127.0.0.1:8001`
    pub fn new(admin_host: &str) -> Result<Self, KongError> {
        let base_url = Url::parse(admin_host)
            .map_err(|e| KongError::InvalidResponse(format!("invalid admin url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, base_url })
    }

    pub(super) fn url(&self, path: &str) -> Result<Url, KongError> {
        self.base_url
            .join(path)
            .map_err(|e| KongError::InvalidResponse(format!("invalid admin path {path}: {e}")))
    }

    /// Retrieve the version of the Kong node from its information endpoint
    pub async fn server_version(&self) -> Result<KongVersion, KongError> {
        let resp = self.http.get(self.base_url.clone()).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(KongError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let info: serde_json::Value = serde_json::from_str(&body)?;
        let version = info
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                KongError::InvalidResponse(format!("could not extract a version from: {info}"))
            })?;
        KongVersion::parse(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn server_version_reads_the_info_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hostname": "kong-0",
                "version": "0.10.3",
            })))
            .mount(&server)
            .await;

        let client = KongClient::new(&server.uri()).unwrap();
        let version = client.server_version().await.unwrap();
        assert_eq!(version.minor, 10);
    }

    #[tokio::test]
    async fn server_version_rejects_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"hostname": "x"})),
            )
            .mount(&server)
            .await;

        let client = KongClient::new(&server.uri()).unwrap();
        let err = client.server_version().await.unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn rejects_unparseable_admin_url() {
        assert!(KongClient::new("not a url").is_err());
    }
}
