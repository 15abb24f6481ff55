//! Operations on the Kong api objects collection.

use regex::Regex;

use super::client::KongClient;
use super::types::{Api, ApiList, KongError};

impl KongClient {
    /// List api objects, transparently following the `next`/`offset`
    /// continuation until the collection is exhausted.
    pub async fn list_apis(&self, params: &[(&str, &str)]) -> Result<ApiList, KongError> {
        let mut data = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut req = self.http.get(self.url("/apis")?).query(params);
            if let Some(off) = offset.as_deref() {
                req = req.query(&[("offset", off)]);
            }
            let resp = req.send().await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(KongError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let page: ApiList = serde_json::from_str(&body)?;
            data.extend(page.data);

            match (page.next.as_deref(), page.offset) {
                (Some(next), Some(off)) if !next.is_empty() => offset = Some(off),
                _ => break,
            }
        }

        Ok(ApiList {
            total: data.len() as u64,
            data,
            next: None,
            offset: None,
        })
    }

    /// List api objects whose name matches `pattern`. The Admin API has no
    /// server-side name search, so the filter runs client-side over a full
    /// listing.
    pub async fn list_apis_by_regexp(
        &self,
        params: &[(&str, &str)],
        pattern: &str,
    ) -> Result<ApiList, KongError> {
        let re = Regex::new(pattern)?;
        let list = self.list_apis(params).await?;
        let data: Vec<Api> = list
            .data
            .into_iter()
            .filter(|api| api.name.as_deref().is_some_and(|n| re.is_match(n)))
            .collect();
        Ok(ApiList {
            total: data.len() as u64,
            data,
            next: None,
            offset: None,
        })
    }

    /// Get an api object by name. A 404 answer is not an error.
    pub async fn get_api(&self, name: &str) -> Result<Option<Api>, KongError> {
        let resp = self
            .http
            .get(self.url(&format!("/apis/{name}"))?)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        match status.as_u16() {
            404 => Ok(None),
            _ if status.is_success() => Ok(Some(serde_json::from_str(&body)?)),
            s => Err(KongError::Status { status: s, body }),
        }
    }

    /// Create or update an api object with a PUT on the collection. The
    /// gateway updates in place when `api.id` is set and creates otherwise.
    /// A 409 answer surfaces as [`KongError::Status`]; callers decide whether
    /// to tolerate it.
    pub async fn upsert_api(&self, api: &Api) -> Result<Api, KongError> {
        let resp = self
            .http
            .put(self.url("/apis")?)
            .json(api)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(KongError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Delete an api object by name or id
    pub async fn delete_api(&self, name_or_id: &str) -> Result<(), KongError> {
        let resp = self
            .http
            .delete(self.url(&format!("/apis/{name_or_id}"))?)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(KongError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
