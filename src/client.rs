//! Remote API client.
//!
//! The core consumes the [`ApiClient`] trait; [`PercyClient`] is the
//! HTTP implementation speaking the JSON:API build/snapshot endpoints.

use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiErrorDetail, Error};

pub const DEFAULT_API_URL: &str = "https://percy.io/api/v1";

/// Environment variable overriding the API base URL.
pub const ENV_API_URL: &str = "PERCY_API";

/// A created build, as returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub id: String,
    pub number: u64,
    pub url: String,
}

/// Payload for a single snapshot upload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SnapshotUpload {
    pub name: String,
    pub url: Option<String>,
    pub widths: Vec<u32>,
    /// Serialized root resource (usually the captured DOM).
    pub resources: Vec<UploadResource>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub meta: Value,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadResource {
    pub url: String,
    pub mimetype: String,
    pub content: String,
    pub is_root: bool,
}

/// The interface the core drives. Methods return boxed futures so the
/// client can live behind a trait object inside queue tasks.
pub trait ApiClient: Send + Sync {
    fn create_build(&self) -> BoxFuture<'_, Result<BuildInfo, Error>>;

    fn finalize_build<'a>(&'a self, build_id: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    fn send_snapshot<'a>(
        &'a self,
        build_id: &'a str,
        payload: &'a SnapshotUpload,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn add_client_info(&self, info: &str);

    fn add_environment_info(&self, info: &str);
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    source: Option<ApiErrorSource>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorSource {
    #[serde(default)]
    pointer: Option<String>,
}

/// HTTP client for the build/snapshot API.
pub struct PercyClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    client_info: Mutex<Vec<String>>,
    environment_info: Mutex<Vec<String>>,
}

impl PercyClient {
    pub fn new(token: Option<String>) -> Self {
        let base_url = std::env::var(ENV_API_URL)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::with_base_url(base_url, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
            client_info: Mutex::new(Vec::new()),
            environment_info: Mutex::new(Vec::new()),
        }
    }

    fn user_agent(&self) -> String {
        let mut agent = format!("percy-core/{}", env!("CARGO_PKG_VERSION"));
        let client = self.client_info.lock().unwrap().join(" ");
        let env = self.environment_info.lock().unwrap().join(" ");
        if !client.is_empty() {
            agent.push(' ');
            agent.push_str(&client);
        }
        if !env.is_empty() {
            agent.push_str(&format!(" ({env})"));
        }
        agent
    }

    fn authorization(&self) -> Result<String, Error> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Build("missing API token".into()))?;
        Ok(format!("Token token={token}"))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.authorization()?)
            .header("User-Agent", self.user_agent())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if (200..300).contains(&status) {
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }

        let errors = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| {
                body.errors
                    .into_iter()
                    .map(|item| ApiErrorDetail {
                        source_pointer: item.source.and_then(|s| s.pointer),
                        detail: item.detail,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Err(Error::Api {
            status: Some(status),
            errors,
        })
    }
}

impl ApiClient for PercyClient {
    fn create_build(&self) -> BoxFuture<'_, Result<BuildInfo, Error>> {
        Box::pin(async move {
            let body = json!({
                "data": {
                    "type": "builds",
                    "attributes": {}
                }
            });
            let response = self.post("builds", body).await?;
            let data = &response["data"];
            let id = data["id"]
                .as_str()
                .ok_or_else(|| Error::Build("malformed build response".into()))?
                .to_string();
            let number = data["attributes"]["build-number"].as_u64().unwrap_or(0);
            let url = data["attributes"]["web-url"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            Ok(BuildInfo { id, number, url })
        })
    }

    fn finalize_build<'a>(&'a self, build_id: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.post(&format!("builds/{build_id}/finalize"), json!({}))
                .await?;
            Ok(())
        })
    }

    fn send_snapshot<'a>(
        &'a self,
        build_id: &'a str,
        payload: &'a SnapshotUpload,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let body = json!({
                "data": {
                    "type": "snapshots",
                    "attributes": {
                        "name": payload.name,
                        "url": payload.url,
                        "widths": payload.widths,
                        "meta": payload.meta,
                    },
                    "relationships": {
                        "resources": {
                            "data": payload.resources.iter().map(|r| json!({
                                "type": "resources",
                                "attributes": {
                                    "resource-url": r.url,
                                    "mimetype": r.mimetype,
                                    "content": r.content,
                                    "is-root": r.is_root,
                                }
                            })).collect::<Vec<_>>()
                        }
                    }
                }
            });
            self.post(&format!("builds/{build_id}/snapshots"), body)
                .await?;
            Ok(())
        })
    }

    fn add_client_info(&self, info: &str) {
        let mut list = self.client_info.lock().unwrap();
        if !info.is_empty() && !list.iter().any(|i| i == info) {
            list.push(info.to_string());
        }
    }

    fn add_environment_info(&self, info: &str) {
        let mut list = self.environment_info.lock().unwrap();
        if !info.is_empty() && !list.iter().any(|i| i == info) {
            list.push(info.to_string());
        }
    }
}
