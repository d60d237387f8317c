use crate::settings::SettingsStore;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} rejected the request with status {status}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub body: Value,
    pub file_name: String,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct Upstream {
    client: Client,
    settings: SettingsStore,
    health_timeout: Duration,
    proxy_timeout: Duration,
}

impl Upstream {
    pub fn new(
        client: Client,
        settings: SettingsStore,
        health_timeout: Duration,
        proxy_timeout: Duration,
    ) -> Self {
        Self {
            client,
            settings,
            health_timeout,
            proxy_timeout,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub async fn fetch_node_metrics(&self) -> Result<TextResponse, UpstreamError> {
        let base = self.settings.current().await.node_exporter_url;
        let url = join(&base, "metrics");
        let resp = self
            .client
            .get(&url)
            .timeout(self.proxy_timeout)
            .send()
            .await
            .map_err(|source| request_error(&url, source))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|source| request_error(&url, source))?;
        Ok(TextResponse { status, body })
    }

    pub async fn check_model_health(&self) -> Result<u16, UpstreamError> {
        let base = self.settings.current().await.model_service_url;
        let url = join(&base, "health");
        let resp = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|source| request_error(&url, source))?;
        Ok(resp.status().as_u16())
    }

    pub async fn predict(
        &self,
        image_url: &str,
        image_id: Option<&str>,
    ) -> Result<Prediction, UpstreamError> {
        info!(
            image_url,
            image_id = image_id.unwrap_or("-"),
            "downloading image for prediction"
        );
        let image = self
            .client
            .get(image_url)
            .timeout(self.proxy_timeout)
            .send()
            .await
            .map_err(|source| request_error(image_url, source))?;
        if !image.status().is_success() {
            return Err(UpstreamError::Status {
                url: image_url.to_string(),
                status: image.status().as_u16(),
            });
        }
        let mime = image
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = image
            .bytes()
            .await
            .map_err(|source| request_error(image_url, source))?;

        let file_name = image_file_name(image_url, image_id);
        let part = Part::bytes(bytes.to_vec())
            .file_name(file_name.clone())
            .mime_str(&mime)
            .map_err(|source| request_error(image_url, source))?;
        let form = Form::new().part("file", part);

        let base = self.settings.current().await.model_service_url;
        let url = join(&base, "predict");
        let start = Instant::now();
        let resp = self
            .client
            .post(&url)
            .timeout(self.proxy_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|source| request_error(&url, source))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), body = %body, "prediction rejected");
            return Err(UpstreamError::Rejected {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let body = json_body(&url, resp).await?;
        Ok(Prediction {
            body,
            file_name,
            elapsed_ms,
        })
    }

    pub async fn oapis_get(
        &self,
        path: &str,
        query: Option<&str>,
    ) -> Result<JsonResponse, UpstreamError> {
        let mut url = self.oapis_url(path).await;
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        let resp = self
            .client
            .get(&url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.proxy_timeout)
            .send()
            .await
            .map_err(|source| request_error(&url, source))?;
        let status = resp.status().as_u16();
        let body = json_body(&url, resp).await?;
        Ok(JsonResponse { status, body })
    }

    pub async fn oapis_post(&self, path: &str, payload: &Value) -> Result<JsonResponse, UpstreamError> {
        let url = self.oapis_url(path).await;
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .timeout(self.proxy_timeout)
            .send()
            .await
            .map_err(|source| request_error(&url, source))?;
        let status = resp.status().as_u16();
        let body = json_body(&url, resp).await?;
        Ok(JsonResponse { status, body })
    }

    async fn oapis_url(&self, path: &str) -> String {
        let base = self.settings.current().await.api_base_url;
        join(&base, &format!("oapis/{}", path.trim_start_matches('/')))
    }
}

async fn json_body(url: &str, resp: Response) -> Result<Value, UpstreamError> {
    resp.json::<Value>()
        .await
        .map_err(|source| request_error(url, source))
}

fn request_error(url: &str, source: reqwest::Error) -> UpstreamError {
    warn!(url, error = %source, "upstream request failed");
    UpstreamError::Request {
        url: url.to_string(),
        source,
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

pub fn image_file_name(image_url: &str, image_id: Option<&str>) -> String {
    let path = image_url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ => format!("image_{}.png", image_id.unwrap_or("unknown")),
    }
}
