//! reqwest-backed [`HttpClient`].

use async_trait::async_trait;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::HttpClient;
use larkbot_core::types::{HttpRequest, HttpResponse};
use reqwest::Method;

#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| LarkBotError::Config(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout)
            .query(&request.params);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        } else if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| LarkBotError::Http(format!("{} {} failed: {e}", request.method, request.url)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LarkBotError::Http(format!(
                "{} {} returned {status}: {body}",
                request.method, request.url
            )));
        }
        Ok(HttpResponse { status: status.as_u16(), body })
    }
}
