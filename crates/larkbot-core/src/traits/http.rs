//! Blocking-style HTTP contract (one awaited call per request).

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{HttpRequest, HttpResponse};

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform the request. Non-2xx responses are returned as
    /// [`crate::LarkBotError::Http`].
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse>;
}
