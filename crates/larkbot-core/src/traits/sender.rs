//! Outbound message delivery (Feishu webhooks, OneBot groups, ...).

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver plain text to a named target.
    async fn send_text(&self, text: &str, target: &str) -> Result<()>;

    /// Whether `target` names a configured destination.
    fn has_target(&self, target: &str) -> bool;
}
