//! AI task contract. Agent internals live outside the scheduler core.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{AiTaskResult, Context};

#[async_trait]
pub trait AiActionRunner: Send + Sync {
    /// Run an `ai_chat` / `ai_query` action. A result with `success = false`
    /// is treated as an action failure by the caller.
    async fn execute_ai_task_action(
        &self,
        action_config: &Value,
        context: &Context,
    ) -> Result<AiTaskResult>;
}
