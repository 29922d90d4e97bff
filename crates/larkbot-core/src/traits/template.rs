use crate::error::Result;
use crate::types::{Context, RenderedTemplate};

/// Named message templates (`daily_report`, `alert_card`, ...).
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, context: &Context) -> Result<RenderedTemplate>;
}
