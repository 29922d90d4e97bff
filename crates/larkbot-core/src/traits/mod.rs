//! Collaborator contracts consumed by the scheduler core.
//!
//! The core never talks to a chat provider, a timer wheel or an HTTP stack
//! directly; it goes through these traits so every piece can be swapped for
//! a stub in tests.

pub mod ai;
pub mod http;
pub mod scheduler;
pub mod sender;
pub mod template;

pub use ai::AiActionRunner;
pub use http::HttpClient;
pub use scheduler::{JobFn, JobFuture, JobInfo, JobTrigger, Scheduler};
pub use sender::MessageSender;
pub use template::TemplateRenderer;
