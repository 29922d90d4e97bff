//! # LarkBot Core
//!
//! Shared foundation for the LarkBot automation stack: configuration,
//! the error type, plain data types and the collaborator traits that the
//! scheduler core talks to (message senders, job schedulers, HTTP clients,
//! template renderers, AI runners and plugins).

pub mod config;
pub mod error;
pub mod plugin;
pub mod traits;
pub mod types;

pub use error::{LarkBotError, Result};
pub use types::Context;
