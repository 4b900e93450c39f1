//! Email transport for cake.
//!
//! The scheduler only needs a yes/no answer from a send: [`EmailTransport`]
//! swallows every failure into `false` after logging it. [`HttpMailer`] posts
//! birthday greetings to an email provider's HTTP API.

mod client;
mod error;

use async_trait::async_trait;

pub use client::HttpMailer;
pub use error::MailerError;

/// An opaque email send operation.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send the birthday greeting. Returns true only when the provider
    /// acknowledged the message.
    async fn send(&self, display_name: &str, email: &str) -> bool;
}
