//! Certificate emailing: MIME composition, the Gmail transport and the
//! batch dispatcher that ties them to a recipient list.

pub mod dispatch;
pub mod gmail;
pub mod message;
pub mod oauth;

use thiserror::Error;

pub use dispatch::{send_certificates, send_single, spawn_dispatch, DispatchReport};
pub use gmail::GmailClient;
pub use message::{compose, looks_like_address, ComposeError, EmailJob, EmailTemplate, RawMessage};
pub use oauth::OAuthError;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum SendError {
    /// The request failed on the wire or the API answered with an error
    /// status. Only the current message is affected.
    #[error("transport error ({}): {message}", .status.map_or_else(|| "no response".to_string(), |s| format!("HTTP {s}")))]
    Transport { status: Option<u16>, message: String },

    #[error("authorization failed: {0}")]
    Auth(#[from] OAuthError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Delivers one composed message.
pub trait MailTransport {
    fn send(&mut self, message: &RawMessage) -> Result<(), SendError>;
}
