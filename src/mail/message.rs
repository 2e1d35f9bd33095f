use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::render::certificate_path;
use crate::userlist::Recipient;

/// Appended to every HTML body.
const HTML_TRAILER: &str = "<br/><br/>";

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("invalid address `{address}`: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddressError,
    },

    /// The `To` address of this one message does not parse.
    #[error("invalid recipient `{address}`: {source}")]
    InvalidRecipient {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("attachment {path} could not be read: {source}")]
    MissingAttachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid content type `{0}`")]
    ContentType(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
}

/// Message parts shared by every email of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailTemplate {
    pub sender: String,
    pub subject: String,
    pub html_body: String,
    pub plain_body: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl EmailTemplate {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            html_body: html_body.into(),
            ..Self::default()
        }
    }
}

/// A message ready for the Gmail API: the RFC 5322 text, base64url encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub raw: String,
}

impl RawMessage {
    pub fn from_bytes(formatted: &[u8]) -> Self {
        Self {
            raw: URL_SAFE.encode(formatted),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE.decode(&self.raw)
    }
}

/// One recipient's message: who gets it and which certificate is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailJob {
    pub recipient: Recipient,
    pub attachment: PathBuf,
}

impl EmailJob {
    pub fn new(recipient: Recipient, certificates_dir: &Path) -> Self {
        let attachment = certificate_path(certificates_dir, &recipient.name);
        Self {
            recipient,
            attachment,
        }
    }

    pub fn compose(&self, template: &EmailTemplate) -> Result<RawMessage, ComposeError> {
        compose(
            template,
            &self.recipient.email,
            std::slice::from_ref(&self.attachment),
        )
    }
}

/// Build a MIME message.
///
/// With attachments the layout is `multipart/mixed` holding a
/// `multipart/alternative` body followed by the files; without attachments
/// it is the `multipart/alternative` body alone.
pub fn compose(
    template: &EmailTemplate,
    to: &str,
    attachments: &[PathBuf],
) -> Result<RawMessage, ComposeError> {
    let mut builder = Message::builder()
        .from(mailbox(&template.sender)?)
        .to(recipient_mailbox(to)?)
        .subject(template.subject.as_str());
    for cc in &template.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &template.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }
    if !template.bcc.is_empty() {
        builder = builder.keep_bcc();
    }

    let html = SinglePart::html(format!("{}{HTML_TRAILER}", template.html_body));
    let body = match template.plain_body.as_deref().filter(|plain| !plain.is_empty()) {
        Some(plain) => MultiPart::alternative()
            .singlepart(SinglePart::plain(plain.to_string()))
            .singlepart(html),
        None => MultiPart::alternative().singlepart(html),
    };

    let message = if attachments.is_empty() {
        builder.multipart(body)?
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for path in attachments {
            mixed = mixed.singlepart(attachment_part(path)?);
        }
        builder.multipart(mixed)?
    };

    Ok(RawMessage::from_bytes(&message.formatted()))
}

fn mailbox(address: &str) -> Result<Mailbox, ComposeError> {
    address
        .trim()
        .parse()
        .map_err(|source| ComposeError::InvalidAddress {
            address: address.to_string(),
            source,
        })
}

fn recipient_mailbox(address: &str) -> Result<Mailbox, ComposeError> {
    address
        .trim()
        .parse()
        .map_err(|source| ComposeError::InvalidRecipient {
            address: address.to_string(),
            source,
        })
}

fn attachment_part(path: &Path) -> Result<SinglePart, ComposeError> {
    let data = fs::read(path).map_err(|source| ComposeError::MissingAttachment {
        path: path.to_path_buf(),
        source,
    })?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let guessed = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = ContentType::parse(guessed.essence_str())
        .map_err(|_| ComposeError::ContentType(guessed.to_string()))?;
    Ok(Attachment::new(filename).body(data, content_type))
}

/// Loose sanity check for a configured sender address.
pub fn looks_like_address(address: &str) -> bool {
    let address = address.trim();
    !address.is_empty() && address.contains('@') && address.contains('.')
}
