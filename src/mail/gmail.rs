use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use super::oauth::{OAuthError, OAuthSession, TokenStore};
use super::{MailTransport, RawMessage, SendError};

pub const SEND_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends messages through the Gmail REST API as the authorized user.
pub struct GmailClient {
    http: Client,
    session: OAuthSession,
    endpoint: String,
}

impl GmailClient {
    /// Authorize (from the token cache, or interactively) and build a client.
    pub fn connect(client_secret: &Path, token_file: &Path) -> Result<Self, OAuthError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let session = OAuthSession::load_or_authorize(&http, client_secret, TokenStore::new(token_file))?;
        Ok(Self::with_session(http, session))
    }

    pub fn with_session(http: Client, session: OAuthSession) -> Self {
        Self {
            http,
            session,
            endpoint: SEND_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl MailTransport for GmailClient {
    fn send(&mut self, message: &RawMessage) -> Result<(), SendError> {
        let token = self.session.access_token(&self.http)?.to_string();
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(message)
            .send()
            .map_err(|err| SendError::Transport {
                status: None,
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SendError::Transport {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        debug!("gmail accepted message ({status})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::oauth::{ClientSecret, Token};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use tempfile::TempDir;

    /// Answer one request with `status` and hand back what was received.
    fn serve_once(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/send", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope"
            )
            .unwrap();
            head + &String::from_utf8(body).unwrap()
        });
        (url, handle)
    }

    fn client(dir: &TempDir, endpoint: &str) -> GmailClient {
        let secret = ClientSecret {
            client_id: "id".into(),
            client_secret: "secret".into(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".into(),
            token_uri: "https://oauth2.googleapis.com/token".into(),
        };
        let token = Token {
            access_token: "live-token".into(),
            token_type: "Bearer".into(),
            expires_at: None,
            refresh_token: None,
            scope: None,
        };
        let store = TokenStore::new(dir.path().join("gmail_token.json"));
        GmailClient::with_session(Client::new(), OAuthSession::new(secret, token, store))
            .with_endpoint(endpoint)
    }

    #[test]
    fn posts_raw_message_with_bearer_token() {
        let dir = TempDir::new().unwrap();
        let (url, server) = serve_once("200 OK");
        let mut gmail = client(&dir, &url);

        gmail
            .send(&RawMessage {
                raw: "aGVsbG8=".into(),
            })
            .unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /send"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer live-token"));
        assert!(request.ends_with(r#"{"raw":"aGVsbG8="}"#));
    }

    #[test]
    fn http_error_status_is_a_transport_error() {
        let dir = TempDir::new().unwrap();
        let (url, server) = serve_once("500 Internal Server Error");
        let mut gmail = client(&dir, &url);

        let err = gmail.send(&RawMessage { raw: "x".into() }).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, SendError::Transport { status: Some(500), .. }));
    }
}
