//! OAuth2 for the Gmail API: installed-app client secret, token cache,
//! refresh, and the one-time browser consent with a loopback redirect.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use url::Url;

pub const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Seconds before the recorded expiry at which a token is treated as expired.
const EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("client secret file {path} not found; download it from the Google Cloud console (OAuth client, type Desktop app)")]
    MissingClientSecret { path: PathBuf },

    #[error("invalid client secret file {path}: {reason}")]
    InvalidClientSecret { path: PathBuf, reason: String },

    #[error("failed to access token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authorization server returned {error}: {description}")]
    Server { error: String, description: String },

    #[error("no refresh token available; run `certgen auth` again")]
    NoRefreshToken,

    #[error("consent flow failed: {0}")]
    Consent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, OAuthError>;

// ============================================================================
// Client secret
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(OAuthError::MissingClientSecret {
                    path: path.to_path_buf(),
                })
            }
            Err(err) => {
                return Err(OAuthError::InvalidClientSecret {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        };
        Self::parse(&content).map_err(|reason| OAuthError::InvalidClientSecret {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let file: ClientSecretFile = serde_json::from_str(content).map_err(|e| e.to_string())?;
        file.installed
            .or(file.web)
            .ok_or_else(|| "expected an `installed` or `web` client".to_string())
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    pub fn from_response(response: TokenResponse) -> Self {
        let expires_at = response
            .expires_in
            .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs));
        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_at,
            refresh_token: response.refresh_token,
            scope: response.scope,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| {
            OffsetDateTime::now_utc() + Duration::seconds(EXPIRY_BUFFER_SECS) >= exp
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Token cache on disk.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unparsable cache is treated as no token.
    pub fn load(&self) -> Option<Token> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!("ignoring token cache {}: {err}", self.path.display());
                None
            }
        }
    }

    pub fn save(&self, token: &Token) -> Result<()> {
        let json = serde_json::to_string_pretty(token)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.file_error(source))?;
        }
        fs::write(&self.path, json).map_err(|source| self.file_error(source))
    }

    fn file_error(&self, source: io::Error) -> OAuthError {
        OAuthError::TokenFile {
            path: self.path.clone(),
            source,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Client secret, current token and where to persist refreshed tokens.
pub struct OAuthSession {
    secret: ClientSecret,
    token: Token,
    store: TokenStore,
}

impl OAuthSession {
    /// Use the cached token if there is one, otherwise run the consent flow.
    pub fn load_or_authorize(http: &Client, secret_path: &Path, store: TokenStore) -> Result<Self> {
        let secret = ClientSecret::load(secret_path)?;
        let token = match store.load() {
            Some(token) => token,
            None => {
                let token = authorize(http, &secret)?;
                store.save(&token)?;
                token
            }
        };
        Ok(Self {
            secret,
            token,
            store,
        })
    }

    pub fn new(secret: ClientSecret, token: Token, store: TokenStore) -> Self {
        Self {
            secret,
            token,
            store,
        }
    }

    /// A valid access token, refreshed and re-saved when expired.
    pub fn access_token(&mut self, http: &Client) -> Result<&str> {
        if self.token.is_expired() {
            debug!("access token expired, refreshing");
            let refreshed = refresh(http, &self.secret, &self.token)?;
            self.store.save(&refreshed)?;
            self.token = refreshed;
        }
        Ok(&self.token.access_token)
    }
}

fn refresh(http: &Client, secret: &ClientSecret, token: &Token) -> Result<Token> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or(OAuthError::NoRefreshToken)?;
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", secret.client_id.as_str()),
        ("client_secret", secret.client_secret.as_str()),
    ];
    let mut refreshed = token_request(http, &secret.token_uri, &params)?;
    // Google omits the refresh token on refresh responses.
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = token.refresh_token.clone();
    }
    Ok(refreshed)
}

fn token_request(http: &Client, token_uri: &str, params: &[(&str, &str)]) -> Result<Token> {
    let response = http.post(token_uri).form(params).send()?;
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => OAuthError::Server {
                error: err.error,
                description: err.error_description,
            },
            Err(_) => OAuthError::Server {
                error: status.to_string(),
                description: body,
            },
        });
    }
    let response: TokenResponse = serde_json::from_str(&body)?;
    Ok(Token::from_response(response))
}

// ============================================================================
// Consent flow
// ============================================================================

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub fn authorization_url(
    secret: &ClientSecret,
    redirect_uri: &str,
    pkce: &Pkce,
    state: &str,
) -> Result<Url> {
    let mut url = Url::parse(&secret.auth_uri).map_err(|err| OAuthError::InvalidClientSecret {
        path: PathBuf::from("auth_uri"),
        reason: err.to_string(),
    })?;
    url.query_pairs_mut()
        .append_pair("client_id", &secret.client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", GMAIL_SEND_SCOPE)
        .append_pair("state", state)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url)
}

/// Run the interactive consent flow and exchange the code for a token.
pub fn authorize(http: &Client, secret: &ClientSecret) -> Result<Token> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|err| OAuthError::Consent(format!("cannot listen for redirect: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| OAuthError::Consent(err.to_string()))?
        .port();
    let redirect_uri = format!("http://127.0.0.1:{port}");

    let pkce = Pkce::generate();
    let state = random_state();
    let url = authorization_url(secret, &redirect_uri, &pkce, &state)?;

    info!("opening browser for Gmail authorization");
    if let Err(err) = opener::open(url.as_str()) {
        warn!("could not open a browser: {err}");
        eprintln!("Open this URL to authorize certgen:\n\n  {url}\n");
    }

    let code = wait_for_code(&listener, &state)?;
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
        ("client_id", secret.client_id.as_str()),
        ("client_secret", secret.client_secret.as_str()),
        ("code_verifier", pkce.verifier.as_str()),
    ];
    token_request(http, &secret.token_uri, &params)
}

fn wait_for_code(listener: &TcpListener, expected_state: &str) -> Result<String> {
    let (mut stream, _) = listener
        .accept()
        .map_err(|err| OAuthError::Consent(err.to_string()))?;

    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .map_err(|err| OAuthError::Consent(err.to_string()))?;

    let result = parse_redirect(&request_line, expected_state);
    let page = match &result {
        Ok(_) => "Authorization complete. You can close this window.",
        Err(_) => "Authorization failed. Check the terminal for details.",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    if let Err(err) = stream.write_all(response.as_bytes()) {
        debug!("failed to answer redirect: {err}");
    }
    result
}

/// Extract the authorization code from a `GET /?code=...&state=... HTTP/1.1` line.
pub fn parse_redirect(request_line: &str, expected_state: &str) -> Result<String> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| OAuthError::Consent("malformed redirect request".to_string()))?;
    let url = Url::parse(&format!("http://127.0.0.1{target}"))
        .map_err(|err| OAuthError::Consent(err.to_string()))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => {
                return Err(OAuthError::Consent(format!("authorization denied: {value}")))
            }
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(OAuthError::Consent("state mismatch".to_string()));
    }
    code.ok_or_else(|| OAuthError::Consent("redirect carried no code".to_string()))
}
