//! Short-lived credential side channel.
//!
//! A connection attempt starts by asking a [`CredentialSource`] for a token.
//! The token is only ever sent in the `auth` handshake frame.

use std::fmt;

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned HTTP {0}")]
    Status(u16),

    #[error("token endpoint returned an empty token")]
    Empty,
}

/// Something that can mint a credential for one connection attempt.
pub trait CredentialSource: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'static, Result<Credential, CredentialError>>;
}

/// Fetches a token with an HTTP POST to a token endpoint.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

impl CredentialSource for HttpCredentialSource {
    fn fetch(&self) -> BoxFuture<'static, Result<Credential, CredentialError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let api_key = self.api_key.clone();

        Box::pin(async move {
            let mut request = client.post(&url);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(CredentialError::Status(status.as_u16()));
            }

            let body = response.text().await?;
            debug!(
                component = "credentials",
                event = "credentials.fetched",
                url = %url,
                body_bytes = body.len(),
                "Token endpoint responded"
            );
            parse_token_body(&body)
        })
    }
}

/// A fixed token, for servers that accept a long-lived key.
pub struct StaticCredentialSource(Credential);

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Credential::new(token))
    }
}

impl CredentialSource for StaticCredentialSource {
    fn fetch(&self) -> BoxFuture<'static, Result<Credential, CredentialError>> {
        let credential = self.0.clone();
        Box::pin(async move {
            if credential.expose().is_empty() {
                return Err(CredentialError::Empty);
            }
            Ok(credential)
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
}

/// Accepts `{"token": "..."}` or a bare token body.
fn parse_token_body(body: &str) -> Result<Credential, CredentialError> {
    let token = match serde_json::from_str::<TokenResponse>(body) {
        Ok(parsed) => parsed.token,
        Err(_) => body.trim().trim_matches('"').to_string(),
    };
    if token.trim().is_empty() {
        return Err(CredentialError::Empty);
    }
    Ok(Credential::new(token))
}
