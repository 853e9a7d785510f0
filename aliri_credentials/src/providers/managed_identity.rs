//! Signed assertions issued by a managed identity endpoint

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    assertion::{AssertionProvider, ClientAssertion},
    error::SigningError,
    SignedAssertion,
};

/// The instance metadata service token endpoint
pub const DEFAULT_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// The resource requested when exchanging a managed identity token for a client assertion
pub const DEFAULT_AUDIENCE: &str = "api://AzureADTokenExchange";

/// How long a token request may take before the endpoint is treated as unreachable
///
/// The instance metadata service answers within milliseconds when present.
/// Elsewhere its address is usually unroutable, and a connection attempt
/// would otherwise hang until the operating system gives up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const API_VERSION: &str = "2018-02-01";

/// An error while requesting a token from a managed identity endpoint
#[derive(Debug, Error)]
pub enum ManagedIdentityError {
    /// The endpoint returned an error status
    #[error("managed identity endpoint returned an error: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing managed identity token response")]
    TokenBodyError(#[from] serde_json::Error),
    /// The token response carries an unreadable `expires_on`
    #[error("managed identity token response has an invalid expires_on value: {0}")]
    InvalidExpiresOn(String),
    /// Unable to read the response
    #[error("error reading managed identity response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send the token request
    #[error("error sending request to managed identity endpoint")]
    RequestSend(#[source] reqwest::Error),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UnixSeconds {
    Number(u64),
    String(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: SignedAssertion,
    expires_on: UnixSeconds,
}

impl UnixSeconds {
    fn to_system_time(&self) -> Result<SystemTime, ManagedIdentityError> {
        let secs = match self {
            Self::Number(n) => *n,
            Self::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ManagedIdentityError::InvalidExpiresOn(s.clone()))?,
        };
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Requests signed assertions from a managed identity token endpoint
#[derive(Debug)]
pub struct ManagedIdentityAssertionProvider {
    client: reqwest::Client,
    endpoint: String,
    audience: String,
    client_id: Option<String>,
    timeout: Duration,
}

impl ManagedIdentityAssertionProvider {
    /// Constructs a provider for the system-assigned identity via the instance metadata service
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            audience: DEFAULT_AUDIENCE.to_owned(),
            client_id: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Uses a different token endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Requests the assertion for a different resource
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Selects a user-assigned identity by its client ID
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Limits how long a single token request may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[tracing::instrument(
        err,
        skip(self),
        fields(
            endpoint = %self.endpoint,
            audience = %self.audience,
            client_id = self.client_id.as_deref(),
        ),
    )]
    async fn request_assertion(&self) -> Result<ClientAssertion, ManagedIdentityError> {
        tracing::trace!("requesting assertion from managed identity endpoint");

        let mut req = self
            .client
            .get(&self.endpoint)
            .timeout(self.timeout)
            .header("Metadata", "true")
            .query(&[("api-version", API_VERSION), ("resource", self.audience.as_str())]);

        if let Some(client_id) = &self.client_id {
            req = req.query(&[("client_id", client_id)]);
        }

        let resp = req.send().await.map_err(ManagedIdentityError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from managed identity endpoint"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp
                .text()
                .await
                .map_err(ManagedIdentityError::BodyReadError)?;
            return Err(ManagedIdentityError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(ManagedIdentityError::BodyReadError)?;
        let resp: TokenResponse = serde_json::from_slice(&body)?;

        Ok(ClientAssertion::new(
            resp.access_token,
            resp.expires_on.to_system_time()?,
        ))
    }
}

#[async_trait]
impl AssertionProvider for ManagedIdentityAssertionProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        self.request_assertion()
            .await
            .map_err(SigningError::provider)
    }
}
