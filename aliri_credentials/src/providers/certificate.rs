//! Client assertions signed locally with an RSA private key

use std::{fmt, sync::Arc, time::Duration};

use aliri::{
    error::{JwtSigningError, KeyRejected},
    jwa,
    jwk::KeyId,
    jwt::{self, Audience, AudienceRef},
    Jwk, Jwt,
};
use aliri_base64::{Base64, InvalidBase64Data};
use aliri_clock::UnixTime;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::unix_time;
use crate::{
    assertion::{AssertionProvider, ClientAssertion},
    clock::{Clock, System},
    error::SigningError,
    ClientId, ClientIdRef, SignedAssertion,
};

const ASSERTION_LIFETIME: Duration = Duration::from_secs(10 * 60);
const REPORTED_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// An error while preparing a certificate for signing
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The PEM document does not hold a usable RSA private key
    #[error("certificate does not contain a usable RSA private key")]
    InvalidKey(#[from] KeyRejected),
    /// The inline certificate is not valid base64
    #[error("certificate value is not valid base64")]
    InvalidBase64(#[from] InvalidBase64Data),
    /// The decoded certificate is not a PEM text document
    #[error("certificate value does not decode to a PEM document")]
    NotPem(#[from] std::string::FromUtf8Error),
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a AudienceRef,
    iss: &'a ClientIdRef,
    sub: &'a ClientIdRef,
    jti: String,
    nbf: UnixTime,
    iat: UnixTime,
    exp: UnixTime,
}

/// Signs RS256 client assertions for a confidential client
///
/// Each assertion is valid for ten minutes from the time it is signed and
/// carries a fresh `jti`. The expiry reported to callers is one minute ahead
/// of the `exp` claim, so a cached assertion is never presented right as the
/// authority stops accepting it.
pub struct CertificateAssertionProvider {
    key: Jwk,
    key_id: Option<KeyId>,
    client_id: ClientId,
    audience: Audience,
    clock: Arc<dyn Clock>,
}

impl CertificateAssertionProvider {
    /// Constructs a provider from a PEM-encoded RSA private key
    pub fn from_pem(
        pem: &str,
        client_id: ClientId,
        audience: Audience,
    ) -> Result<Self, CertificateError> {
        let key = jwa::Rsa::private_key_from_pem(pem)?;
        Ok(Self {
            key: Jwk::from(key),
            key_id: None,
            client_id,
            audience,
            clock: Arc::new(System),
        })
    }

    /// Constructs a provider from a base64-encoded PEM RSA private key
    pub fn from_base64_pem(
        value: &str,
        client_id: ClientId,
        audience: Audience,
    ) -> Result<Self, CertificateError> {
        let decoded = Base64::from_encoded(value.trim())?;
        let pem = String::from_utf8(decoded.into_inner())?;
        Self::from_pem(&pem, client_id, audience)
    }

    /// Advertises a key ID in the assertion header
    pub fn with_key_id(mut self, key_id: Option<KeyId>) -> Self {
        self.key_id = key_id;
        self
    }

    /// Sets a custom clock to be used
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn sign(&self) -> Result<ClientAssertion, JwtSigningError> {
        let now = self.clock.now();
        let expires = now + ASSERTION_LIFETIME;

        let headers = match &self.key_id {
            Some(kid) => jwt::BasicHeaders::with_key_id(jwa::Algorithm::RS256, kid.clone()),
            None => jwt::BasicHeaders::new(jwa::Algorithm::RS256),
        };

        let claims = AssertionClaims {
            aud: &self.audience,
            iss: &self.client_id,
            sub: &self.client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: unix_time(now),
            iat: unix_time(now),
            exp: unix_time(expires),
        };

        let token = Jwt::try_from_parts_with_signature(&headers, &claims, &self.key)?;

        tracing::debug!(
            client_id = %self.client_id,
            audience = %self.audience,
            exp = claims.exp.0,
            "signed client assertion with certificate"
        );

        Ok(ClientAssertion::new(
            SignedAssertion::new(token.as_str().to_owned()),
            expires - REPORTED_EXPIRY_MARGIN,
        ))
    }
}

impl fmt::Debug for CertificateAssertionProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertificateAssertionProvider")
            .field("key_id", &self.key_id)
            .field("client_id", &self.client_id)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AssertionProvider for CertificateAssertionProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        self.sign().map_err(SigningError::provider)
    }
}
