//! Credentials stored in a secret vault

use std::{error, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::expiry_from_jwt;
use crate::{
    assertion::{AssertionProvider, ClientAssertion},
    clock::{Clock, System},
    error::SigningError,
    SignedAssertion,
};

const FALLBACK_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Read access to secrets held in a vault
///
/// Only the read contract is defined here. Applications supply an
/// implementation backed by their vault client of choice.
#[async_trait]
pub trait VaultSecretReader: fmt::Debug + Send + Sync {
    /// Reads the current value of the named secret
    async fn read_secret(
        &self,
        vault_url: &str,
        name: &str,
    ) -> Result<String, Box<dyn error::Error + Send + Sync + 'static>>;
}

#[async_trait]
impl<R: VaultSecretReader + ?Sized> VaultSecretReader for Arc<R> {
    async fn read_secret(
        &self,
        vault_url: &str,
        name: &str,
    ) -> Result<String, Box<dyn error::Error + Send + Sync + 'static>> {
        (**self).read_secret(vault_url, name).await
    }
}

/// An assertion provider that reads a signed assertion stored as a vault secret
///
/// The secret is read again on every computation. Expiry follows the same
/// rules as for assertion files.
#[derive(Debug)]
pub struct VaultAssertionProvider {
    reader: Arc<dyn VaultSecretReader>,
    vault_url: String,
    secret_name: String,
    clock: Arc<dyn Clock>,
}

impl VaultAssertionProvider {
    /// Constructs a new vault assertion provider
    pub fn new(
        reader: Arc<dyn VaultSecretReader>,
        vault_url: impl Into<String>,
        secret_name: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            vault_url: vault_url.into(),
            secret_name: secret_name.into(),
            clock: Arc::new(System),
        }
    }

    /// Sets a custom clock to be used
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl AssertionProvider for VaultAssertionProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        tracing::trace!(
            vault_url = %self.vault_url,
            secret_name = %self.secret_name,
            "reading signed assertion from vault"
        );

        let value = self
            .reader
            .read_secret(&self.vault_url, &self.secret_name)
            .await
            .map_err(SigningError::provider)?;

        let token = value.trim();
        if token.is_empty() {
            return Err(SigningError::provider(format!(
                "vault secret '{}' is empty",
                self.secret_name
            )));
        }

        let expiry = expiry_from_jwt(token).unwrap_or_else(|| self.clock.now() + FALLBACK_LIFETIME);

        Ok(ClientAssertion::new(
            SignedAssertion::new(token.to_owned()),
            expiry,
        ))
    }
}
