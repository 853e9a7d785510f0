use async_trait::async_trait;

use super::{ensure_kind, CredentialSourceLoader, LoaderParameters};
use crate::{
    description::{CredentialSource, LoadState, LoadedCredential},
    error::ConfigurationError,
    SourceKind,
};

/// Loads client secrets held directly in configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientSecretLoader;

#[async_trait]
impl CredentialSourceLoader for ClientSecretLoader {
    fn source_kind(&self) -> SourceKind {
        SourceKind::ClientSecret
    }

    async fn load_if_needed(
        &self,
        source: &CredentialSource,
        state: &mut LoadState,
        _params: &LoaderParameters,
    ) -> Result<(), ConfigurationError> {
        ensure_kind(SourceKind::ClientSecret, source)?;

        if state.cached_value().is_some() {
            return Ok(());
        }

        if let CredentialSource::ClientSecret { secret } = source {
            if secret.as_str().is_empty() {
                return Err(ConfigurationError::MissingField {
                    kind: SourceKind::ClientSecret,
                    field: "secret",
                });
            }

            state.set_cached_value(LoadedCredential::Secret(secret.clone()));
        }

        Ok(())
    }
}
