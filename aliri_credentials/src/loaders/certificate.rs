use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;

use super::{
    cached_assertion, ensure_kind, mark_unavailable, probe_assertion, CacheSettings,
    CredentialSourceLoader, LoaderParameters,
};
use crate::{
    description::{CredentialSource, LoadState},
    error::{BoxError, ConfigurationError},
    providers::{CertificateAssertionProvider, VaultSecretReader},
    SourceKind,
};

const KIND: SourceKind = SourceKind::Certificate;

/// Loads RSA private keys and signs client assertions with them
///
/// Keys may be read from a file, decoded from an inline base64 value, or,
/// when a vault reader is configured, read from a vault.
#[derive(Debug, Default)]
pub struct CertificateLoader {
    vault_reader: Option<Arc<dyn VaultSecretReader>>,
    settings: CacheSettings,
}

impl CertificateLoader {
    /// Constructs a certificate loader without vault access
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows certificates to be read from a vault
    pub fn with_vault_reader(mut self, reader: Arc<dyn VaultSecretReader>) -> Self {
        self.vault_reader = Some(reader);
        self
    }

    /// Sets the settings used for the assertion caches this loader creates
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    async fn read_provider(
        &self,
        source: &CredentialSource,
        params: &LoaderParameters,
    ) -> Result<Result<CertificateAssertionProvider, BoxError>, ConfigurationError> {
        let client_id = params
            .client_id()
            .ok_or(ConfigurationError::MissingField {
                kind: KIND,
                field: "client_id",
            })?
            .to_owned();
        let audience = params
            .audience()
            .ok_or(ConfigurationError::MissingField {
                kind: KIND,
                field: "audience",
            })?
            .to_owned();

        let (provider, key_id) = match source {
            CredentialSource::CertificateFromPath { path, key_id } => {
                let provider = read_pem(path).await.and_then(|pem| {
                    CertificateAssertionProvider::from_pem(&pem, client_id, audience)
                        .map_err(BoxError::from)
                });
                (provider, key_id)
            }
            CredentialSource::CertificateFromBase64 { value, key_id } => {
                if value.trim().is_empty() {
                    return Err(ConfigurationError::MissingField {
                        kind: KIND,
                        field: "value",
                    });
                }
                let provider =
                    CertificateAssertionProvider::from_base64_pem(value, client_id, audience)
                        .map_err(BoxError::from);
                (provider, key_id)
            }
            CredentialSource::CertificateFromVault {
                vault_url,
                secret_name,
                key_id,
            } => {
                let reader = self
                    .vault_reader
                    .as_ref()
                    .ok_or(ConfigurationError::NoVaultReader(KIND))?;
                let provider = reader
                    .read_secret(vault_url, secret_name)
                    .await
                    .and_then(|pem| {
                        CertificateAssertionProvider::from_pem(&pem, client_id, audience)
                            .map_err(BoxError::from)
                    });
                (provider, key_id)
            }
            other => {
                return Err(ConfigurationError::KindMismatch {
                    loader: KIND,
                    actual: other.kind(),
                })
            }
        };

        Ok(provider.map(|p| {
            p.with_key_id(key_id.clone())
                .with_clock(self.settings.clock())
        }))
    }
}

async fn read_pem(path: &Path) -> Result<String, BoxError> {
    tokio::fs::read_to_string(path).await.map_err(|err| {
        BoxError::from(io::Error::new(
            err.kind(),
            format!("unable to read certificate {}: {}", path.display(), err),
        ))
    })
}

#[async_trait]
impl CredentialSourceLoader for CertificateLoader {
    fn source_kind(&self) -> SourceKind {
        KIND
    }

    async fn load_if_needed(
        &self,
        source: &CredentialSource,
        state: &mut LoadState,
        params: &LoaderParameters,
    ) -> Result<(), ConfigurationError> {
        ensure_kind(KIND, source)?;

        let cache = match cached_assertion(state) {
            Some(cache) => cache,
            None => match self.read_provider(source, params).await? {
                Ok(provider) => self.settings.cache(Arc::new(provider)),
                Err(error) => {
                    mark_unavailable(KIND, state, error);
                    return Ok(());
                }
            },
        };

        probe_assertion(KIND, state, params, cache).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aliri::{jwa, jwk::KeyId, jwt::Audience};
    use aliri_base64::Base64;
    use color_eyre::Result;

    use super::*;
    use crate::{description::LoadedCredential, providers::vault::tests::InMemoryVault, ClientId};

    fn params() -> LoaderParameters {
        LoaderParameters::new()
            .with_client_id(ClientId::from_static("my-client"))
            .with_audience(Audience::from_static("https://login.example.com/token"))
    }

    fn test_key_pem() -> Result<String> {
        Ok(jwa::rsa::PrivateKey::generate()?.to_pem())
    }

    #[tokio::test]
    async fn loads_certificate_from_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key.pem");
        tokio::fs::write(&path, test_key_pem()?).await?;

        let source = CredentialSource::CertificateFromPath { path, key_id: None };
        let mut state = LoadState::default();

        CertificateLoader::new()
            .load_if_needed(&source, &mut state, &params())
            .await?;

        assert!(!state.is_skipped());
        assert!(matches!(
            state.cached_value(),
            Some(LoadedCredential::Assertion(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn loads_inline_certificate() -> Result<()> {
        let source = CredentialSource::CertificateFromBase64 {
            value: Base64::from_raw(test_key_pem()?.into_bytes()).to_string(),
            key_id: Some(KeyId::from_static("kid")),
        };
        let mut state = LoadState::default();

        CertificateLoader::new()
            .load_if_needed(&source, &mut state, &params())
            .await?;

        assert!(!state.is_skipped());

        Ok(())
    }

    #[tokio::test]
    async fn missing_file_skips_without_caching() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = CredentialSource::CertificateFromPath {
            path: dir.path().join("missing.pem"),
            key_id: None,
        };
        let mut state = LoadState::default();

        CertificateLoader::new()
            .load_if_needed(&source, &mut state, &params())
            .await?;

        assert!(state.is_skipped());
        assert!(state.cached_value().is_none());
        assert_eq!(
            state.last_error().map(|e| e.kind()),
            Some(SourceKind::Certificate)
        );

        Ok(())
    }

    #[tokio::test]
    async fn requires_client_id_and_audience() {
        let source = CredentialSource::CertificateFromBase64 {
            value: "AAAA".into(),
            key_id: None,
        };
        let mut state = LoadState::default();

        let result = CertificateLoader::new()
            .load_if_needed(&source, &mut state, &LoaderParameters::new())
            .await;

        assert_eq!(
            result,
            Err(ConfigurationError::MissingField {
                kind: SourceKind::Certificate,
                field: "client_id",
            })
        );
    }

    #[tokio::test]
    async fn vault_certificates_need_a_reader() -> Result<()> {
        let source = CredentialSource::CertificateFromVault {
            vault_url: "https://vault".into(),
            secret_name: "cert".into(),
            key_id: None,
        };
        let mut state = LoadState::default();

        let result = CertificateLoader::new()
            .load_if_needed(&source, &mut state, &params())
            .await;
        assert_eq!(
            result,
            Err(ConfigurationError::NoVaultReader(SourceKind::Certificate))
        );

        let vault = InMemoryVault::default().with_secret("https://vault", "cert", &test_key_pem()?);
        CertificateLoader::new()
            .with_vault_reader(Arc::new(vault))
            .load_if_needed(&source, &mut state, &params())
            .await?;

        assert!(!state.is_skipped());
        assert!(state.cached_value().is_some());

        Ok(())
    }
}
