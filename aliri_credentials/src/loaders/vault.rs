use std::sync::Arc;

use async_trait::async_trait;

use super::{
    cached_assertion, ensure_kind, probe_assertion, CacheSettings, CredentialSourceLoader,
    LoaderParameters,
};
use crate::{
    description::{CredentialSource, LoadState},
    error::ConfigurationError,
    providers::{VaultAssertionProvider, VaultSecretReader},
    SourceKind,
};

const KIND: SourceKind = SourceKind::SignedAssertionFromVault;

/// Loads signed assertions stored as vault secrets
#[derive(Debug)]
pub struct VaultAssertionLoader {
    reader: Arc<dyn VaultSecretReader>,
    settings: CacheSettings,
}

impl VaultAssertionLoader {
    /// Constructs a loader that reads secrets with `reader`
    pub fn new(reader: Arc<dyn VaultSecretReader>) -> Self {
        Self {
            reader,
            settings: CacheSettings::default(),
        }
    }

    /// Sets the settings used for the assertion caches this loader creates
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl CredentialSourceLoader for VaultAssertionLoader {
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

        let cache = match (cached_assertion(state), source) {
            (Some(cache), _) => cache,
            (
                None,
                CredentialSource::SignedAssertionFromVault {
                    vault_url,
                    secret_name,
                },
            ) => {
                if vault_url.is_empty() {
                    return Err(ConfigurationError::MissingField {
                        kind: KIND,
                        field: "vault_url",
                    });
                }
                if secret_name.is_empty() {
                    return Err(ConfigurationError::MissingField {
                        kind: KIND,
                        field: "secret_name",
                    });
                }

                let provider = VaultAssertionProvider::new(
                    Arc::clone(&self.reader),
                    vault_url.as_str(),
                    secret_name.as_str(),
                )
                .with_clock(self.settings.clock());
                self.settings.cache(Arc::new(provider))
            }
            (None, other) => {
                return Err(ConfigurationError::KindMismatch {
                    loader: KIND,
                    actual: other.kind(),
                })
            }
        };

        probe_assertion(KIND, state, params, cache).await;
        Ok(())
    }
}
