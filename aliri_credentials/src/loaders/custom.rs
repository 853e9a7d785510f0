use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use super::{
    cached_assertion, ensure_kind, probe_assertion, CacheSettings, CredentialSourceLoader,
    LoaderParameters,
};
use crate::{
    assertion::AssertionProvider,
    description::{CredentialSource, LoadState},
    error::ConfigurationError,
    SourceKind,
};

const KIND: SourceKind = SourceKind::CustomSignedAssertion;

/// Loads signed assertions from providers registered by the application
#[derive(Debug, Default)]
pub struct CustomAssertionLoader {
    providers: HashMap<String, Arc<dyn AssertionProvider>>,
    settings: CacheSettings,
}

impl CustomAssertionLoader {
    /// Constructs a loader with no registered providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under `name`
    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        provider: impl AssertionProvider + 'static,
    ) -> Self {
        self.providers.insert(name.into(), Arc::new(provider));
        self
    }

    /// Registers a shared provider under `name`
    pub fn with_shared_provider(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn AssertionProvider>,
    ) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Sets the settings used for the assertion caches this loader creates
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl CredentialSourceLoader for CustomAssertionLoader {
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
            (None, CredentialSource::CustomSignedAssertion { provider_name }) => {
                let provider = self
                    .providers
                    .get(provider_name)
                    .ok_or_else(|| ConfigurationError::UnknownCustomProvider(provider_name.clone()))?;
                self.settings.cache(Arc::clone(provider))
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
