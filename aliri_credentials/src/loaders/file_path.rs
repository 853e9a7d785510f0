use std::{env, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use super::{
    cached_assertion, ensure_kind, mark_unavailable, probe_assertion, CacheSettings,
    CredentialSourceLoader, LoaderParameters,
};
use crate::{
    description::{CredentialSource, LoadState},
    error::ConfigurationError,
    providers::FileAssertionProvider,
    SourceKind,
};

/// Environment variable naming the projected workload identity token file
pub const FEDERATED_TOKEN_FILE_VAR: &str = "AZURE_FEDERATED_TOKEN_FILE";

const KIND: SourceKind = SourceKind::SignedAssertionFilePath;

/// Loads signed assertions from files, such as projected workload identity tokens
///
/// The file is read once while loading, since a token file can be present
/// in configuration but not yet mounted, or already rotated away. A file
/// that cannot be read skips the description.
#[derive(Debug, Default)]
pub struct SignedAssertionFilePathLoader {
    fallback_path: Option<PathBuf>,
    settings: CacheSettings,
}

impl SignedAssertionFilePathLoader {
    /// Constructs a loader that falls back to the `AZURE_FEDERATED_TOKEN_FILE` environment variable
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `path` for descriptions without one, instead of consulting the environment
    pub fn with_fallback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_path = Some(path.into());
        self
    }

    /// Sets the settings used for the assertion caches this loader creates
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    fn resolve_path(&self, configured: Option<&PathBuf>) -> Option<PathBuf> {
        configured
            .cloned()
            .or_else(|| self.fallback_path.clone())
            .or_else(|| env::var_os(FEDERATED_TOKEN_FILE_VAR).map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
    }
}

#[async_trait]
impl CredentialSourceLoader for SignedAssertionFilePathLoader {
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
            None => {
                let configured = match source {
                    CredentialSource::SignedAssertionFilePath { path } => path.as_ref(),
                    _ => None,
                };

                let Some(path) = self.resolve_path(configured) else {
                    mark_unavailable(
                        KIND,
                        state,
                        format!("no assertion file configured and {} is not set", FEDERATED_TOKEN_FILE_VAR),
                    );
                    return Ok(());
                };

                tracing::trace!(path = %path.display(), "using signed assertion file");
                let provider = FileAssertionProvider::new(path).with_clock(self.settings.clock());
                self.settings.cache(Arc::new(provider))
            }
        };

        probe_assertion(KIND, state, params, cache).await;
        Ok(())
    }
}
