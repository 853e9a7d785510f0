//! Loaders that materialize credential descriptions into usable credentials
//!
//! Each [`CredentialSourceLoader`] handles exactly one [`SourceKind`]. The
//! [`LoaderRegistry`] maps kinds to loaders for the resolution chain.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use aliri::jwt::{Audience, AudienceRef};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    assertion::{AssertionCache, AssertionProvider},
    clock::{Clock, System},
    description::{CredentialSource, LoadState, LoadedCredential},
    error::{source_unavailable, BoxError, ConfigurationError, SigningError},
    providers::VaultSecretReader,
    ClientId, ClientIdRef, SourceKind,
};

mod certificate;
mod client_secret;
mod custom;
mod file_path;
#[cfg(feature = "managed-identity")]
mod managed_identity;
mod vault;

pub use certificate::CertificateLoader;
pub use client_secret::ClientSecretLoader;
pub use custom::CustomAssertionLoader;
pub use file_path::{SignedAssertionFilePathLoader, FEDERATED_TOKEN_FILE_VAR};
#[cfg(feature = "managed-identity")]
pub use managed_identity::ManagedIdentityLoader;
pub use vault::VaultAssertionLoader;

/// Parameters shared by every loader during one resolution attempt
#[derive(Clone, Debug, Default)]
pub struct LoaderParameters {
    client_id: Option<ClientId>,
    audience: Option<Audience>,
    cancellation: CancellationToken,
}

impl LoaderParameters {
    /// Constructs empty loader parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the client ID that signed assertions are issued for
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Sets the audience of signed assertions, usually the authority's token endpoint
    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = Some(audience);
        self
    }

    /// Sets the token used to abandon the resolution attempt
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// The client ID, if one was provided
    pub fn client_id(&self) -> Option<&ClientIdRef> {
        self.client_id.as_deref()
    }

    /// The audience, if one was provided
    pub fn audience(&self) -> Option<&AudienceRef> {
        self.audience.as_deref()
    }

    /// The cancellation token for the resolution attempt
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Materializes credential descriptions of a single kind
#[async_trait]
pub trait CredentialSourceLoader: fmt::Debug + Send + Sync {
    /// The kind of credential source this loader handles
    fn source_kind(&self) -> SourceKind;

    /// Materializes `source` into `state`, unless it is already usable
    ///
    /// Failures of the underlying source are recorded by skipping `state`.
    /// They are never returned.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if `source` is of another kind or is
    /// missing data this loader requires.
    async fn load_if_needed(
        &self,
        source: &CredentialSource,
        state: &mut LoadState,
        params: &LoaderParameters,
    ) -> Result<(), ConfigurationError>;
}

/// Settings applied to the assertion caches created by loaders
#[derive(Clone, Debug)]
pub struct CacheSettings {
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            clock: Arc::new(System),
            expiry_margin: Duration::ZERO,
        }
    }
}

impl CacheSettings {
    /// Sets a custom clock to be used by caches and providers
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Treats assertions as expired `margin` before their reported expiry
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn cache(&self, provider: Arc<dyn AssertionProvider>) -> Arc<AssertionCache> {
        Arc::new(
            AssertionCache::from_arc(provider)
                .with_shared_clock(self.clock())
                .with_expiry_margin(self.expiry_margin),
        )
    }
}

pub(crate) fn ensure_kind(
    loader: SourceKind,
    source: &CredentialSource,
) -> Result<(), ConfigurationError> {
    let actual = source.kind();
    if actual == loader {
        Ok(())
    } else {
        Err(ConfigurationError::KindMismatch { loader, actual })
    }
}

pub(crate) fn cached_assertion(state: &LoadState) -> Option<Arc<AssertionCache>> {
    match state.cached_value() {
        Some(LoadedCredential::Assertion(cache)) => Some(Arc::clone(cache)),
        _ => None,
    }
}

/// Records a failure to materialize a source at all
pub(crate) fn mark_unavailable(kind: SourceKind, state: &mut LoadState, error: impl Into<BoxError>) {
    let reason = source_unavailable(kind, error);
    tracing::warn!(
        source_kind = %kind,
        error = (&reason as &dyn std::error::Error),
        "credential source unavailable"
    );
    state.skip(reason);
}

/// Caches `cache` on the description and exercises it once
///
/// Sources can be valid at configuration time but unavailable at run time,
/// so a newly materialized assertion source is only usable after it has
/// produced an assertion. On failure the cache stays on the description for
/// a later retry, and the description is skipped.
pub(crate) async fn probe_assertion(
    kind: SourceKind,
    state: &mut LoadState,
    params: &LoaderParameters,
    cache: Arc<AssertionCache>,
) {
    state.set_cached_value(LoadedCredential::Assertion(Arc::clone(&cache)));

    match cache.probe_availability(params.cancellation()).await {
        Ok(()) => {
            tracing::debug!(source_kind = %kind, "credential source is available");
        }
        Err(SigningError::Cancelled) => {
            tracing::debug!(source_kind = %kind, "probe of credential source cancelled");
        }
        Err(error) => mark_unavailable(kind, state, error),
    }
}

/// Maps credential source kinds to the loaders that handle them
#[derive(Debug, Default)]
pub struct LoaderRegistry {
    loaders: BTreeMap<SourceKind, Arc<dyn CredentialSourceLoader>>,
    vault_reader: Option<Arc<dyn VaultSecretReader>>,
    settings: CacheSettings,
}

impl LoaderRegistry {
    /// Constructs an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a registry with a loader for every built-in kind
    ///
    /// Vault-backed sources additionally require a vault reader, see
    /// [`with_vault_reader`][Self::with_vault_reader()]. Custom assertion
    /// providers are registered with a [`CustomAssertionLoader`].
    pub fn with_default_loaders() -> Self {
        Self::with_default_loaders_and_settings(CacheSettings::default())
    }

    /// Constructs a registry with a loader for every built-in kind, using custom cache settings
    pub fn with_default_loaders_and_settings(settings: CacheSettings) -> Self {
        let registry = Self {
            settings: settings.clone(),
            ..Self::default()
        }
        .with_loader(CertificateLoader::new().with_cache_settings(settings.clone()))
        .with_loader(ClientSecretLoader)
        .with_loader(SignedAssertionFilePathLoader::new().with_cache_settings(settings.clone()));

        #[cfg(feature = "managed-identity")]
        let registry = registry.with_loader(
            ManagedIdentityLoader::new(reqwest::Client::new()).with_cache_settings(settings),
        );

        registry
    }

    /// Registers a loader, replacing any loader already registered for its kind
    pub fn with_loader(mut self, loader: impl CredentialSourceLoader + 'static) -> Self {
        self.register(Arc::new(loader));
        self
    }

    /// Registers a shared loader, replacing any loader already registered for its kind
    pub fn register(&mut self, loader: Arc<dyn CredentialSourceLoader>) {
        let kind = loader.source_kind();
        if self.loaders.insert(kind, loader).is_some() {
            tracing::debug!(source_kind = %kind, "replaced credential source loader");
        }
    }

    /// Enables vault-backed sources, reading secrets through `reader`
    ///
    /// This registers a vault assertion loader and a certificate loader that
    /// can read certificates from the vault.
    pub fn with_vault_reader(mut self, reader: Arc<dyn VaultSecretReader>) -> Self {
        self.vault_reader = Some(Arc::clone(&reader));
        let settings = self.settings.clone();
        self.with_loader(
            CertificateLoader::new()
                .with_vault_reader(Arc::clone(&reader))
                .with_cache_settings(settings.clone()),
        )
        .with_loader(VaultAssertionLoader::new(reader).with_cache_settings(settings))
    }

    /// The vault reader, if one was registered
    pub fn vault_reader(&self) -> Option<&Arc<dyn VaultSecretReader>> {
        self.vault_reader.as_ref()
    }

    /// Finds the loader for a kind of credential source
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnregisteredKind`] if no loader handles `kind`.
    pub fn loader_for(
        &self,
        kind: SourceKind,
    ) -> Result<&Arc<dyn CredentialSourceLoader>, ConfigurationError> {
        self.loaders
            .get(&kind)
            .ok_or(ConfigurationError::UnregisteredKind(kind))
    }
}
