use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    cached_assertion, ensure_kind, probe_assertion, CacheSettings, CredentialSourceLoader,
    LoaderParameters,
};
use crate::{
    description::{CredentialSource, LoadState},
    error::ConfigurationError,
    providers::{managed_identity::DEFAULT_TIMEOUT, ManagedIdentityAssertionProvider},
    SourceKind,
};

const KIND: SourceKind = SourceKind::SignedAssertionFromManagedIdentity;

/// Loads signed assertions issued by a managed identity endpoint
///
/// Managed identities are usually only reachable when running in the cloud,
/// so the endpoint is probed while loading and skipped if it does not answer
/// within the request timeout.
#[derive(Debug)]
pub struct ManagedIdentityLoader {
    client: reqwest::Client,
    timeout: Duration,
    settings: CacheSettings,
}

impl ManagedIdentityLoader {
    /// Constructs a loader that makes requests with `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            settings: CacheSettings::default(),
        }
    }

    /// Limits how long each token request may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the settings used for the assertion caches this loader creates
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl CredentialSourceLoader for ManagedIdentityLoader {
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
                let mut provider = ManagedIdentityAssertionProvider::new(self.client.clone())
                    .with_timeout(self.timeout);

                if let CredentialSource::SignedAssertionFromManagedIdentity {
                    client_id,
                    endpoint,
                    audience,
                } = source
                {
                    if let Some(endpoint) = endpoint {
                        provider = provider.with_endpoint(endpoint.as_str());
                    }
                    if let Some(audience) = audience {
                        provider = provider.with_audience(audience.as_str());
                    }
                    provider = provider.with_client_id(client_id.clone());
                }

                self.settings.cache(Arc::new(provider))
            }
        };

        probe_assertion(KIND, state, params, cache).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use httptest::{
        matchers::request,
        responders::{delay_and_then, json_encoded, status_code},
        Expectation, Server,
    };
    use serde_json::json;

    use super::*;

    const PATH: &str = "/metadata/identity/oauth2/token";

    fn source(server: &Server) -> CredentialSource {
        CredentialSource::SignedAssertionFromManagedIdentity {
            client_id: None,
            endpoint: Some(server.url_str(PATH)),
            audience: None,
        }
    }

    #[tokio::test]
    async fn reachable_endpoint_is_usable() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", PATH))
                .times(1)
                .respond_with(json_encoded(json!({
                    "access_token": "mi-assertion",
                    "expires_on": "4102444800",
                }))),
        );

        let loader = ManagedIdentityLoader::new(reqwest::Client::new());
        let mut state = LoadState::default();

        loader
            .load_if_needed(&source(&server), &mut state, &LoaderParameters::new())
            .await?;
        loader
            .load_if_needed(&source(&server), &mut state, &LoaderParameters::new())
            .await?;

        assert!(!state.is_skipped());

        Ok(())
    }

    #[tokio::test]
    async fn failing_endpoint_is_skipped() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", PATH))
                .respond_with(status_code(500)),
        );

        let mut state = LoadState::default();

        ManagedIdentityLoader::new(reqwest::Client::new())
            .load_if_needed(&source(&server), &mut state, &LoaderParameters::new())
            .await?;

        assert!(state.is_skipped());
        assert!(state.cached_value().is_some());
        assert_eq!(
            state.last_error().map(|e| e.kind()),
            Some(SourceKind::SignedAssertionFromManagedIdentity)
        );

        Ok(())
    }

    #[tokio::test]
    async fn unresponsive_endpoint_is_skipped_after_timeout() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", PATH)).respond_with(
                delay_and_then(Duration::from_secs(2), status_code(200)),
            ),
        );

        let mut state = LoadState::default();
        let started = std::time::Instant::now();

        ManagedIdentityLoader::new(reqwest::Client::new())
            .with_timeout(Duration::from_millis(100))
            .load_if_needed(&source(&server), &mut state, &LoaderParameters::new())
            .await?;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(state.is_skipped());

        Ok(())
    }
}
