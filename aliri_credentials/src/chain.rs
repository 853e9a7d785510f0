//! Resolution of the first viable credential from an ordered list of candidates

use tokio_util::sync::CancellationToken;

use crate::{
    description::{CredentialDescription, LoadedCredential},
    error::{exhausted, source_unavailable, AttemptedSource, ResolveError, SigningError},
    loaders::{LoaderParameters, LoaderRegistry},
    ClientSecret, SignedAssertion, SourceKind,
};

/// Whether skipped descriptions are reconsidered by later resolution attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SkipPolicy {
    /// Every resolution attempt starts by making all descriptions eligible again
    ///
    /// Materialized credentials are kept, so a source that was unavailable
    /// only needs to pass its availability probe to be used.
    #[default]
    ResetEachAttempt,
    /// A skipped description stays skipped until it is explicitly
    /// [reset][CredentialDescription::reset()]
    Persist,
}

/// Tries credential descriptions in order and returns the first usable one
#[derive(Debug, Default)]
pub struct CredentialResolutionChain {
    registry: LoaderRegistry,
    skip_policy: SkipPolicy,
}

impl CredentialResolutionChain {
    /// Constructs a chain that dispatches to the loaders in `registry`
    pub fn new(registry: LoaderRegistry) -> Self {
        Self {
            registry,
            skip_policy: SkipPolicy::default(),
        }
    }

    /// Sets whether skipped descriptions are reconsidered by later attempts
    pub fn with_skip_policy(mut self, skip_policy: SkipPolicy) -> Self {
        self.skip_policy = skip_policy;
        self
    }

    /// The loaders this chain dispatches to
    pub fn registry(&self) -> &LoaderRegistry {
        &self.registry
    }

    /// The skip policy of this chain
    pub fn skip_policy(&self) -> SkipPolicy {
        self.skip_policy
    }

    /// Resolves the first description whose source is usable
    ///
    /// Descriptions are tried strictly in order, and no loader runs after
    /// the first success. Each description is locked while its loader runs,
    /// so concurrent attempts over the same list never probe one source
    /// twice at the same time.
    ///
    /// # Errors
    ///
    /// * [`ResolveError::Configuration`] if any description has no registered
    ///   loader or is misconfigured. Kinds are checked before any loader runs.
    /// * [`ResolveError::Exhausted`] if every description was skipped.
    /// * [`ResolveError::Cancelled`] if the cancellation token in `params`
    ///   fired. The description being loaded at that moment is not skipped.
    pub async fn resolve_first_viable(
        &self,
        descriptions: &[CredentialDescription],
        params: &LoaderParameters,
    ) -> Result<ResolvedCredential, ResolveError> {
        for description in descriptions {
            self.registry.loader_for(description.kind())?;
        }

        tokio::select! {
            biased;
            _ = params.cancellation().cancelled() => {
                tracing::debug!("credential resolution cancelled");
                Err(ResolveError::Cancelled)
            }
            result = self.resolve(descriptions, params) => result,
        }
    }

    async fn resolve(
        &self,
        descriptions: &[CredentialDescription],
        params: &LoaderParameters,
    ) -> Result<ResolvedCredential, ResolveError> {
        if self.skip_policy == SkipPolicy::ResetEachAttempt {
            for description in descriptions {
                description.reset().await;
            }
        }

        let mut attempted = Vec::with_capacity(descriptions.len());

        for (index, description) in descriptions.iter().enumerate() {
            let kind = description.kind();
            let loader = self.registry.loader_for(kind)?;
            let mut state = description.lock_state().await;

            if !state.is_skipped() {
                tracing::trace!(credential = %description, index, "loading credential source");
                loader
                    .load_if_needed(description.source(), &mut state, params)
                    .await?;

                if params.cancellation().is_cancelled() {
                    return Err(ResolveError::Cancelled);
                }

                if !state.is_skipped() {
                    if let Some(credential) = state.cached_value().cloned() {
                        tracing::debug!(credential = %description, index, "resolved credential");
                        return Ok(ResolvedCredential {
                            index,
                            name: description.name().map(ToOwned::to_owned),
                            kind,
                            credential,
                        });
                    }

                    state.skip(source_unavailable(
                        kind,
                        "loader did not produce a credential",
                    ));
                }

                tracing::debug!(credential = %description, index, "credential source unavailable, trying next source");
            } else {
                tracing::trace!(credential = %description, index, "credential source previously skipped, trying next source");
            }

            attempted.push(AttemptedSource {
                index,
                name: description.name().map(ToOwned::to_owned),
                kind,
                error: state.last_error().cloned(),
            });
        }

        let err = exhausted(attempted);
        tracing::warn!(
            attempted = err.attempted().len(),
            error = (&err as &dyn std::error::Error),
            "no usable credential source"
        );
        Err(err.into())
    }
}

/// A credential usable for client authentication
#[derive(Debug)]
pub enum ClientCredential {
    /// A client secret
    Secret(ClientSecret),
    /// A signed client assertion
    Assertion(SignedAssertion),
}

/// The description chosen by a resolution attempt and its credential
#[derive(Clone, Debug)]
pub struct ResolvedCredential {
    index: usize,
    name: Option<String>,
    kind: SourceKind,
    credential: LoadedCredential,
}

impl ResolvedCredential {
    /// The position of the chosen description in the list
    pub fn index(&self) -> usize {
        self.index
    }

    /// The name of the chosen description, if it has one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The kind of the chosen credential source
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// The materialized credential
    pub fn credential(&self) -> &LoadedCredential {
        &self.credential
    }

    /// Gets a credential for one token request
    ///
    /// Secrets are returned as-is. Signed assertions come from the cache of
    /// the resolved source and are only recomputed once they expire.
    ///
    /// # Errors
    ///
    /// Returns a [`SigningError`] if a fresh assertion was needed and could not
    /// be produced, or if `cancellation` fired while waiting for one.
    pub async fn client_credential(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<ClientCredential, SigningError> {
        match &self.credential {
            LoadedCredential::Secret(secret) => Ok(ClientCredential::Secret(secret.clone())),
            LoadedCredential::Assertion(cache) => cache
                .signed_assertion(cancellation)
                .await
                .map(ClientCredential::Assertion),
        }
    }
}
