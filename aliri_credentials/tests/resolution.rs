use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use aliri_credentials::{
    loaders::CustomAssertionLoader, AssertionProvider, ClientAssertion, ClientCredential,
    CredentialDescription, CredentialResolutionChain, CredentialSource, CredentialSourceLoader,
    LoadState, LoadedCredential, LoaderParameters, LoaderRegistry, ResolveError, SignedAssertion,
    SigningError, SourceKind,
};
use async_trait::async_trait;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

/// Produces `"{name}-{n}"` for the n-th computation, or fails every time
#[derive(Debug)]
struct CountingProvider {
    name: &'static str,
    lifetime: Duration,
    delay: Duration,
    fail: bool,
    computations: AtomicUsize,
}

impl CountingProvider {
    fn succeeding(name: &'static str, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            lifetime,
            delay: Duration::ZERO,
            fail: false,
            computations: AtomicUsize::new(0),
        })
    }

    fn slow(name: &'static str, lifetime: Duration, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            lifetime,
            delay,
            fail: false,
            computations: AtomicUsize::new(0),
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            lifetime: Duration::ZERO,
            delay: Duration::ZERO,
            fail: true,
            computations: AtomicUsize::new(0),
        })
    }

    fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssertionProvider for CountingProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let n = self.computations.fetch_add(1, Ordering::SeqCst) + 1;

        if self.fail {
            return Err(SigningError::provider(format!("{} is unavailable", self.name)));
        }

        Ok(ClientAssertion::new(
            SignedAssertion::new(format!("{}-{}", self.name, n)),
            SystemTime::now() + self.lifetime,
        ))
    }
}

/// Records which custom providers the chain asked to load
#[derive(Debug)]
struct RecordingLoader {
    inner: CustomAssertionLoader,
    loaded: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CredentialSourceLoader for RecordingLoader {
    fn source_kind(&self) -> SourceKind {
        self.inner.source_kind()
    }

    async fn load_if_needed(
        &self,
        source: &CredentialSource,
        state: &mut LoadState,
        params: &LoaderParameters,
    ) -> Result<(), aliri_credentials::ConfigurationError> {
        if let CredentialSource::CustomSignedAssertion { provider_name } = source {
            self.loaded.lock().unwrap().push(provider_name.clone());
        }
        self.inner.load_if_needed(source, state, params).await
    }
}

fn custom(name: &str) -> CredentialDescription {
    CredentialDescription::new(CredentialSource::CustomSignedAssertion {
        provider_name: name.to_owned(),
    })
    .with_name(name)
}

fn chain_with(
    providers: &[Arc<CountingProvider>],
) -> (CredentialResolutionChain, Arc<Mutex<Vec<String>>>) {
    let loader = providers
        .iter()
        .fold(CustomAssertionLoader::new(), |loader, provider| {
            loader.with_shared_provider(provider.name, Arc::clone(provider) as Arc<dyn AssertionProvider>)
        });
    let loaded = Arc::new(Mutex::new(Vec::new()));
    let registry = LoaderRegistry::new().with_loader(RecordingLoader {
        inner: loader,
        loaded: Arc::clone(&loaded),
    });

    (CredentialResolutionChain::new(registry), loaded)
}

async fn assertion_of(resolved: &aliri_credentials::ResolvedCredential) -> Result<String> {
    match resolved.client_credential(&CancellationToken::new()).await? {
        ClientCredential::Assertion(assertion) => Ok(assertion.as_str().to_owned()),
        ClientCredential::Secret(_) => Err(color_eyre::eyre::eyre!("expected an assertion")),
    }
}

#[tokio::test]
async fn first_viable_source_wins_and_later_sources_are_untouched() -> Result<()> {
    let a = CountingProvider::failing("a");
    let b = CountingProvider::succeeding("b", Duration::from_secs(1));
    let c = CountingProvider::succeeding("c", Duration::from_secs(60));
    let (chain, loaded) = chain_with(&[a.clone(), b.clone(), c.clone()]);

    let descriptions = vec![custom("a"), custom("b"), custom("c")];

    let resolved = chain
        .resolve_first_viable(&descriptions, &LoaderParameters::new())
        .await?;

    assert_eq!(resolved.index(), 1);
    assert_eq!(resolved.name(), Some("b"));
    assert_eq!(*loaded.lock().unwrap(), vec!["a", "b"]);

    // The failed probe leaves its assertion source behind for a later retry.
    assert!(descriptions[0].is_skipped().await);
    assert!(matches!(
        descriptions[0].cached_value().await,
        Some(LoadedCredential::Assertion(_))
    ));
    assert!(!descriptions[2].is_skipped().await);
    assert!(descriptions[2].cached_value().await.is_none());
    assert_eq!(c.computations(), 0);

    // The probe computed the first assertion, so both of these are served from cache.
    let first = assertion_of(&resolved).await?;
    let second = assertion_of(&resolved).await?;
    assert_eq!(first, "b-1");
    assert_eq!(second, first);
    assert_eq!(b.computations(), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let third = assertion_of(&resolved).await?;
    assert_eq!(third, "b-2");
    assert_eq!(b.computations(), 2);

    Ok(())
}

#[tokio::test]
async fn all_sources_failing_is_exhaustion() -> Result<()> {
    let (chain, loaded) = chain_with(&[
        CountingProvider::failing("a"),
        CountingProvider::failing("b"),
        CountingProvider::failing("c"),
    ]);

    let descriptions = vec![custom("a"), custom("b"), custom("c")];

    let err = match chain
        .resolve_first_viable(&descriptions, &LoaderParameters::new())
        .await
    {
        Err(ResolveError::Exhausted(err)) => err,
        other => panic!("expected exhaustion, got {:?}", other),
    };

    assert_eq!(*loaded.lock().unwrap(), vec!["a", "b", "c"]);
    for description in &descriptions {
        assert!(description.is_skipped().await);
    }

    let attempted = err
        .attempted()
        .iter()
        .map(|a| (a.index, a.name.as_deref()))
        .collect::<Vec<_>>();
    assert_eq!(attempted, vec![(0, Some("a")), (1, Some("b")), (2, Some("c"))]);

    let last = err.last_error().expect("a failure is reported");
    assert_eq!(last.kind(), SourceKind::CustomSignedAssertion);

    Ok(())
}

#[tokio::test]
async fn recovered_source_reuses_its_cached_provider() -> Result<()> {
    let flaky = Arc::new(FlakyProvider::default());
    let fallback = CountingProvider::succeeding("fallback", Duration::from_secs(60));

    let loader = CustomAssertionLoader::new()
        .with_shared_provider("flaky", Arc::clone(&flaky) as Arc<dyn AssertionProvider>)
        .with_shared_provider("fallback", Arc::clone(&fallback) as Arc<dyn AssertionProvider>);
    let chain = CredentialResolutionChain::new(LoaderRegistry::new().with_loader(loader));
    let descriptions = vec![custom("flaky"), custom("fallback")];

    let first = chain
        .resolve_first_viable(&descriptions, &LoaderParameters::new())
        .await?;
    assert_eq!(first.name(), Some("fallback"));

    let cached = match descriptions[0].cached_value().await {
        Some(LoadedCredential::Assertion(cache)) => cache,
        other => panic!("expected a cached assertion source, got {:?}", other),
    };

    flaky.available.store(1, Ordering::SeqCst);

    let second = chain
        .resolve_first_viable(&descriptions, &LoaderParameters::new())
        .await?;
    assert_eq!(second.name(), Some("flaky"));
    match second.credential() {
        LoadedCredential::Assertion(cache) => assert!(Arc::ptr_eq(cache, &cached)),
        other => panic!("expected an assertion source, got {:?}", other),
    }

    Ok(())
}

#[derive(Debug, Default)]
struct FlakyProvider {
    available: AtomicUsize,
}

#[async_trait]
impl AssertionProvider for FlakyProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        if self.available.load(Ordering::SeqCst) == 0 {
            return Err(SigningError::provider("sidecar not ready"));
        }

        Ok(ClientAssertion::new(
            SignedAssertion::from_static("flaky"),
            SystemTime::now() + Duration::from_secs(60),
        ))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_resolutions_probe_each_source_once() -> Result<()> {
    let slow = CountingProvider::slow("slow", Duration::from_secs(60), Duration::from_millis(50));
    let (chain, loaded) = chain_with(&[slow.clone()]);
    let chain = Arc::new(chain);
    let descriptions = Arc::new(vec![custom("slow")]);

    let tasks = (0..20)
        .map(|_| {
            let chain = Arc::clone(&chain);
            let descriptions = Arc::clone(&descriptions);
            tokio::spawn(async move {
                chain
                    .resolve_first_viable(&descriptions, &LoaderParameters::new())
                    .await
                    .map(|resolved| resolved.index())
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        assert_eq!(task.await??, 0);
    }

    assert_eq!(loaded.lock().unwrap().len(), 20);
    assert_eq!(slow.computations(), 1);

    Ok(())
}
