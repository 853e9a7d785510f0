//! Signed assertions and an expiry-aware, single-flight cache over their providers

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, System},
    error::SigningError,
    SignedAssertion, SignedAssertionRef,
};

/// A signed assertion along with the time after which it must not be used
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientAssertion {
    assertion: SignedAssertion,
    expiry: SystemTime,
}

impl ClientAssertion {
    /// Constructs a new client assertion
    pub fn new(assertion: SignedAssertion, expiry: SystemTime) -> Self {
        Self { assertion, expiry }
    }

    /// The signed assertion
    #[inline]
    pub fn assertion(&self) -> &SignedAssertionRef {
        &self.assertion
    }

    /// The time at which the assertion expires
    #[inline]
    pub fn expiry(&self) -> SystemTime {
        self.expiry
    }

    /// Whether the assertion may still be served at `now`
    ///
    /// An assertion is expired at the instant of its expiry, and `margin`
    /// moves that instant earlier.
    #[inline]
    pub fn is_valid_at(&self, now: SystemTime, margin: Duration) -> bool {
        now.checked_add(margin)
            .is_some_and(|deadline| deadline < self.expiry)
    }
}

/// A source of freshly computed signed assertions
///
/// Providers do not memoize. Wrap one in an [`AssertionCache`] to reuse each
/// assertion until it expires.
#[async_trait]
pub trait AssertionProvider: fmt::Debug + Send + Sync {
    /// Computes a new signed assertion
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError>;
}

#[async_trait]
impl<P: AssertionProvider + ?Sized> AssertionProvider for Arc<P> {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        (**self).produce_assertion().await
    }
}

type Flight = Shared<BoxFuture<'static, Result<ClientAssertion, SigningError>>>;

/// Memoizes the assertions of a provider until they expire
///
/// At most one computation is in flight at a time. Callers arriving while a
/// computation is running wait for it and share its outcome, whether that is
/// a fresh assertion or an error. A failed computation leaves nothing behind,
/// so the next caller starts a new one.
///
/// Cancelling a caller only fails that caller. The computation it started
/// keeps going for anyone else waiting on it, and is resumed by the next
/// caller if nobody is.
pub struct AssertionCache {
    provider: Arc<dyn AssertionProvider>,
    current: Arc<ArcSwapOption<ClientAssertion>>,
    in_flight: Mutex<Option<(u64, Flight)>>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
}

impl AssertionCache {
    /// Constructs a new, empty cache over `provider`, using the system clock
    pub fn new(provider: impl AssertionProvider + 'static) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Constructs a new, empty cache over a shared provider
    pub fn from_arc(provider: Arc<dyn AssertionProvider>) -> Self {
        Self {
            provider,
            current: Arc::new(ArcSwapOption::empty()),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            clock: Arc::new(System),
            expiry_margin: Duration::ZERO,
        }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets a custom shared clock to be used
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Treats assertions as expired `margin` before their reported expiry
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// The expiry of the currently cached assertion, if there is one
    pub fn cached_expiry(&self) -> Option<SystemTime> {
        self.current.load().as_ref().map(|a| a.expiry())
    }

    /// Gets a signed assertion, computing a new one only if the cached one has expired
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Provider`] if a fresh assertion was needed and the
    /// provider failed to produce one, or [`SigningError::Cancelled`] if
    /// `cancellation` fired before an assertion was available.
    pub async fn signed_assertion(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<SignedAssertion, SigningError> {
        if let Some(assertion) = self.fresh() {
            tracing::trace!("serving cached signed assertion");
            return Ok(assertion);
        }

        let (generation, flight) = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(SigningError::Cancelled),
            joined = self.join_flight() => match joined {
                Ok(assertion) => return Ok(assertion),
                Err(flight) => flight,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(SigningError::Cancelled),
            result = flight => result,
        };

        self.land_flight(generation).await;

        result.map(|fresh| fresh.assertion)
    }

    /// Checks that the provider can currently produce an assertion
    ///
    /// A successful probe leaves the assertion cached, so the first real
    /// request after it does not compute another.
    pub async fn probe_availability(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<(), SigningError> {
        self.signed_assertion(cancellation).await.map(|_| {
            tracing::trace!("assertion provider is available");
        })
    }

    fn fresh(&self) -> Option<SignedAssertion> {
        let now = self.clock.now();
        self.current
            .load()
            .as_ref()
            .filter(|a| a.is_valid_at(now, self.expiry_margin))
            .map(|a| a.assertion.clone())
    }

    /// Returns a cached assertion if one became fresh while waiting for the
    /// lock, otherwise the flight to wait on, starting one if none is running
    async fn join_flight(&self) -> Result<SignedAssertion, (u64, Flight)> {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(assertion) = self.fresh() {
            return Ok(assertion);
        }

        if let Some((generation, flight)) = &*in_flight {
            // A finished flight still in the slot was abandoned by the caller
            // that should have landed it, and its outcome is stale.
            if flight.peek().is_none() {
                tracing::trace!(generation, "joining in-flight assertion computation");
                return Err((*generation, flight.clone()));
            }
            tracing::trace!(generation, "discarding finished assertion computation");
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(generation, "computing new signed assertion");

        let provider = Arc::clone(&self.provider);
        let current = Arc::clone(&self.current);
        let flight = async move {
            let result = provider.produce_assertion().await;
            match &result {
                Ok(fresh) => current.store(Some(Arc::new(fresh.clone()))),
                Err(error) => {
                    tracing::warn!(
                        generation,
                        error = (error as &dyn std::error::Error),
                        "assertion provider failed"
                    );
                    current.store(None);
                }
            }
            result
        }
        .boxed()
        .shared();

        *in_flight = Some((generation, flight.clone()));
        Err((generation, flight))
    }

    async fn land_flight(&self, generation: u64) {
        let mut in_flight = self.in_flight.lock().await;
        if matches!(&*in_flight, Some((g, _)) if *g == generation) {
            *in_flight = None;
        }
    }
}

impl fmt::Debug for AssertionCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AssertionCache")
            .field("provider", &self.provider)
            .field("cached_expiry", &self.cached_expiry())
            .field("clock", &self.clock)
            .field("expiry_margin", &self.expiry_margin)
            .finish()
    }
}
