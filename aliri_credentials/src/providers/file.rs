//! Signed assertions read from a file, such as a projected workload identity token

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::expiry_from_jwt;
use crate::{
    assertion::{AssertionProvider, ClientAssertion},
    clock::{Clock, System},
    error::SigningError,
    SignedAssertion,
};

const FALLBACK_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// An assertion provider that reads a signed assertion from a local file
///
/// The file is read again on every computation, since projected tokens are
/// rotated in place. The assertion expires at its own `exp` claim when it has
/// one, and five minutes after it was read otherwise.
#[derive(Debug)]
pub struct FileAssertionProvider {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileAssertionProvider {
    /// Constructs a new file assertion provider
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            clock: Arc::new(System),
        }
    }

    /// Sets a custom clock to be used
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The file the assertion is read from
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_assertion(&self) -> Result<ClientAssertion, io::Error> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let token = data.trim();

        if token.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("assertion file {} is empty", self.path.display()),
            ));
        }

        let expiry = expiry_from_jwt(token).unwrap_or_else(|| self.clock.now() + FALLBACK_LIFETIME);

        Ok(ClientAssertion::new(SignedAssertion::new(token.to_owned()), expiry))
    }
}

#[async_trait]
impl AssertionProvider for FileAssertionProvider {
    async fn produce_assertion(&self) -> Result<ClientAssertion, SigningError> {
        tracing::trace!(path = %self.path.display(), "reading signed assertion from file");
        self.read_assertion().await.map_err(SigningError::provider)
    }
}
