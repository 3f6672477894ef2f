//! Authentication challenge handling.
//!
//! An [`Authenticator`] answers `401` (origin) and `407` (proxy) challenges
//! by returning a follow-up request carrying credentials, or `None` to give
//! up and hand the challenge response to the caller.
//!
//! # Example
//!
//! ```
//! use callwire::auth::BasicAuthenticator;
//!
//! let origin = BasicAuthenticator::new("aladdin", "opensesame");
//! assert_eq!(origin.credential(), "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::error::Result;
use crate::http::{Request, Response};
use crate::route::Route;

// ============================================================================
// Authenticator
// ============================================================================

/// Produces an authenticated follow-up for a challenge response.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns a request with credentials, or `None` if none are available.
    ///
    /// `route` is the route the challenge arrived on, when known.
    async fn authenticate(&self, route: Option<&Route>, response: &Response)
    -> Result<Option<Request>>;
}

/// Never authenticates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn authenticate(
        &self,
        _route: Option<&Route>,
        _response: &Response,
    ) -> Result<Option<Request>> {
        Ok(None)
    }
}

// ============================================================================
// BasicAuthenticator
// ============================================================================

/// Which challenge a [`BasicAuthenticator`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Origin,
    Proxy,
}

impl Target {
    fn challenge_header(self) -> &'static str {
        match self {
            Self::Origin => "www-authenticate",
            Self::Proxy => "proxy-authenticate",
        }
    }

    fn credential_header(self) -> &'static str {
        match self {
            Self::Origin => "Authorization",
            Self::Proxy => "Proxy-Authorization",
        }
    }
}

/// Answers `Basic` challenges with fixed credentials (RFC 7617).
///
/// Gives up when the rejected request already carried the same credential,
/// so wrong credentials end in the challenge response instead of a loop.
#[derive(Clone)]
pub struct BasicAuthenticator {
    credential: String,
    target: Target,
}

impl BasicAuthenticator {
    /// Creates an authenticator for origin (`401`) challenges.
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            credential: basic_credential(username, password),
            target: Target::Origin,
        }
    }

    /// Creates an authenticator for proxy (`407`) challenges.
    #[must_use]
    pub fn for_proxy(username: &str, password: &str) -> Self {
        Self {
            credential: basic_credential(username, password),
            target: Target::Proxy,
        }
    }

    /// Returns the header value sent, `Basic <base64>`.
    #[inline]
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }

    fn offers_basic(&self, response: &Response) -> bool {
        let mut challenges = response
            .headers()
            .get_all(self.target.challenge_header())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .peekable();

        // No challenge header at all: try anyway.
        if challenges.peek().is_none() {
            return true;
        }

        challenges.any(|value| {
            value
                .split(',')
                .any(|part| part.trim_start().to_ascii_lowercase().starts_with("basic"))
        })
    }
}

impl std::fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(
        &self,
        _route: Option<&Route>,
        response: &Response,
    ) -> Result<Option<Request>> {
        let header = self.target.credential_header();

        if response.request().header(header) == Some(self.credential.as_str()) {
            debug!(header, "Credentials were rejected, giving up");
            return Ok(None);
        }

        if !self.offers_basic(response) {
            debug!(header, "No Basic challenge offered");
            return Ok(None);
        }

        response
            .request()
            .to_builder()
            .header(header, &self.credential)
            .build()
            .map(Some)
    }
}

/// Encodes `username:password` as a Basic credential.
#[must_use]
pub fn basic_credential(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

// ============================================================================
// Tests
// ============================================================================
