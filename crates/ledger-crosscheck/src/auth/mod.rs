//! Deciding whether a surface is logged in.
//!
//! Sites render neither a login button nor account widgets while they are still
//! loading, so the absence of a login marker is not evidence of a session. [`detect`]
//! asks for positive evidence both ways and fails closed when it has none.

mod login;

pub use login::{LoginWait, wait_for_login};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::surface::Surface;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    Unauthenticated,
    /// Neither marker was found. Callers treat this as [`AuthState::Unauthenticated`].
    Indeterminate,
}

impl AuthState {
    pub fn is_authenticated(self) -> bool {
        self == AuthState::Authenticated
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthState::Authenticated => "authenticated",
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Indeterminate => "indeterminate",
        })
    }
}

/// Per-site markers of a logged-in or logged-out surface.
#[async_trait::async_trait]
pub trait AuthProbe<S: Surface>: Send + Sync {
    /// An element or payload field only present for a logged-in user, and non-empty.
    async fn authenticated(&self, surface: &mut S) -> Result<bool>;

    /// A login button, form or redirect only present for a logged-out user.
    async fn unauthenticated(&self, surface: &mut S) -> Result<bool>;

    /// How long to let the surface render before looking for the logged-in marker a
    /// second time.
    fn settle_delay(&self) -> Duration {
        DEFAULT_SETTLE_DELAY
    }
}

/// Programmatic login for sites where credentials can be submitted directly.
#[async_trait::async_trait]
pub trait Login<S: Surface>: Send + Sync {
    async fn log_in(&self, surface: &mut S) -> Result<()>;
}

/// Classify the surface. Every probe is bounded by `probe_timeout`; a failing or
/// hanging probe counts as "marker not found".
pub async fn detect<S: Surface>(
    probe: &dyn AuthProbe<S>,
    surface: &mut S,
    probe_timeout: Duration,
) -> AuthState {
    if check(probe.authenticated(surface), probe_timeout, "authenticated").await {
        tracing::debug!("logged-in marker found");
        return AuthState::Authenticated;
    }
    if check(probe.unauthenticated(surface), probe_timeout, "unauthenticated").await {
        tracing::debug!("login marker found");
        return AuthState::Unauthenticated;
    }

    tokio::time::sleep(probe.settle_delay()).await;
    if let Err(e) = bounded(surface.observe(), probe_timeout).await {
        tracing::debug!("re-observing surface failed: {e:#}");
    }
    if check(probe.authenticated(surface), probe_timeout, "authenticated").await {
        tracing::debug!("logged-in marker found after settling");
        return AuthState::Authenticated;
    }

    tracing::warn!("no login or logged-in marker found, assuming not authenticated");
    AuthState::Indeterminate
}

pub(crate) async fn check(
    probe: impl Future<Output = Result<bool>>,
    limit: Duration,
    marker: &str,
) -> bool {
    match bounded(probe, limit).await {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(marker, "probe failed: {e:#}");
            false
        }
    }
}

pub(crate) async fn bounded<T>(
    future: impl Future<Output = Result<T>>,
    limit: Duration,
) -> Result<T> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("timed out after {limit:?}")),
    }
}
