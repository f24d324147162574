use anyhow::Result;

/// The account page or API endpoint a site adapter reads from.
///
/// A surface is driven by a single run at a time. Implementations hold whatever
/// connection or browser state they need; [`Surface::close`] is called exactly once
/// at the end of every run, whatever its outcome.
#[async_trait::async_trait]
pub trait Surface: Send {
    /// Install a cached session payload before the first navigation.
    async fn restore(&mut self, payload: &serde_json::Value) -> Result<()>;

    /// Drop all authentication state, as if starting from a fresh profile.
    async fn reset(&mut self) -> Result<()>;

    /// Load the site's landing page.
    async fn navigate(&mut self) -> Result<()>;

    /// Sample the surface again without navigating away, so that asynchronously
    /// rendered content or out-of-band changes become visible.
    async fn observe(&mut self) -> Result<()>;

    /// Serialize the current authentication state for the session store.
    async fn export(&self) -> Result<serde_json::Value>;

    /// What the human should do to log in while the waiter is polling.
    fn manual_login_hint(&self) -> String;

    async fn close(&mut self) -> Result<()>;
}
