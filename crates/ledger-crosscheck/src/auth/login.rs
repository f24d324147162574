use std::time::Duration;

use tokio::time::Instant;

use super::{AuthProbe, bounded, check};
use crate::surface::Surface;

/// Timing of the manual login wait. The wait is bounded by human reaction time, not
/// server load, so the interval is fixed.
#[derive(Debug, Clone, Copy)]
pub struct LoginWait {
    pub max_wait: Duration,
    pub check_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for LoginWait {
    fn default() -> Self {
        LoginWait {
            max_wait: Duration::from_secs(240),
            check_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Poll the surface until the logged-in marker shows up or `max_wait` has passed.
///
/// A failed probe (a page mid-navigation, a dropped request) only means "not yet".
/// Returns within one `check_interval` after the deadline.
pub async fn wait_for_login<S: Surface>(
    probe: &dyn AuthProbe<S>,
    surface: &mut S,
    wait: LoginWait,
) -> bool {
    tracing::warn!("{}", surface.manual_login_hint());
    tracing::info!(max_wait = ?wait.max_wait, "waiting for manual login");

    let deadline = Instant::now() + wait.max_wait;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Err(e) = bounded(surface.observe(), limit(wait, deadline)).await {
            tracing::debug!(attempts, "surface not ready: {e:#}");
        } else if check(probe.authenticated(surface), limit(wait, deadline), "authenticated").await
        {
            tracing::info!(attempts, "login detected");
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(attempts, "manual login was not completed in time");
            return false;
        }
        tokio::time::sleep(wait.check_interval.min(deadline - now)).await;
    }
}

/// A single call may not outlive the deadline.
fn limit(wait: LoginWait, deadline: Instant) -> Duration {
    wait.probe_timeout
        .min(deadline.saturating_duration_since(Instant::now()))
}
