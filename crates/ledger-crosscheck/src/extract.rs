//! Reading raw balance text off a surface.
//!
//! Balances render asynchronously after the page shell, so a single read is not
//! enough. [`extract`] keeps sampling until the value shows up or the timeout hits.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::auth::bounded;
use crate::error::ExtractError;
use crate::surface::Surface;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub text: String,
    pub extracted_at: DateTime<Utc>,
}

impl RawValue {
    pub fn new(text: impl Into<String>) -> Self {
        RawValue {
            text: text.into(),
            extracted_at: Utc::now(),
        }
    }
}

/// Where on a surface a balance lives. `L` is the site-specific locator, such as a
/// pattern, a JSON path or a CSS selector.
#[async_trait::async_trait]
pub trait BalanceSource<S: Surface, L: Sync>: Send + Sync {
    /// Bring the surface to the page holding `locator`. Called once before sampling.
    async fn prepare(&self, _surface: &mut S, _locator: &L) -> Result<()> {
        Ok(())
    }

    /// Read the value once. `Ok(None)` means it has not rendered yet.
    async fn sample(&self, surface: &mut S, locator: &L) -> Result<Option<String>>;

    /// Read a per-commodity listing once, keyed by commodity symbol.
    async fn sample_assets(
        &self,
        _surface: &mut S,
        _locator: &L,
    ) -> Result<Option<BTreeMap<String, String>>> {
        anyhow::bail!("per-commodity balances are not supported by this source")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Polling {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(1),
        }
    }
}

/// Sample `locator` until a non-empty value appears.
pub async fn extract<S: Surface, L: Sync>(
    source: &dyn BalanceSource<S, L>,
    surface: &mut S,
    locator: &L,
    polling: Polling,
) -> Result<RawValue, ExtractError> {
    let text = poll(source, surface, locator, polling, |source, surface, locator| {
        Box::pin(async move {
            let text = source.sample(surface, locator).await?;
            Ok(text.filter(|text| !text.trim().is_empty()))
        })
    })
    .await?;
    Ok(RawValue::new(text))
}

/// Sample a per-commodity listing until it holds at least one entry.
pub async fn extract_assets<S: Surface, L: Sync>(
    source: &dyn BalanceSource<S, L>,
    surface: &mut S,
    locator: &L,
    polling: Polling,
) -> Result<BTreeMap<String, RawValue>, ExtractError> {
    let assets = poll(source, surface, locator, polling, |source, surface, locator| {
        Box::pin(async move {
            let assets = source.sample_assets(surface, locator).await?;
            Ok(assets.filter(|assets| !assets.is_empty()))
        })
    })
    .await?;

    let extracted_at = Utc::now();
    Ok(assets
        .into_iter()
        .map(|(symbol, text)| (symbol, RawValue { text, extracted_at }))
        .collect())
}

type SampleFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<T>>> + Send + 'a>>;

async fn poll<S, L, T>(
    source: &dyn BalanceSource<S, L>,
    surface: &mut S,
    locator: &L,
    polling: Polling,
    sample: for<'a> fn(&'a dyn BalanceSource<S, L>, &'a mut S, &'a L) -> SampleFuture<'a, T>,
) -> Result<T, ExtractError>
where
    S: Surface,
    L: Sync,
{
    let deadline = Instant::now() + polling.timeout;

    bounded(source.prepare(surface, locator), polling.timeout)
        .await
        .map_err(ExtractError::Navigation)?;

    let mut last_error = None;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match bounded(sample(source, surface, locator), remaining).await {
            Ok(Some(value)) => {
                tracing::debug!(attempts, "value extracted");
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(attempts, "sampling failed: {e:#}");
                last_error = Some(format!("{e:#}"));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ExtractError::Timeout {
                waited: polling.timeout,
                last_error,
            });
        }
        tokio::time::sleep(polling.interval.min(deadline - now)).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = bounded(surface.observe(), remaining).await {
            tracing::debug!("re-observing surface failed: {e:#}");
        }
    }
}
