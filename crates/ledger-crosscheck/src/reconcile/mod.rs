//! Running one site: session reuse, authentication, extraction and comparison.

mod compare;

pub use compare::{Comparison, compare};

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::Decimal;
use crate::auth::{AuthProbe, Login, LoginWait, bounded, detect, wait_for_login};
use crate::error::{BalanceError, RunError};
use crate::extract::{self, BalanceSource, Polling, RawValue};
use crate::ledger::BalanceLedger;
use crate::normalize::{Rounding, normalize_with};
use crate::session::{self, SessionStore};
use crate::surface::Surface;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_max_age: Duration,
    pub probe_timeout: Duration,
    pub login: LoginWait,
    pub extraction: Polling,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            session_max_age: session::DEFAULT_MAX_AGE,
            probe_timeout: Duration::from_secs(10),
            login: LoginWait::default(),
            extraction: Polling::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// One value in one commodity.
    #[default]
    Single,
    /// A listing of values keyed by commodity symbol, compared symbol by symbol.
    PerCommodity,
}

/// One (site balance, ledger account) pair.
#[derive(Debug, Clone)]
pub struct TrackedBalance<L> {
    pub id: String,
    pub ledger_account: String,
    pub locator: L,
    pub tolerance: Decimal,
    pub rounding: Rounding,
    pub shape: Shape,
}

pub struct SiteAdapter<S: Surface, L: Sync> {
    pub name: String,
    pub probe: Box<dyn AuthProbe<S>>,
    pub source: Box<dyn BalanceSource<S, L>>,
    pub login: Option<Box<dyn Login<S>>>,
    /// `None` for public surfaces, which are read without authentication.
    pub session: Option<SessionStore>,
    pub balances: Vec<TrackedBalance<L>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    SessionCheck,
    Authenticate,
    Close,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::SessionCheck => "session check",
            Stage::Authenticate => "authentication",
            Stage::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub balance_id: String,
    /// Set for entries of a per-commodity balance.
    pub symbol: Option<String>,
    pub ledger_account: String,
    /// Text as read from the site. `None` when the symbol was absent from the
    /// site's listing and counted as zero.
    pub raw: Option<RawValue>,
    pub actual: Decimal,
    pub expected: Decimal,
    pub difference: Decimal,
    pub tolerance: Decimal,
    pub within_tolerance: bool,
}

impl ReconciliationResult {
    pub fn label(&self) -> String {
        item_label(&self.balance_id, self.symbol.as_deref())
    }
}

#[derive(Debug)]
pub enum ReconcileItem {
    Compared(ReconciliationResult),
    Failed { id: String, error: BalanceError },
}

impl ReconcileItem {
    pub fn status(&self) -> RunStatus {
        match self {
            ReconcileItem::Compared(result) if result.within_tolerance => RunStatus::Matched,
            ReconcileItem::Compared(_) => RunStatus::Mismatched,
            ReconcileItem::Failed { .. } => RunStatus::DataError,
        }
    }
}

/// Outcome of a run, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStatus {
    Matched,
    Mismatched,
    DataError,
    AuthFailed,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Matched => 0,
            RunStatus::Mismatched => 1,
            RunStatus::DataError => 2,
            RunStatus::AuthFailed => 3,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Matched => "matched",
            RunStatus::Mismatched => "mismatch",
            RunStatus::DataError => "error",
            RunStatus::AuthFailed => "auth failed",
        })
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub site: String,
    pub started_at: DateTime<Utc>,
    pub items: Vec<ReconcileItem>,
    /// Set when the run ended before balances could be read.
    pub error: Option<RunError>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match &self.error {
            Some(RunError::Authentication(_)) => RunStatus::AuthFailed,
            Some(_) => RunStatus::DataError,
            None => self
                .items
                .iter()
                .map(ReconcileItem::status)
                .max()
                .unwrap_or(RunStatus::Matched),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.status().exit_code()
    }
}

pub struct Reconciler {
    config: EngineConfig,
    ledger: Arc<dyn BalanceLedger>,
}

impl Reconciler {
    pub fn new(config: EngineConfig, ledger: Arc<dyn BalanceLedger>) -> Self {
        Reconciler { config, ledger }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconcile every tracked balance of `site`. The surface is closed before this
    /// returns, whatever the outcome.
    pub async fn run<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        mut surface: S,
    ) -> RunReport {
        let started_at = Utc::now();
        tracing::info!(site = %site.name, balances = site.balances.len(), "starting reconciliation");

        let outcome = self.drive(site, &mut surface).await;
        if let Err(e) = surface.close().await {
            tracing::warn!(site = %site.name, stage = Stage::Close.as_str(), "closing surface failed: {e:#}");
        }

        let report = match outcome {
            Ok(items) => RunReport {
                site: site.name.clone(),
                started_at,
                items,
                error: None,
            },
            Err(error) => {
                tracing::error!(site = %site.name, "run aborted: {error}");
                RunReport {
                    site: site.name.clone(),
                    started_at,
                    items: Vec::new(),
                    error: Some(error),
                }
            }
        };
        tracing::info!(site = %site.name, status = %report.status(), "reconciliation finished");
        report
    }

    async fn drive<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        surface: &mut S,
    ) -> Result<Vec<ReconcileItem>, RunError> {
        match &site.session {
            Some(store) => self.establish_session(site, store, surface).await?,
            None => {
                tracing::debug!(site = %site.name, "public surface, skipping authentication");
                step(Stage::SessionCheck, surface.navigate()).await?;
            }
        }

        let mut items = Vec::new();
        for balance in &site.balances {
            match balance.shape {
                Shape::Single => items.push(self.single(site, balance, surface).await),
                Shape::PerCommodity => items.extend(self.per_commodity(site, balance, surface).await),
            }
        }
        Ok(items)
    }

    async fn establish_session<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        store: &SessionStore,
        surface: &mut S,
    ) -> Result<(), RunError> {
        let artifact = match store.load()? {
            Some(artifact) if artifact.is_stale(self.config.session_max_age) => {
                tracing::info!(
                    site = %site.name,
                    age_hours = artifact.age_at(Utc::now()).num_hours(),
                    "cached session is stale, rotating"
                );
                store.invalidate()?;
                None
            }
            artifact => artifact,
        };

        let mut reused = false;
        if let Some(artifact) = &artifact {
            match surface.restore(&artifact.payload).await {
                Ok(()) => reused = true,
                Err(e) => {
                    tracing::warn!(
                        site = %site.name,
                        path = %store.path().display(),
                        "cached session cannot be restored, discarding it: {e:#}"
                    );
                    store.invalidate()?;
                    return self.authenticate(site, store, surface).await;
                }
            }
        }
        step(Stage::SessionCheck, surface.navigate()).await?;

        let state = detect(site.probe.as_ref(), surface, self.config.probe_timeout).await;
        tracing::info!(site = %site.name, %state, reused, "session checked");
        if state.is_authenticated() {
            if !reused {
                self.persist(store, surface).await?;
            }
            return Ok(());
        }

        self.authenticate(site, store, surface).await
    }

    async fn authenticate<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        store: &SessionStore,
        surface: &mut S,
    ) -> Result<(), RunError> {
        store.invalidate()?;
        step(Stage::Authenticate, surface.reset()).await?;
        step(Stage::Authenticate, surface.navigate()).await?;

        let authenticated = match &site.login {
            Some(login) => self.log_in(site, login.as_ref(), surface).await?,
            None => {
                wait_for_login(site.probe.as_ref(), surface, self.config.login).await
                    && detect(site.probe.as_ref(), surface, self.config.probe_timeout)
                        .await
                        .is_authenticated()
            }
        };
        if !authenticated {
            return Err(RunError::Authentication(format!(
                "{} is still not logged in",
                site.name
            )));
        }

        tracing::info!(site = %site.name, "authenticated");
        self.persist(store, surface).await
    }

    /// Programmatic login with a single retry from a clean state.
    async fn log_in<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        login: &dyn Login<S>,
        surface: &mut S,
    ) -> Result<bool, RunError> {
        for attempt in 1..=2 {
            match bounded(login.log_in(surface), self.config.login.max_wait).await {
                Ok(()) => {
                    if detect(site.probe.as_ref(), surface, self.config.probe_timeout)
                        .await
                        .is_authenticated()
                    {
                        return Ok(true);
                    }
                    tracing::warn!(site = %site.name, attempt, "login submitted but no logged-in marker found");
                }
                Err(e) => tracing::warn!(site = %site.name, attempt, "login failed: {e:#}"),
            }
            if attempt == 1 {
                step(Stage::Authenticate, surface.reset()).await?;
                step(Stage::Authenticate, surface.navigate()).await?;
            }
        }
        Ok(false)
    }

    async fn persist<S: Surface>(&self, store: &SessionStore, surface: &mut S) -> Result<(), RunError> {
        let payload = step(Stage::Authenticate, surface.export()).await?;
        store.save(&payload)?;
        Ok(())
    }

    async fn single<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        balance: &TrackedBalance<L>,
        surface: &mut S,
    ) -> ReconcileItem {
        let outcome = async {
            let raw = extract::extract(
                site.source.as_ref(),
                surface,
                &balance.locator,
                self.config.extraction,
            )
            .await?;
            let actual = normalize_with(&raw.text, balance.rounding)?;
            let expected = self.ledger.balance(&balance.ledger_account).await?;
            Ok::<_, BalanceError>(evaluate(balance, None, Some(raw), actual, expected))
        }
        .await;

        match outcome {
            Ok(result) => {
                log_result(&site.name, &result);
                ReconcileItem::Compared(result)
            }
            Err(error) => failed(&site.name, balance.id.clone(), error),
        }
    }

    async fn per_commodity<S: Surface, L: Sync>(
        &self,
        site: &SiteAdapter<S, L>,
        balance: &TrackedBalance<L>,
        surface: &mut S,
    ) -> Vec<ReconcileItem> {
        let listing = match extract::extract_assets(
            site.source.as_ref(),
            surface,
            &balance.locator,
            self.config.extraction,
        )
        .await
        {
            Ok(listing) => listing,
            Err(e) => return vec![failed(&site.name, balance.id.clone(), e.into())],
        };
        let ledger = match self.ledger.balances(&balance.ledger_account).await {
            Ok(ledger) => ledger,
            Err(e) => return vec![failed(&site.name, balance.id.clone(), e.into())],
        };

        let symbols: BTreeSet<&String> = listing.keys().chain(ledger.keys()).collect();
        let mut items = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let actual = match listing.get(symbol) {
                Some(raw) => match normalize_with(&raw.text, balance.rounding) {
                    Ok(actual) => actual,
                    Err(e) => {
                        let id = item_label(&balance.id, Some(symbol.as_str()));
                        items.push(failed(&site.name, id, e.into()));
                        continue;
                    }
                },
                None => Decimal::ZERO,
            };
            let expected = ledger.get(symbol).copied().unwrap_or(Decimal::ZERO);

            let result = evaluate(
                balance,
                Some(symbol.clone()),
                listing.get(symbol).cloned(),
                actual,
                expected,
            );
            log_result(&site.name, &result);
            items.push(ReconcileItem::Compared(result));
        }
        items
    }
}

fn evaluate<L>(
    balance: &TrackedBalance<L>,
    symbol: Option<String>,
    raw: Option<RawValue>,
    actual: Decimal,
    expected: Decimal,
) -> ReconciliationResult {
    let expected = balance.rounding.apply(expected);
    let comparison = compare(actual, expected, balance.tolerance);
    ReconciliationResult {
        balance_id: balance.id.clone(),
        symbol,
        ledger_account: balance.ledger_account.clone(),
        raw,
        actual,
        expected,
        difference: comparison.difference,
        tolerance: balance.tolerance,
        within_tolerance: comparison.within_tolerance,
    }
}

fn log_result(site: &str, result: &ReconciliationResult) {
    let balance = result.label();
    if result.within_tolerance {
        tracing::info!(site, %balance, actual = %result.actual, expected = %result.expected, "balance matches");
    } else {
        tracing::warn!(
            site,
            %balance,
            actual = %result.actual,
            expected = %result.expected,
            difference = %result.difference,
            "balance mismatch"
        );
    }
}

fn failed(site: &str, id: String, error: BalanceError) -> ReconcileItem {
    tracing::error!(site, balance = %id, "{error}");
    ReconcileItem::Failed { id, error }
}

fn item_label(id: &str, symbol: Option<&str>) -> String {
    match symbol {
        Some(symbol) => format!("{id}:{symbol}"),
        None => id.to_owned(),
    }
}

async fn step<T>(stage: Stage, future: impl Future<Output = anyhow::Result<T>>) -> Result<T, RunError> {
    future.await.map_err(|error| RunError::Surface {
        stage: stage.as_str(),
        error,
    })
}
