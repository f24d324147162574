pub mod auth;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod normalize;
pub mod reconcile;
pub mod session;
pub mod surface;

#[cfg(test)]
mod test_support;

pub type Decimal = rust_decimal::Decimal;

pub use anyhow::Result;
pub use auth::{AuthProbe, AuthState, Login, LoginWait};
pub use error::{BalanceError, ExtractError, LedgerError, NormalizeError, RunError, SessionError};
pub use extract::{BalanceSource, Polling, RawValue};
pub use ledger::{BalanceLedger, LedgerCommand};
pub use normalize::{Rounding, normalize, normalize_with};
pub use reconcile::{
    Comparison, EngineConfig, ReconcileItem, ReconciliationResult, Reconciler, RunReport, RunStatus, Shape,
    SiteAdapter, TrackedBalance, compare,
};
pub use session::{SessionArtifact, SessionStore};
pub use surface::Surface;
