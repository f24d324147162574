//! Expected balances from the ledger, queried through its command line tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::Decimal;
use crate::error::LedgerError;
use crate::normalize::normalize;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static AMOUNT_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<value>[-+]?[0-9][0-9.,']*)\s+(?P<symbol>[^\s0-9.,+-][^\s]*)")
        .expect("amount pattern is valid")
});
static SYMBOL_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sign>-)?(?P<symbol>[^\s0-9.,+-]+)\s*(?P<value>[-+]?[0-9][0-9.,']*)")
        .expect("amount pattern is valid")
});

#[async_trait::async_trait]
pub trait BalanceLedger: Send + Sync {
    /// The balance of `account` in its single commodity.
    async fn balance(&self, account: &str) -> Result<Decimal, LedgerError>;

    /// The balance of `account` per commodity symbol.
    async fn balances(&self, account: &str) -> Result<BTreeMap<String, Decimal>, LedgerError>;
}

/// Runs `<program> -f <file> balance <extra_args…> <account>`.
#[derive(Debug, Clone)]
pub struct LedgerCommand {
    pub program: String,
    pub file: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
}

impl LedgerCommand {
    pub fn new(program: impl Into<String>, file: impl AsRef<Path>) -> Self {
        LedgerCommand {
            program: program.into(),
            file: expand_home(file.as_ref()),
            extra_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    async fn query(&self, account: &str) -> Result<String, LedgerError> {
        let failed = |reason: String| LedgerError::QueryFailed {
            account: account.to_owned(),
            reason,
        };

        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(&self.file)
            .arg("balance")
            .args(&self.extra_args)
            .arg(account)
            .kill_on_drop(true);
        tracing::debug!(program = %self.program, file = %self.file.display(), account, "querying ledger");

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(failed(format!("could not run {}: {e}", self.program))),
            Err(_) => return Err(failed(format!("timed out after {:?}", self.timeout))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl BalanceLedger for LedgerCommand {
    async fn balance(&self, account: &str) -> Result<Decimal, LedgerError> {
        let stdout = self.query(account).await?;
        parse_balance(&stdout).ok_or_else(|| LedgerError::NoBalanceFound {
            account: account.to_owned(),
        })
    }

    async fn balances(&self, account: &str) -> Result<BTreeMap<String, Decimal>, LedgerError> {
        let stdout = self.query(account).await?;
        let balances = parse_balances(&stdout);
        if balances.is_empty() {
            return Err(LedgerError::NoBalanceFound {
                account: account.to_owned(),
            });
        }
        Ok(balances)
    }
}

/// The first number on the first line that has one.
pub fn parse_balance(stdout: &str) -> Option<Decimal> {
    stdout.lines().find_map(|line| normalize(line).ok())
}

/// One entry per commodity. Ledger repeats the commodities of a multi-account
/// report in the closing total block, so a later line overrides an earlier one.
pub fn parse_balances(stdout: &str) -> BTreeMap<String, Decimal> {
    let mut balances = BTreeMap::new();
    for line in stdout.lines().map(str::trim) {
        let (symbol, value, negate) = if let Some(captures) = AMOUNT_FIRST.captures(line) {
            (captures["symbol"].to_owned(), captures["value"].to_owned(), false)
        } else if let Some(captures) = SYMBOL_FIRST.captures(line) {
            let negate = captures.name("sign").is_some();
            (captures["symbol"].to_owned(), captures["value"].to_owned(), negate)
        } else {
            continue;
        };

        match normalize(&value) {
            Ok(value) => {
                balances.insert(symbol, if negate { -value } else { value });
            }
            Err(e) => tracing::debug!(line, "skipping ledger line: {e}"),
        }
    }
    balances
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
