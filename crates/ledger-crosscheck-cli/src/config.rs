use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ledger_crosscheck::{
    Decimal, EngineConfig, LedgerCommand, LoginWait, Polling, Rounding, Shape, TrackedBalance,
};
use ledger_crosscheck_sites::{FormLogin, Markers, PageLocator, SiteSettings, Target, Url};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLedger {
    #[serde(default = "default_ledger_command")]
    pub command: String,
    pub file: PathBuf,
    /// Extra arguments passed to `balance`, e.g. `["--exchange", "RUB"]`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_ledger_timeout")]
    pub timeout_secs: u64,
}

fn default_ledger_command() -> String {
    "ledger".to_owned()
}

fn default_ledger_timeout() -> u64 {
    30
}

impl ConfigLedger {
    pub fn command(&self, base_dir: &Path) -> LedgerCommand {
        let mut command = LedgerCommand::new(&self.command, &self.file);
        // expanded `~/` paths are absolute, so joining leaves them alone
        command.file = base_dir.join(&command.file);
        command.extra_args = self.args.clone();
        command.timeout = Duration::from_secs(self.timeout_secs);
        command
    }
}

/// Timing of a run. Every wait has an upper bound.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigEngine {
    pub session_max_age_hours: u64,
    pub login_timeout_secs: u64,
    pub login_poll_ms: u64,
    pub probe_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub extract_poll_ms: u64,
    pub settle_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Directory for session files, relative to the config file.
    pub cache_dir: PathBuf,
}

impl Default for ConfigEngine {
    fn default() -> Self {
        ConfigEngine {
            session_max_age_hours: 24,
            login_timeout_secs: 240,
            login_poll_ms: 2000,
            probe_timeout_secs: 10,
            extract_timeout_secs: 30,
            extract_poll_ms: 1000,
            settle_delay_ms: 2000,
            request_timeout_secs: 30,
            cache_dir: PathBuf::from("cache"),
        }
    }
}

impl ConfigEngine {
    pub fn engine_config(&self) -> EngineConfig {
        let probe_timeout = Duration::from_secs(self.probe_timeout_secs);
        EngineConfig {
            session_max_age: Duration::from_secs(
                self.session_max_age_hours.saturating_mul(60 * 60),
            ),
            probe_timeout,
            login: LoginWait {
                max_wait: Duration::from_secs(self.login_timeout_secs),
                check_interval: Duration::from_millis(self.login_poll_ms),
                probe_timeout,
            },
            extraction: Polling {
                timeout: Duration::from_secs(self.extract_timeout_secs),
                interval: Duration::from_millis(self.extract_poll_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Reuse a cached session and log in when it is missing or rejected.
    #[default]
    Session,
    /// Public page, read without logging in.
    None,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMarkers {
    #[serde(default)]
    authenticated: Vec<String>,
    #[serde(default)]
    unauthenticated: Vec<String>,
    #[serde(default)]
    unauthenticated_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLogin {
    url: String,
    /// Form field name to `env:NAME`, `file:PATH` or a literal value.
    fields: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(try_from = "RawConfigSite")]
pub struct ConfigSite {
    pub url: String,
    pub login_url: Option<String>,
    pub auth: AuthMode,
    pub session_file: Option<PathBuf>,
    pub cookie_import: Option<PathBuf>,
    pub settle_delay_ms: Option<u64>,
    pub markers: Markers,
    pub login: Option<FormLogin>,
    pub balances: Vec<ConfigBalance>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigSite {
    url: String,
    login_url: Option<String>,
    #[serde(default)]
    auth: AuthMode,
    session_file: Option<PathBuf>,
    cookie_import: Option<PathBuf>,
    settle_delay_ms: Option<u64>,
    #[serde(default)]
    markers: RawMarkers,
    login: Option<RawLogin>,
    #[serde(default)]
    balances: Vec<ConfigBalance>,
}

impl TryFrom<RawConfigSite> for ConfigSite {
    type Error = String;

    fn try_from(raw: RawConfigSite) -> Result<Self, Self::Error> {
        if raw.balances.is_empty() {
            return Err("site has no [[balances]]".to_string());
        }
        if raw.auth == AuthMode::Session && raw.markers.authenticated.is_empty() {
            return Err(
                "sites with auth = \"session\" need at least one markers.authenticated pattern"
                    .to_string(),
            );
        }
        if raw.auth == AuthMode::None && raw.login.is_some() {
            return Err("a login form makes no sense with auth = \"none\"".to_string());
        }
        let landing =
            Url::parse(&raw.url).map_err(|e| format!("invalid site url {:?}: {e}", raw.url))?;
        let relative = [raw.login_url.as_deref(), raw.login.as_ref().map(|l| l.url.as_str())];
        for url in relative.into_iter().flatten() {
            landing
                .join(url)
                .map_err(|e| format!("invalid url {url:?}: {e}"))?;
        }

        let login = raw.login.map(|login| FormLogin {
            url: login.url,
            fields: login
                .fields
                .into_iter()
                .map(|(name, source)| {
                    let Ok(credential) = source.parse();
                    (name, credential)
                })
                .collect(),
        });

        Ok(ConfigSite {
            url: raw.url,
            login_url: raw.login_url,
            auth: raw.auth,
            session_file: raw.session_file,
            cookie_import: raw.cookie_import,
            settle_delay_ms: raw.settle_delay_ms,
            markers: Markers {
                authenticated: raw.markers.authenticated,
                unauthenticated: raw.markers.unauthenticated,
                unauthenticated_urls: raw.markers.unauthenticated_urls,
            },
            login,
            balances: raw.balances,
        })
    }
}

impl ConfigSite {
    pub fn settings(&self, name: &str, base_dir: &Path, engine: &ConfigEngine) -> SiteSettings {
        let session_file = match self.auth {
            AuthMode::None => None,
            AuthMode::Session => Some(base_dir.join(self.session_file.clone().unwrap_or_else(
                || engine.cache_dir.join(format!("{name}.json")),
            ))),
        };
        SiteSettings {
            url: self.url.clone(),
            login_url: self.login_url.clone(),
            session_file,
            cookie_import: self.cookie_import.as_ref().map(|path| base_dir.join(path)),
            request_timeout: Duration::from_secs(engine.request_timeout_secs),
            settle_delay: Duration::from_millis(
                self.settle_delay_ms.unwrap_or(engine.settle_delay_ms),
            ),
            markers: self.markers.clone(),
            login: self.login.clone(),
        }
    }

    pub fn tracked(&self) -> Vec<TrackedBalance<PageLocator>> {
        self.balances
            .iter()
            .map(|balance| TrackedBalance {
                id: balance.id.clone(),
                ledger_account: balance.account.clone(),
                locator: balance.locator.clone(),
                tolerance: balance.tolerance,
                rounding: balance.rounding,
                shape: balance.shape,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAssets {
    list: String,
    symbol: String,
    value: String,
}

/// A number written either as a TOML number or as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(try_from = "RawConfigBalance")]
pub struct ConfigBalance {
    pub id: String,
    pub account: String,
    pub locator: PageLocator,
    pub tolerance: Decimal,
    pub rounding: Rounding,
    pub shape: Shape,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigBalance {
    id: String,
    account: String,
    page: Option<String>,
    pattern: Option<String>,
    json_pointer: Option<String>,
    assets: Option<RawAssets>,
    tolerance: Option<RawAmount>,
    rounding: Option<String>,
    shape: Option<Shape>,
}

impl TryFrom<RawConfigBalance> for ConfigBalance {
    type Error = String;

    fn try_from(raw: RawConfigBalance) -> Result<Self, Self::Error> {
        let id = raw.id;
        let target = match (raw.pattern, raw.json_pointer, raw.assets) {
            (Some(pattern), None, None) => Target::Pattern(
                Regex::new(&pattern).map_err(|e| format!("balance {id}: invalid pattern: {e}"))?,
            ),
            (None, Some(pointer), None) => Target::JsonPointer(pointer),
            (None, None, Some(assets)) => Target::JsonAssets {
                list: assets.list,
                symbol: assets.symbol,
                value: assets.value,
            },
            (None, None, None) => {
                return Err(format!(
                    "balance {id} needs one of 'pattern', 'json_pointer' or 'assets'"
                ));
            }
            _ => {
                return Err(format!(
                    "balance {id} can only have one of 'pattern', 'json_pointer' or 'assets'"
                ));
            }
        };

        let shape = match (raw.shape, &target) {
            (Some(Shape::Single), Target::JsonAssets { .. }) => {
                return Err(format!("balance {id}: 'assets' needs shape = \"per_commodity\""));
            }
            (Some(shape), _) => shape,
            (None, Target::JsonAssets { .. }) => Shape::PerCommodity,
            (None, _) => Shape::Single,
        };

        let tolerance = match raw.tolerance {
            None => Decimal::ZERO,
            Some(amount) => parse_amount(amount)
                .ok_or_else(|| format!("balance {id}: invalid tolerance"))?,
        };
        if tolerance.is_sign_negative() {
            return Err(format!("balance {id}: tolerance cannot be negative"));
        }

        let rounding = match raw.rounding {
            None => Rounding::Exact,
            Some(rounding) => rounding.parse().map_err(|e| format!("balance {id}: {e}"))?,
        };

        Ok(ConfigBalance {
            id,
            account: raw.account,
            locator: PageLocator {
                page: raw.page,
                target,
            },
            tolerance,
            rounding,
            shape,
        })
    }
}

fn parse_amount(amount: RawAmount) -> Option<Decimal> {
    match amount {
        RawAmount::Integer(value) => Some(Decimal::from(value)),
        // the shortest representation, so 0.0001 stays 0.0001
        RawAmount::Float(value) => value.to_string().parse().ok(),
        RawAmount::Text(text) => text.trim().parse().ok(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub ledger: ConfigLedger,
    #[serde(default)]
    pub engine: ConfigEngine,
    #[serde(default)]
    pub sites: BTreeMap<String, ConfigSite>,
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<(PathBuf, Self)> {
        let base_dir = path.parent().map(ToOwned::to_owned).unwrap_or_default();

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok((base_dir, config))
    }

    pub fn find_and_load() -> Result<Option<(PathBuf, Self)>> {
        let config_locations = [
            Path::new("ledger-crosscheck.toml"),
            Path::new(".ledger-crosscheck.toml"),
        ];

        for location in &config_locations {
            if location.exists() {
                return Self::load_from_file(location).map(Some);
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[ledger]
file = "~/finance/main.ledger"
args = ["--exchange", "RUB"]

[engine]
login_timeout_secs = 60

[sites.shop]
url = "https://shop.example/account"
login_url = "/login"
cookie_import = "cookies/shop.txt"
markers.authenticated = ['<span class="user-name">([^<]+)</span>']
markers.unauthenticated_urls = ["/login"]

[[sites.shop.balances]]
id = "bonus"
account = "Assets:Shop:Bonus"
pattern = 'class="bonus-balance">([^<]+)<'
rounding = "truncate"

[sites.exchange]
url = "https://api.exchange.example/"
auth = "none"

[[sites.exchange.balances]]
id = "spot"
account = "Assets:Exchange"
page = "/v1/wallet"
assets = { list = "/balances", symbol = "/asset", value = "/free" }
tolerance = 0.0001
rounding = "round:4"
"#;

    fn parse(toml: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(toml)
    }

    #[test]
    fn example_config() {
        let config = parse(EXAMPLE).unwrap();

        assert_eq!(config.ledger.command, "ledger");
        assert_eq!(config.engine.login_timeout_secs, 60);
        assert_eq!(config.engine.extract_timeout_secs, 30);

        let shop = &config.sites["shop"];
        assert_eq!(shop.auth, AuthMode::Session);
        assert_eq!(shop.balances[0].rounding, Rounding::Truncate);
        assert_eq!(shop.balances[0].shape, Shape::Single);
        assert_eq!(shop.balances[0].tolerance, Decimal::ZERO);

        let spot = &config.sites["exchange"].balances[0];
        assert_eq!(spot.shape, Shape::PerCommodity);
        assert_eq!(spot.tolerance, "0.0001".parse().unwrap());
        assert_eq!(spot.rounding, Rounding::Round(4));
    }

    #[test]
    fn shipped_example_parses() {
        let config = parse(include_str!("../../../ledger-crosscheck.example.toml")).unwrap();
        assert_eq!(
            config.sites.keys().collect::<Vec<_>>(),
            ["bank", "exchange", "shop"]
        );
        assert!(config.sites["bank"].login.is_some());
    }

    #[test]
    fn session_file_defaults_to_cache_dir() {
        let config = parse(EXAMPLE).unwrap();
        let base = Path::new("/etc/crosscheck");

        let shop = config.sites["shop"].settings("shop", base, &config.engine);
        assert_eq!(
            shop.session_file.as_deref(),
            Some(Path::new("/etc/crosscheck/cache/shop.json"))
        );
        assert_eq!(
            shop.cookie_import.as_deref(),
            Some(Path::new("/etc/crosscheck/cookies/shop.txt"))
        );
        assert_eq!(shop.settle_delay, Duration::from_secs(2));

        let exchange = config.sites["exchange"].settings("exchange", base, &config.engine);
        assert_eq!(exchange.session_file, None);
    }

    #[test]
    fn engine_timings() {
        let engine = ConfigEngine::default().engine_config();
        assert_eq!(engine.login.max_wait, Duration::from_secs(240));
        assert_eq!(engine.login.check_interval, Duration::from_secs(2));
        assert_eq!(engine.session_max_age, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn balance_needs_exactly_one_locator() {
        let error = parse(
            r#"
[ledger]
file = "main.ledger"

[sites.shop]
url = "https://shop.example/"
auth = "none"

[[sites.shop.balances]]
id = "card"
account = "Assets:Card"
pattern = "([0-9]+)"
json_pointer = "/balance"
"#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("only have one of"), "{error}");
    }

    #[test]
    fn session_sites_need_a_logged_in_marker() {
        let error = parse(
            r#"
[ledger]
file = "main.ledger"

[sites.shop]
url = "https://shop.example/"

[[sites.shop.balances]]
id = "card"
account = "Assets:Card"
json_pointer = "/balance"
"#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("markers.authenticated"), "{error}");
    }

    #[test]
    fn site_urls_are_checked_when_loading() {
        let error = parse(
            r#"
[ledger]
file = "main.ledger"

[sites.shop]
url = "shop.example/account"
auth = "none"

[[sites.shop.balances]]
id = "card"
account = "Assets:Card"
json_pointer = "/balance"
"#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("invalid site url"), "{error}");
    }

    #[test]
    fn shape_is_written_in_snake_case() {
        let site = |shape: &str| {
            format!(
                r#"
[ledger]
file = "main.ledger"

[sites.exchange]
url = "https://api.exchange.example/"
auth = "none"

[[sites.exchange.balances]]
id = "spot"
account = "Assets:Exchange"
json_pointer = "/free"
shape = "{shape}"
"#
            )
        };
        let config = parse(&site("per_commodity")).unwrap();
        assert_eq!(config.sites["exchange"].balances[0].shape, Shape::PerCommodity);
        assert!(parse(&site("PerCommodity")).is_err());
    }

    #[test]
    fn huge_session_age_does_not_overflow() {
        let engine = ConfigEngine {
            session_max_age_hours: u64::MAX,
            ..ConfigEngine::default()
        };
        assert_eq!(engine.engine_config().session_max_age, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = parse(
            r#"
[ledger]
file = "main.ledger"
binary = "hledger"
"#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("binary"), "{error}");
    }

    #[test]
    fn login_fields_become_credentials() {
        let config = parse(
            r#"
[ledger]
file = "main.ledger"

[sites.shop]
url = "https://shop.example/"
markers.authenticated = ["Sign out"]
login = { url = "/session", fields = { user = "alice", password = "env:SHOP_PASSWORD" } }

[[sites.shop.balances]]
id = "card"
account = "Assets:Card"
json_pointer = "/balance"
"#,
        )
        .unwrap();

        let login = config.sites["shop"].login.as_ref().unwrap();
        assert_eq!(login.url, "/session");
        assert_eq!(
            format!("{:?}", login.fields),
            r#"[("password", env:SHOP_PASSWORD), ("user", <literal>)]"#
        );
    }
}
