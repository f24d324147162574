//! Locating balances on fetched pages: HTML or text through a regex, JSON through
//! pointers.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use ledger_crosscheck::{BalanceSource, Decimal, normalize};
use regex::Regex;
use serde_json::Value;

use crate::http::{HttpSurface, Page};

#[derive(Debug, Clone)]
pub struct PageLocator {
    /// Page holding the balance, relative to the site URL. The landing page when
    /// unset.
    pub page: Option<String>,
    pub target: Target,
}

#[derive(Debug, Clone)]
pub enum Target {
    /// The first capture group, or the whole match without groups. For
    /// per-commodity balances the named groups `symbol` and `value` are read from
    /// every match.
    Pattern(Regex),
    /// A JSON pointer (RFC 6901) into a JSON response.
    JsonPointer(String),
    /// A JSON array of holdings; `symbol` and `value` point into each entry.
    /// Entries sharing a symbol are summed.
    JsonAssets {
        list: String,
        symbol: String,
        value: String,
    },
}

/// Reads balances from the pages of an [`HttpSurface`].
#[derive(Debug, Default)]
pub struct PageSource;

#[async_trait::async_trait]
impl BalanceSource<HttpSurface, PageLocator> for PageSource {
    async fn prepare(&self, surface: &mut HttpSurface, locator: &PageLocator) -> Result<()> {
        let url = match &locator.page {
            Some(page) => surface.resolve(page)?,
            None => surface.landing().clone(),
        };
        if surface.page().is_some_and(|current| current.url == url) {
            return Ok(());
        }
        let page = surface.open(url).await?;
        if !page.status.is_success() {
            bail!("{} answered {}", page.url, page.status);
        }
        Ok(())
    }

    async fn sample(
        &self,
        surface: &mut HttpSurface,
        locator: &PageLocator,
    ) -> Result<Option<String>> {
        let Some(page) = current(surface)? else {
            return Ok(None);
        };
        match &locator.target {
            Target::Pattern(pattern) => Ok(first_match(pattern, &page.body)),
            Target::JsonPointer(pointer) => Ok(json(page)?.pointer(pointer).and_then(scalar)),
            Target::JsonAssets { .. } => bail!("an asset listing needs shape = \"per_commodity\""),
        }
    }

    async fn sample_assets(
        &self,
        surface: &mut HttpSurface,
        locator: &PageLocator,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let Some(page) = current(surface)? else {
            return Ok(None);
        };
        match &locator.target {
            Target::Pattern(pattern) => pattern_assets(pattern, &page.body).map(Some),
            Target::JsonAssets {
                list,
                symbol,
                value,
            } => json_assets(&json(page)?, list, symbol, value),
            Target::JsonPointer(pointer) => {
                let Some(object) = json(page)?.pointer(pointer).and_then(Value::as_object).cloned()
                else {
                    return Ok(None);
                };
                Ok(Some(
                    object
                        .iter()
                        .filter_map(|(symbol, value)| Some((symbol.clone(), scalar(value)?)))
                        .collect(),
                ))
            }
        }
    }
}

fn current(surface: &HttpSurface) -> Result<Option<&Page>> {
    match surface.page() {
        Some(page) if !page.status.is_success() => {
            bail!("{} answered {}", page.url, page.status)
        }
        page => Ok(page),
    }
}

fn json(page: &Page) -> Result<Value> {
    serde_json::from_str(&page.body).with_context(|| format!("{} did not return JSON", page.url))
}

fn first_match(pattern: &Regex, body: &str) -> Option<String> {
    let captures = pattern.captures(body)?;
    let found = captures.get(1).or_else(|| captures.get(0))?;
    Some(found.as_str().to_owned())
}

fn pattern_assets(pattern: &Regex, body: &str) -> Result<BTreeMap<String, String>> {
    let names: Vec<_> = pattern.capture_names().flatten().collect();
    if !names.contains(&"symbol") || !names.contains(&"value") {
        bail!("pattern for a per-commodity balance needs (?P<symbol>…) and (?P<value>…) groups");
    }
    let mut assets = BTreeMap::new();
    for captures in pattern.captures_iter(body) {
        if let (Some(symbol), Some(value)) = (captures.name("symbol"), captures.name("value")) {
            add_holding(&mut assets, symbol.as_str().trim(), value.as_str().trim())?;
        }
    }
    Ok(assets)
}

fn json_assets(
    json: &Value,
    list: &str,
    symbol: &str,
    value: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    let Some(entries) = json.pointer(list).and_then(Value::as_array) else {
        return Ok(None);
    };
    let mut assets = BTreeMap::new();
    for entry in entries {
        let (Some(name), Some(amount)) = (
            entry.pointer(symbol).and_then(Value::as_str),
            entry.pointer(value).and_then(scalar),
        ) else {
            tracing::debug!(%entry, "skipping holding without symbol or value");
            continue;
        };
        add_holding(&mut assets, name, &amount)?;
    }
    Ok(Some(assets))
}

fn add_holding(assets: &mut BTreeMap<String, String>, symbol: &str, amount: &str) -> Result<()> {
    match assets.get(symbol) {
        Some(existing) => {
            let total = normalize(existing)? + normalize(amount)?;
            assets.insert(symbol.to_owned(), total.normalize().to_string());
        }
        None => {
            assets.insert(symbol.to_owned(), amount.to_owned());
        }
    }
    Ok(())
}

/// A JSON string or number as text. Numbers in exponent notation are expanded,
/// since "1e-7" would otherwise read as 1.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => {
            let text = number.to_string();
            if text.contains(['e', 'E']) {
                Decimal::from_scientific(&text)
                    .ok()
                    .map(|decimal| decimal.normalize().to_string())
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}
