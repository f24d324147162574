//! A minimal cookie store keyed by name. Sites are fetched from one origin, so
//! domain and path scoping are not tracked.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use cookie::Cookie;
use serde_json::Value;
use time::OffsetDateTime;

/// Above this size some sites answer "Request Header Or Cookie Too Large".
pub const HEADER_WARN_BYTES: usize = 4000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn extend(&mut self, other: CookieJar) {
        self.cookies.extend(other.cookies);
    }

    /// Apply one `Set-Cookie` header. Cookies expired through `Max-Age` or
    /// `Expires` are removed.
    pub fn apply_set_cookie(&mut self, header: &str) {
        self.apply_set_cookie_at(header, OffsetDateTime::now_utc());
    }

    fn apply_set_cookie_at(&mut self, header: &str, now: OffsetDateTime) {
        let cookie = match Cookie::parse(header) {
            Ok(cookie) => cookie,
            Err(e) => {
                tracing::debug!("ignoring malformed Set-Cookie header: {e}");
                return;
            }
        };

        let expired = cookie
            .max_age()
            .is_some_and(|age| age <= time::Duration::ZERO)
            || cookie.expires_datetime().is_some_and(|at| at <= now);
        if expired {
            self.cookies.remove(cookie.name());
        } else {
            self.cookies
                .insert(cookie.name().to_owned(), cookie.value().to_owned());
        }
    }

    /// The value of a `Cookie` request header, `None` for an empty jar.
    pub fn header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let header = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        Some(header)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "cookies": self.cookies })
    }

    /// Read a session payload written by [`CookieJar::to_json`]. A browser
    /// `storageState` (`{"cookies": [{"name", "value", ...}]}`) is accepted too.
    pub fn from_json(payload: &Value) -> Result<Self> {
        if let Some(entries) = payload.get("cookies").and_then(Value::as_array) {
            return Ok(Self::from_entries(entries, OffsetDateTime::now_utc()));
        }
        let cookies = payload
            .get("cookies")
            .and_then(Value::as_object)
            .context("session payload has no cookie map")?;
        let mut jar = CookieJar::default();
        for (name, value) in cookies {
            let value = value
                .as_str()
                .with_context(|| format!("cookie {name} is not a string"))?;
            jar.insert(name.as_str(), value);
        }
        Ok(jar)
    }

    /// Parse cookies handed over from a browser, either as a `Cookie` header line
    /// (optionally prefixed with `Cookie:`) or as JSON: a session payload, a flat
    /// name to value map, or a list of `{"name", "value"}` objects.
    pub fn parse_import(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.starts_with('{') || text.starts_with('[') {
            let json: Value = serde_json::from_str(text).context("invalid JSON cookie export")?;
            return Self::from_export(&json);
        }

        let line = match text.split_once(':') {
            Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("cookie") => rest,
            _ => text,
        };
        let mut jar = CookieJar::default();
        for pair in line.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    jar.insert(name, value.trim());
                }
            }
        }
        if jar.is_empty() {
            bail!("no cookies found");
        }
        Ok(jar)
    }

    fn from_export(json: &Value) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let jar = match json {
            Value::Object(map) => match map.get("cookies") {
                Some(Value::Object(_)) => Self::from_json(json)?,
                Some(Value::Array(entries)) => Self::from_entries(entries, now),
                _ => {
                    let mut jar = CookieJar::default();
                    for (name, value) in map {
                        if let Some(value) = value.as_str() {
                            jar.insert(name.as_str(), value);
                        }
                    }
                    jar
                }
            },
            Value::Array(entries) => Self::from_entries(entries, now),
            _ => CookieJar::default(),
        };
        if jar.is_empty() {
            bail!("no cookies found in JSON export");
        }
        Ok(jar)
    }

    /// Browser cookie objects. `expires` is in Unix seconds, `-1` for session cookies.
    fn from_entries(entries: &[Value], now: OffsetDateTime) -> Self {
        let mut jar = CookieJar::default();
        for entry in entries {
            let name = entry.get("name").and_then(Value::as_str);
            let value = entry.get("value").and_then(Value::as_str);
            let expired = entry
                .get("expires")
                .and_then(Value::as_f64)
                .is_some_and(|expires| expires > 0.0 && expires <= now.unix_timestamp() as f64);
            if let (Some(name), Some(value), false) = (name, value, expired) {
                jar.insert(name, value);
            }
        }
        jar
    }
}
