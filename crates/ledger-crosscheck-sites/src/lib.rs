//! Configuration-driven site adapters over HTTP.
//!
//! Every site is read through the same [`HttpSurface`]; what differs per site is
//! data: marker patterns, balance locators and an optional login form.

pub mod cookies;
pub mod http;
pub mod login;
pub mod probe;
pub mod source;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ledger_crosscheck::{Login, SessionStore, SiteAdapter, TrackedBalance};
pub use cookies::CookieJar;
pub use http::{HttpOptions, HttpSurface, Page};
pub use login::{Credential, FormLogin};
pub use probe::{MarkerProbe, Markers};
pub use reqwest::Url;
pub use source::{PageLocator, PageSource, Target};

pub type HttpSite = SiteAdapter<HttpSurface, PageLocator>;

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub url: String,
    pub login_url: Option<String>,
    /// `None` for public pages that need no login.
    pub session_file: Option<PathBuf>,
    pub cookie_import: Option<PathBuf>,
    pub request_timeout: Duration,
    pub settle_delay: Duration,
    pub markers: Markers,
    pub login: Option<FormLogin>,
}

impl SiteSettings {
    fn landing(&self) -> Result<Url> {
        Url::parse(&self.url).with_context(|| format!("invalid site URL {:?}", self.url))
    }

    /// A fresh surface for one run.
    pub fn surface(&self) -> Result<HttpSurface> {
        let landing = self.landing()?;
        let login_page = self
            .login_url
            .as_deref()
            .map(|url| {
                landing
                    .join(url)
                    .with_context(|| format!("invalid login URL {url:?}"))
            })
            .transpose()?;
        HttpSurface::new(HttpOptions {
            landing,
            login_page,
            cookie_import: self.cookie_import.clone(),
            request_timeout: self.request_timeout,
        })
    }

    pub fn adapter(
        &self,
        name: impl Into<String>,
        balances: Vec<TrackedBalance<PageLocator>>,
    ) -> Result<HttpSite> {
        let name = name.into();
        self.landing()?;
        let probe = MarkerProbe::new(&self.markers, self.settle_delay)
            .with_context(|| format!("site {name}"))?;
        let login = self
            .login
            .clone()
            .map(|login| Box::new(login) as Box<dyn Login<HttpSurface>>);

        Ok(SiteAdapter {
            name,
            probe: Box::new(probe),
            source: Box::new(PageSource),
            login,
            session: self.session_file.clone().map(SessionStore::new),
            balances,
        })
    }
}
