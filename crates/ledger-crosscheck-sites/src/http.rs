//! A [`Surface`] over plain HTTP.
//!
//! Redirects are followed by hand so that cookies set on intermediate hops (login
//! redirects typically set the session cookie on a 302) end up in the jar.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use ledger_crosscheck::Surface;
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Method, StatusCode, Url};

use crate::cookies::{CookieJar, HEADER_WARN_BYTES};

const MAX_REDIRECTS: usize = 10;
const USER_AGENT: &str = concat!("ledger-crosscheck/", env!("CARGO_PKG_VERSION"));
const COOKIE_TOO_LARGE: &str = "Request Header Or Cookie Too Large";

/// The last page fetched, after redirects.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub landing: Url,
    /// Where a human logs in. Only used in the manual login hint.
    pub login_page: Option<Url>,
    /// File the human drops browser cookies into after logging in manually.
    pub cookie_import: Option<PathBuf>,
    pub request_timeout: Duration,
}

#[derive(Debug)]
pub struct HttpSurface {
    client: reqwest::Client,
    options: HttpOptions,
    jar: CookieJar,
    page: Option<Page>,
    import_seen: Option<SystemTime>,
}

impl HttpSurface {
    pub fn new(options: HttpOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(options.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpSurface {
            client,
            options,
            jar: CookieJar::default(),
            page: None,
            import_seen: None,
        })
    }

    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    pub fn landing(&self) -> &Url {
        &self.options.landing
    }

    /// Resolve `target` against the landing page, so configs can use relative paths.
    pub fn resolve(&self, target: &str) -> Result<Url> {
        self.options
            .landing
            .join(target)
            .with_context(|| format!("invalid URL {target:?}"))
    }

    /// Load `url` and make it the current page.
    pub async fn open(&mut self, url: Url) -> Result<&Page> {
        let page = self.request(Method::GET, url, None).await?;
        Ok(self.page.insert(page))
    }

    /// Submit a URL-encoded form and make the final page of the redirect chain the
    /// current page.
    pub async fn submit_form(&mut self, url: Url, fields: &[(String, String)]) -> Result<&Page> {
        let page = self.request(Method::POST, url, Some(fields)).await?;
        Ok(self.page.insert(page))
    }

    async fn request(
        &mut self,
        method: Method,
        url: Url,
        form: Option<&[(String, String)]>,
    ) -> Result<Page> {
        let mut method = method;
        let mut form = form;
        let mut url = url;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(header) = self.jar.header() {
                if header.len() > HEADER_WARN_BYTES {
                    tracing::warn!(
                        bytes = header.len(),
                        cookies = self.jar.len(),
                        "cookie header is getting large, consider clearing the session"
                    );
                }
                request = request.header(COOKIE, header);
            }
            if let Some(fields) = form {
                request = request.form(fields);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("{method} {url} failed"))?;
            let status = response.status();
            for value in response.headers().get_all(SET_COOKIE) {
                match value.to_str() {
                    Ok(value) => self.jar.apply_set_cookie(value),
                    Err(_) => tracing::debug!(%url, "ignoring non-ASCII Set-Cookie header"),
                }
            }
            tracing::debug!(%method, %url, status = status.as_u16(), "fetched");

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|location| location.to_str().ok())
                    .with_context(|| format!("redirect from {url} without a location"))?;
                url = url
                    .join(location)
                    .with_context(|| format!("invalid redirect location {location:?}"))?;
                // 307 and 308 repeat the request as is, everything else turns into a GET
                if status != StatusCode::TEMPORARY_REDIRECT
                    && status != StatusCode::PERMANENT_REDIRECT
                {
                    method = Method::GET;
                    form = None;
                }
                continue;
            }

            let body = response
                .text()
                .await
                .with_context(|| format!("failed to read body of {url}"))?;
            if body.contains(COOKIE_TOO_LARGE) {
                bail!(
                    "{url} rejected the request: {COOKIE_TOO_LARGE} ({} cookies held), clear the session",
                    self.jar.len()
                );
            }
            return Ok(Page { url, status, body });
        }

        bail!("more than {MAX_REDIRECTS} redirects, last location {url}")
    }

    /// Merge cookies from the import file if it changed since it was last read.
    async fn import_cookies(&mut self) -> Result<()> {
        let Some(path) = &self.options.cookie_import else {
            return Ok(());
        };
        let modified = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", path.display()));
            }
        };
        if modified.is_some() && modified == self.import_seen {
            return Ok(());
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.import_seen = modified;
        if text.trim().is_empty() {
            return Ok(());
        }
        let imported = CookieJar::parse_import(&text)
            .with_context(|| format!("failed to parse cookies from {}", path.display()))?;
        tracing::info!(path = %path.display(), cookies = imported.len(), "imported cookies");
        self.jar.extend(imported);
        Ok(())
    }

    async fn mark_import_seen(&mut self) {
        if let Some(path) = &self.options.cookie_import {
            self.import_seen = tokio::fs::metadata(path)
                .await
                .ok()
                .and_then(|metadata| metadata.modified().ok());
        }
    }
}

#[async_trait::async_trait]
impl Surface for HttpSurface {
    async fn restore(&mut self, payload: &serde_json::Value) -> Result<()> {
        self.jar = CookieJar::from_json(payload)?;
        tracing::debug!(cookies = self.jar.len(), "restored cookies");
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.jar.clear();
        self.page = None;
        // cookies already in the import file belong to the session being discarded
        self.mark_import_seen().await;
        Ok(())
    }

    async fn navigate(&mut self) -> Result<()> {
        self.import_cookies().await?;
        let landing = self.options.landing.clone();
        self.open(landing).await?;
        Ok(())
    }

    async fn observe(&mut self) -> Result<()> {
        self.import_cookies().await?;
        let url = match &self.page {
            Some(page) => page.url.clone(),
            None => self.options.landing.clone(),
        };
        self.open(url).await?;
        Ok(())
    }

    async fn export(&self) -> Result<serde_json::Value> {
        Ok(self.jar.to_json())
    }

    fn manual_login_hint(&self) -> String {
        let login = self
            .options
            .login_page
            .as_ref()
            .unwrap_or(&self.options.landing);
        match &self.options.cookie_import {
            Some(path) => format!(
                "log in at {login} in a browser, then save the Cookie header of a logged-in request to {}",
                path.display()
            ),
            None => format!(
                "log in at {login}; no cookie_import file is configured for this site, so the login cannot be picked up"
            ),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.page = None;
        Ok(())
    }
}
