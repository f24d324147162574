use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use ledger_crosscheck::{Login, Surface};

use crate::http::HttpSurface;

/// Where a form field's value comes from. Values are resolved at login time and
/// never logged.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// `env:NAME`, an environment variable (possibly loaded from `.env`).
    Env(String),
    /// `file:PATH`, the trimmed contents of a file.
    File(PathBuf),
    Literal(String),
}

impl Credential {
    pub fn resolve(&self) -> Result<String> {
        match self {
            Credential::Env(name) => std::env::var(name)
                .with_context(|| format!("environment variable {name} is not set")),
            Credential::File(path) => std::fs::read_to_string(path)
                .map(|contents| contents.trim().to_owned())
                .with_context(|| format!("failed to read secret from {}", path.display())),
            Credential::Literal(value) => Ok(value.clone()),
        }
    }
}

impl FromStr for Credential {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if let Some(name) = s.strip_prefix("env:") {
            Credential::Env(name.to_owned())
        } else if let Some(path) = s.strip_prefix("file:") {
            Credential::File(PathBuf::from(path))
        } else {
            Credential::Literal(s.to_owned())
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Env(name) => write!(f, "env:{name}"),
            Credential::File(path) => write!(f, "file:{}", path.display()),
            Credential::Literal(_) => f.write_str("<literal>"),
        }
    }
}

/// Logs in by posting a URL-encoded form, then reloads the landing page so the
/// probe sees the logged-in view.
#[derive(Debug, Clone)]
pub struct FormLogin {
    /// Form action, relative to the site URL.
    pub url: String,
    pub fields: Vec<(String, Credential)>,
}

#[async_trait::async_trait]
impl Login<HttpSurface> for FormLogin {
    async fn log_in(&self, surface: &mut HttpSurface) -> Result<()> {
        let fields = self
            .fields
            .iter()
            .map(|(name, credential)| -> Result<(String, String)> {
                let value = credential
                    .resolve()
                    .with_context(|| format!("no value for login field {name}"))?;
                Ok((name.clone(), value))
            })
            .collect::<Result<Vec<_>>>()?;

        let url = surface.resolve(&self.url)?;
        tracing::info!(%url, fields = fields.len(), "submitting login form");
        let page = surface.submit_form(url, &fields).await?;
        if page.status.is_client_error() || page.status.is_server_error() {
            bail!("login form answered {}", page.status);
        }
        surface.navigate().await
    }
}
