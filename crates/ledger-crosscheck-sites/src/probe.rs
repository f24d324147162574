use std::time::Duration;

use anyhow::{Context, Result};
use ledger_crosscheck::AuthProbe;
use regex::Regex;

use crate::http::{HttpSurface, Page};

/// Marker patterns as written in the configuration.
#[derive(Debug, Clone, Default)]
pub struct Markers {
    /// Patterns found only on a logged-in page. A pattern with a capture group
    /// only counts when the group is non-empty, e.g. a rendered account name.
    pub authenticated: Vec<String>,
    /// Patterns found only on a login page or form.
    pub unauthenticated: Vec<String>,
    /// Substrings of the final URL after redirects that mean "logged out".
    pub unauthenticated_urls: Vec<String>,
}

/// Detects login state from the current page of an [`HttpSurface`].
#[derive(Debug)]
pub struct MarkerProbe {
    authenticated: Vec<Regex>,
    unauthenticated: Vec<Regex>,
    unauthenticated_urls: Vec<String>,
    settle_delay: Duration,
}

impl MarkerProbe {
    pub fn new(markers: &Markers, settle_delay: Duration) -> Result<Self> {
        Ok(MarkerProbe {
            authenticated: compile(&markers.authenticated)?,
            unauthenticated: compile(&markers.unauthenticated)?,
            unauthenticated_urls: markers.unauthenticated_urls.clone(),
            settle_delay,
        })
    }

    fn logged_in(&self, page: &Page) -> bool {
        page.status.is_success()
            && self
                .authenticated
                .iter()
                .any(|marker| marker_present(marker, &page.body))
    }

    fn logged_out(&self, page: &Page) -> bool {
        let status = page.status.as_u16();
        status == 401
            || status == 403
            || self
                .unauthenticated_urls
                .iter()
                .any(|fragment| page.url.as_str().contains(fragment.as_str()))
            || self
                .unauthenticated
                .iter()
                .any(|marker| marker.is_match(&page.body))
    }
}

#[async_trait::async_trait]
impl AuthProbe<HttpSurface> for MarkerProbe {
    async fn authenticated(&self, surface: &mut HttpSurface) -> Result<bool> {
        Ok(surface.page().is_some_and(|page| self.logged_in(page)))
    }

    async fn unauthenticated(&self, surface: &mut HttpSurface) -> Result<bool> {
        Ok(surface.page().is_some_and(|page| self.logged_out(page)))
    }

    fn settle_delay(&self) -> Duration {
        self.settle_delay
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("invalid marker {pattern:?}")))
        .collect()
}

fn marker_present(marker: &Regex, body: &str) -> bool {
    if marker.captures_len() == 1 {
        return marker.is_match(body);
    }
    marker.captures_iter(body).any(|captures| {
        captures
            .get(1)
            .is_some_and(|group| !group.as_str().trim().is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> Regex {
        Regex::new(s).unwrap()
    }

    #[test]
    fn plain_marker_matches_anywhere() {
        assert!(marker_present(&pattern("Sign out"), "<a>Sign out</a>"));
        assert!(!marker_present(&pattern("Sign out"), "<a>Sign in</a>"));
    }

    #[test]
    fn empty_capture_is_not_evidence() {
        let marker = pattern(r#"<span class="user-name">([^<]*)</span>"#);
        assert!(!marker_present(&marker, r#"<span class="user-name"> </span>"#));
        assert!(marker_present(&marker, r#"<span class="user-name">Alice</span>"#));
    }

    #[test]
    fn invalid_marker_is_reported() {
        let markers = Markers {
            authenticated: vec!["(unclosed".to_owned()],
            ..Markers::default()
        };
        let error = MarkerProbe::new(&markers, Duration::ZERO).unwrap_err();
        assert!(error.to_string().contains("(unclosed"), "{error}");
    }
}
