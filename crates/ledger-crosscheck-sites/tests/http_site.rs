use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use ledger_crosscheck::{
    AuthProbe, BalanceLedger, Decimal, EngineConfig, LedgerError, Login, Polling, ReconcileItem,
    Reconciler, Rounding, Shape, Surface, TrackedBalance,
};
use ledger_crosscheck_sites::{
    Credential, FormLogin, HttpSurface, Markers, PageLocator, SiteSettings, Target,
};
use serde_json::json;

fn settings(server: &MockServer, path: &str) -> SiteSettings {
    SiteSettings {
        url: server.url(path),
        login_url: None,
        session_file: None,
        cookie_import: None,
        request_timeout: Duration::from_secs(5),
        settle_delay: Duration::from_millis(10),
        markers: Markers {
            authenticated: vec![r#"<span class="user">([^<]*)</span>"#.to_owned()],
            unauthenticated: vec!["<form".to_owned()],
            unauthenticated_urls: vec!["/login".to_owned()],
        },
        login: None,
    }
}

fn probe_for(settings: &SiteSettings) -> Box<dyn AuthProbe<HttpSurface>> {
    settings.adapter("shop", Vec::new()).unwrap().probe
}

#[tokio::test]
async fn cookies_from_redirects_are_kept() {
    let server = MockServer::start_async().await;
    let callback = server
        .mock_async(|when, then| {
            when.method(GET).path("/callback");
            then.status(302)
                .header("set-cookie", "sid=abc; Path=/; HttpOnly")
                .header("location", "/account");
        })
        .await;
    let account = server
        .mock_async(|when, then| {
            when.method(GET).path("/account").header("cookie", "sid=abc");
            then.status(200)
                .body(r#"<span class="user">Alice</span><div class="balance">1 234,56 ₽</div>"#);
        })
        .await;

    let settings = settings(&server, "/callback");
    let probe = probe_for(&settings);
    let mut surface = settings.surface().unwrap();
    surface.navigate().await.unwrap();

    callback.assert_async().await;
    account.assert_async().await;
    assert_eq!(surface.page().unwrap().url.path(), "/account");
    assert!(probe.authenticated(&mut surface).await.unwrap());
    assert!(!probe.unauthenticated(&mut surface).await.unwrap());
    assert_eq!(
        surface.export().await.unwrap(),
        json!({"cookies": {"sid": "abc"}})
    );
}

#[tokio::test]
async fn redirect_to_login_is_logged_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(302).header("location", "/login?next=%2F");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/login");
            then.status(200).body(r#"<span class="user"></span>"#);
        })
        .await;

    let settings = settings(&server, "/");
    let probe = probe_for(&settings);
    let mut surface = settings.surface().unwrap();
    surface.navigate().await.unwrap();

    assert!(!probe.authenticated(&mut surface).await.unwrap());
    assert!(probe.unauthenticated(&mut surface).await.unwrap());
}

#[tokio::test]
async fn restored_cookies_are_sent() {
    let server = MockServer::start_async().await;
    let account = server
        .mock_async(|when, then| {
            when.method(GET).path("/").header("cookie", "sid=cached");
            then.status(200).body(r#"<span class="user">Alice</span>"#);
        })
        .await;

    let settings = settings(&server, "/");
    let mut surface = settings.surface().unwrap();
    surface
        .restore(&json!({"cookies": {"sid": "cached"}}))
        .await
        .unwrap();
    surface.navigate().await.unwrap();

    account.assert_async().await;
    assert!(surface.page().unwrap().status.is_success());
}

#[tokio::test]
async fn form_login_posts_resolved_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let secret = dir.path().join("password");
    std::fs::write(&secret, "hunter2\n").unwrap();

    let server = MockServer::start_async().await;
    let form = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/session")
                .x_www_form_urlencoded_tuple("user", "alice")
                .x_www_form_urlencoded_tuple("password", "hunter2");
            then.status(303)
                .header("set-cookie", "sid=s1; Path=/")
                .header("location", "/");
        })
        .await;
    let home = server
        .mock_async(|when, then| {
            when.method(GET).path("/").header("cookie", "sid=s1");
            then.status(200).body(r#"<span class="user">alice</span>"#);
        })
        .await;

    let mut settings = settings(&server, "/");
    settings.login = Some(FormLogin {
        url: "/session".to_owned(),
        fields: vec![
            ("user".to_owned(), Credential::Literal("alice".to_owned())),
            ("password".to_owned(), Credential::File(secret)),
        ],
    });
    let adapter = settings.adapter("shop", Vec::new()).unwrap();
    let login = adapter.login.as_ref().unwrap();
    let mut surface = settings.surface().unwrap();

    login.log_in(&mut surface).await.unwrap();

    form.assert_async().await;
    // once after the redirect, once when reloading the landing page
    home.assert_hits_async(2).await;
    assert!(adapter.probe.authenticated(&mut surface).await.unwrap());
}

#[tokio::test]
async fn imported_cookies_are_picked_up_on_observe() {
    let dir = tempfile::tempdir().unwrap();
    let import = dir.path().join("shop.cookies");

    let server = MockServer::start_async().await;
    let account = server
        .mock_async(|when, then| {
            when.method(GET).path("/account").header("cookie", "sid=manual");
            then.status(200).body(r#"<span class="user">Alice</span>"#);
        })
        .await;

    let mut settings = settings(&server, "/account");
    settings.cookie_import = Some(import.clone());
    let probe = probe_for(&settings);
    let mut surface = settings.surface().unwrap();

    surface.navigate().await.unwrap();
    assert!(!probe.authenticated(&mut surface).await.unwrap());
    assert!(surface.manual_login_hint().contains("shop.cookies"));

    std::fs::write(&import, "Cookie: sid=manual\n").unwrap();
    surface.observe().await.unwrap();

    account.assert_async().await;
    assert!(probe.authenticated(&mut surface).await.unwrap());
}

#[tokio::test]
async fn oversized_cookie_rejection_is_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(400)
                .body("<html><center><h1>400 Bad Request</h1></center><center>Request Header Or Cookie Too Large</center></html>");
        })
        .await;

    let mut surface = settings(&server, "/").surface().unwrap();
    let error = surface.navigate().await.unwrap_err();

    assert!(error.to_string().contains("Cookie Too Large"), "{error}");
}

struct FixedLedger(BTreeMap<String, Decimal>);

#[async_trait::async_trait]
impl BalanceLedger for FixedLedger {
    async fn balance(&self, _account: &str) -> Result<Decimal, LedgerError> {
        Ok("1234.56".parse().unwrap())
    }

    async fn balances(&self, _account: &str) -> Result<BTreeMap<String, Decimal>, LedgerError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn public_json_api_reconciles() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("ok");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/card");
            then.status(200)
                .json_body(json!({"data": {"balance": "1 234,56"}}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/wallet");
            then.status(200).json_body(json!({
                "balances": [
                    {"asset": "BTC", "free": "0.5"},
                    {"asset": "ETH", "free": 10}
                ]
            }));
        })
        .await;

    let balances = vec![
        TrackedBalance {
            id: "card".to_owned(),
            ledger_account: "Assets:Card".to_owned(),
            locator: PageLocator {
                page: Some("/api/card".to_owned()),
                target: Target::JsonPointer("/data/balance".to_owned()),
            },
            tolerance: Decimal::ZERO,
            rounding: Rounding::Exact,
            shape: Shape::Single,
        },
        TrackedBalance {
            id: "wallet".to_owned(),
            ledger_account: "Assets:Wallet".to_owned(),
            locator: PageLocator {
                page: Some("/api/wallet".to_owned()),
                target: Target::JsonAssets {
                    list: "/balances".to_owned(),
                    symbol: "/asset".to_owned(),
                    value: "/free".to_owned(),
                },
            },
            tolerance: "0.0001".parse().unwrap(),
            rounding: Rounding::Round(4),
            shape: Shape::PerCommodity,
        },
    ];
    let settings = settings(&server, "/");
    let site = settings.adapter("public", balances).unwrap();
    let ledger = FixedLedger(BTreeMap::from([
        ("BTC".to_owned(), "0.50001".parse().unwrap()),
        ("ETH".to_owned(), "10".parse().unwrap()),
    ]));
    let config = EngineConfig {
        extraction: Polling {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(100),
        },
        ..EngineConfig::default()
    };

    let report = Reconciler::new(config, Arc::new(ledger))
        .run(&site, settings.surface().unwrap())
        .await;

    assert_eq!(report.exit_code(), 0, "{report:?}");
    let labels: Vec<String> = report
        .items
        .iter()
        .map(|item| match item {
            ReconcileItem::Compared(result) => result.label(),
            ReconcileItem::Failed { id, error } => panic!("{id}: {error}"),
        })
        .collect();
    assert_eq!(labels, ["card", "wallet:BTC", "wallet:ETH"]);
}
