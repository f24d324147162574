use anstyle::{AnsiColor, Color, Style};
use ledger_crosscheck::{Decimal, ReconcileItem, ReconciliationResult, RunReport, Shape};

use crate::config::{AuthMode, Config};

pub struct Palette {
    matched: Style,
    mismatched: Style,
    failed: Style,
    heading: Style,
}

impl Palette {
    pub fn colored() -> Self {
        Palette {
            matched: Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))),
            mismatched: Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))),
            failed: Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))),
            heading: Style::new().bold(),
        }
    }

    pub fn plain() -> Self {
        Palette {
            matched: Style::new(),
            mismatched: Style::new(),
            failed: Style::new(),
            heading: Style::new(),
        }
    }

    pub fn for_stdout() -> Self {
        use std::io::IsTerminal as _;

        if std::io::stdout().is_terminal() {
            Palette::colored()
        } else {
            Palette::plain()
        }
    }
}

pub fn render_reports(reports: &[RunReport], palette: &Palette) -> String {
    let Palette {
        matched: ok,
        mismatched: bad,
        failed: warn,
        heading,
    } = palette;

    let mut out = String::new();
    let (mut matched, mut mismatched, mut failed, mut aborted) = (0, 0, 0, 0);

    for report in reports {
        out.push_str(&format!("{heading}━━━ {} ━━━{heading:#}\n", report.site));

        if let Some(error) = &report.error {
            out.push_str(&format!("  {bad}✗{bad:#} {error}\n"));
            aborted += 1;
        }

        for item in &report.items {
            match item {
                ReconcileItem::Compared(result) if result.within_tolerance => {
                    out.push_str(&format!(
                        "  {ok}✓{ok:#} {:<16} {}  {}\n",
                        result.label(),
                        result.actual,
                        result.ledger_account
                    ));
                    matched += 1;
                }
                ReconcileItem::Compared(result) => {
                    out.push_str(&format!(
                        "  {bad}✗{bad:#} {:<16} {}  {}\n",
                        result.label(),
                        mismatch(result),
                        result.ledger_account
                    ));
                    mismatched += 1;
                }
                ReconcileItem::Failed { id, error } => {
                    out.push_str(&format!("  {warn}!{warn:#} {id:<16} {error}\n"));
                    failed += 1;
                }
            }
        }
        out.push('\n');
    }

    out.push_str(&format!("{heading}━━━ Summary ━━━{heading:#}\n"));
    out.push_str(&format!(
        "  {matched} matched, {mismatched} mismatched, {failed} failed\n"
    ));
    if aborted > 0 {
        out.push_str(&format!("  {bad}{aborted}{bad:#} site(s) could not be checked\n"));
    }
    out
}

fn mismatch(result: &ReconciliationResult) -> String {
    let missing = if result.raw.is_none() {
        " (missing on site)"
    } else {
        ""
    };
    format!(
        "site {}{missing}, ledger {}, difference {} (tolerance {})",
        result.actual,
        result.expected,
        signed(result.difference),
        result.tolerance
    )
}

fn signed(value: Decimal) -> String {
    if value.is_sign_positive() && !value.is_zero() {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

pub fn render_sites(config: &Config) -> String {
    let mut out = String::new();
    for (name, site) in &config.sites {
        let auth = match site.auth {
            AuthMode::Session if site.login.is_some() => "form login",
            AuthMode::Session => "manual login",
            AuthMode::None => "public",
        };
        out.push_str(&format!("{name}  {}  ({auth})\n", site.url));
        for balance in &site.balances {
            let mut details = vec![format!("rounding {}", balance.rounding)];
            if !balance.tolerance.is_zero() {
                details.push(format!("tolerance {}", balance.tolerance));
            }
            if balance.shape == Shape::PerCommodity {
                details.push("per commodity".to_owned());
            }
            out.push_str(&format!(
                "  {:<16} {}  [{}]\n",
                balance.id,
                balance.account,
                details.join(", ")
            ));
        }
    }
    out
}
