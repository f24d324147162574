mod config;
mod show;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use clap::{CommandFactory as _, Parser, Subcommand};
use ledger_crosscheck::{BalanceLedger, Reconciler, Rounding, RunError, RunReport, SessionStore};

use config::{Config, ConfigSite};
use show::Palette;

#[derive(Parser)]
#[command(
    name = "ledger-crosscheck",
    about = "Check balances shown by websites and exchanges against a ledger file"
)]
#[command(disable_help_subcommand = true)]
struct Args {
    /// Config file. Defaults to ledger-crosscheck.toml or .ledger-crosscheck.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile sites against the ledger (default)
    Check {
        /// Sites to check, all configured sites when empty
        sites: Vec<String>,
    },
    /// List configured sites and their balances
    Sites,
    /// Inspect or delete cached sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Run the ledger query for an account and print the parsed balance
    Ledger {
        account: String,
        /// Print one balance per commodity
        #[arg(long)]
        per_commodity: bool,
    },
    /// Parse a number the way values read from sites are parsed
    Normalize {
        #[arg(allow_hyphen_values = true)]
        text: String,
        /// exact, truncate or round:N
        #[arg(long, default_value = "exact")]
        rounding: Rounding,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show age and staleness of the cached session
    Show { site: String },
    /// Delete the cached session, forcing a new login on the next check
    Clear { site: String },
}

/// Runs the CLI and returns the process exit code.
pub async fn run(args: impl IntoIterator<Item = String>) -> Result<u8> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "ledger_crosscheck=info,ledger_crosscheck_sites=info,ledger_crosscheck_cli=info".into()
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    clap_complete::CompleteEnv::with_factory(Args::command).complete();

    let args = Args::parse_from(args);

    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("failed to load .env: {e}"),
    }

    let load = || load_config(args.config.as_deref());
    match args.command.unwrap_or(Commands::Check { sites: Vec::new() }) {
        Commands::Check { sites } => {
            let (base_dir, config) = load()?;
            check(&base_dir, &config, &sites).await
        }
        Commands::Sites => {
            let (_, config) = load()?;
            print!("{}", show::render_sites(&config));
            Ok(0)
        }
        Commands::Session { action } => {
            let (base_dir, config) = load()?;
            session(&base_dir, &config, action)?;
            Ok(0)
        }
        Commands::Ledger {
            account,
            per_commodity,
        } => {
            let (base_dir, config) = load()?;
            let ledger = config.ledger.command(&base_dir);
            if per_commodity {
                for (symbol, amount) in ledger.balances(&account).await? {
                    println!("{amount} {symbol}");
                }
            } else {
                println!("{}", ledger.balance(&account).await?);
            }
            Ok(0)
        }
        Commands::Normalize { text, rounding } => {
            println!("{}", ledger_crosscheck::normalize_with(&text, rounding)?);
            Ok(0)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<(PathBuf, Config)> {
    match path {
        Some(path) => Config::load_from_file(path),
        None => Config::find_and_load()?.context(
            "no ledger-crosscheck.toml or .ledger-crosscheck.toml in the current directory, pass --config",
        ),
    }
}

fn find_site<'a>(config: &'a Config, name: &str) -> Result<&'a ConfigSite> {
    config
        .sites
        .get(name)
        .with_context(|| format!("no site named {name:?} in the config"))
}

async fn check(base_dir: &Path, config: &Config, names: &[String]) -> Result<u8> {
    let selected: Vec<(&str, &ConfigSite)> = if names.is_empty() {
        config
            .sites
            .iter()
            .map(|(name, site)| (name.as_str(), site))
            .collect()
    } else {
        names
            .iter()
            .map(|name| Ok((name.as_str(), find_site(config, name)?)))
            .collect::<Result<_>>()?
    };
    if selected.is_empty() {
        bail!("no sites configured");
    }

    let ledger: Arc<dyn BalanceLedger> = Arc::new(config.ledger.command(base_dir));
    let reconciler = Reconciler::new(config.engine.engine_config(), ledger);

    let mut reports = Vec::with_capacity(selected.len());
    for (name, site) in selected {
        let settings = site.settings(name, base_dir, &config.engine);
        let prepared = settings
            .adapter(name, site.tracked())
            .and_then(|adapter| Ok((adapter, settings.surface()?)));
        let report = match prepared {
            Ok((adapter, surface)) => reconciler.run(&adapter, surface).await,
            Err(error) => {
                tracing::error!(site = name, "cannot set up site: {error:#}");
                RunReport {
                    site: name.to_owned(),
                    started_at: Utc::now(),
                    items: Vec::new(),
                    error: Some(RunError::Surface {
                        stage: "setup",
                        error,
                    }),
                }
            }
        };
        reports.push(report);
    }

    print!("{}", show::render_reports(&reports, &Palette::for_stdout()));
    Ok(reports.iter().map(RunReport::exit_code).max().unwrap_or(0))
}

fn session(base_dir: &Path, config: &Config, action: SessionAction) -> Result<()> {
    let name = match &action {
        SessionAction::Show { site } | SessionAction::Clear { site } => site.clone(),
    };
    let Some(path) = find_site(config, &name)?
        .settings(&name, base_dir, &config.engine)
        .session_file
    else {
        bail!("{name} is a public site and keeps no session");
    };
    let store = SessionStore::new(path);

    match action {
        SessionAction::Show { .. } => match store.load()? {
            None => println!("{name}: no cached session at {}", store.path().display()),
            Some(artifact) => {
                let age = artifact.age_at(Utc::now());
                let max_age = config.engine.engine_config().session_max_age;
                println!(
                    "{name}: {} captured {} ({}h{:02}m ago, {})",
                    store.path().display(),
                    artifact.captured_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    age.num_hours(),
                    age.num_minutes() % 60,
                    if artifact.is_stale(max_age) {
                        "stale"
                    } else {
                        "fresh"
                    },
                );
            }
        },
        SessionAction::Clear { .. } => {
            store.invalidate()?;
            println!("{name}: session cleared");
        }
    }
    Ok(())
}
