//! CLI entry point. Parses arguments, resolves the provider's remote URL
//! and token from the environment, wires a [`Dispatcher`], and dispatches
//! to the matching verb.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use gitops_promotion_core::{load_configuration, Dispatcher};
use gitops_promotion_git::Repository;
use gitops_promotion_provider::{new_provider, ProviderKind};
use gitops_promotion_retry::CancelFlag;
use gitops_promotion_types::Error;

#[derive(Parser, Debug)]
#[command(name = "gitops-promotion", version)]
#[command(about = "Advances container image tags through an ordered environment chain via pull requests.")]
struct Cli {
    /// Access token for the selected provider; falls back to AZDO_PAT or GITHUB_TOKEN.
    #[arg(long)]
    token: Option<String>,

    /// Hosted-git platform to talk to.
    #[arg(long, value_enum)]
    provider: Provider,

    /// Local working tree to operate on.
    #[arg(long, default_value = ".")]
    sourcedir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Provider {
    Azdo,
    Github,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a new promotion pull request at the first environment.
    New {
        #[arg(long)]
        group: String,
        #[arg(long)]
        app: String,
        #[arg(long)]
        tag: String,
    },
    /// Advance the promotion that produced HEAD to its next environment.
    Promote,
    /// Gate a promotion pull request's merge on the previous environment's status.
    Status,
    /// Fork a temporary review deployment of an application at a given tag.
    Feature {
        #[arg(long)]
        group: String,
        #[arg(long)]
        app: String,
        #[arg(long)]
        tag: String,
        #[arg(long)]
        feature: String,
    },
    /// Remove feature deployments whose manifests have been untouched for longer than `--max-age`.
    FeatureDeleteStale {
        #[arg(long)]
        max_age: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let cancel = CancelFlag::new();
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_cancel.cancel()) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }

    match try_main(cli, cancel) {
        Ok(message) => println!("{message}"),
        Err(err) => {
            eprintln!("Application failed with error: {err}");
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn try_main(cli: Cli, cancel: CancelFlag) -> Result<String> {
    let (kind, remote_url, env_token) = resolve_provider(cli.provider)?;
    let token = cli
        .token
        .clone()
        .or(env_token)
        .ok_or_else(|| Error::InvalidConfig(
            "no access token supplied via --token or the provider's environment variable".to_string(),
        ))
        .context("resolving provider credentials")?;

    let config = load_configuration(&cli.sourcedir).context("loading gitops-promotion.yaml")?;
    let repo = Repository::open(&cli.sourcedir);
    let provider = new_provider(kind, &remote_url, &token, cancel.clone())
        .context("constructing provider client")?;
    let dispatcher = Dispatcher::new(config, repo, provider, cancel);

    let message = match cli.cmd {
        Commands::New { group, app, tag } => dispatcher.promote_new(&group, &app, &tag)?,
        Commands::Promote => dispatcher.promote()?,
        Commands::Status => dispatcher.status()?,
        Commands::Feature { group, app, tag, feature } => {
            dispatcher.feature_new(&group, &app, &tag, &feature)?
        }
        Commands::FeatureDeleteStale { max_age } => {
            let max_age = parse_duration(&max_age)?;
            dispatcher.feature_delete_stale(max_age)?
        }
    };
    Ok(message)
}

/// Derives the remote URL and environment-supplied token fallback for the
/// selected provider, per the `AZDO_URL`/`AZDO_PAT` and
/// `GITHUB_URL`/`GITHUB_TOKEN` convention: the URL has no CLI flag
/// equivalent and always comes from the environment, while the token may
/// be overridden by `--token`.
fn resolve_provider(provider: Provider) -> Result<(ProviderKind, String, Option<String>)> {
    let (kind, url_var, token_var) = match provider {
        Provider::Azdo => (ProviderKind::Azdo, "AZDO_URL", "AZDO_PAT"),
        Provider::Github => (ProviderKind::Github, "GITHUB_URL", "GITHUB_TOKEN"),
    };
    let remote_url = std::env::var(url_var)
        .with_context(|| format!("{url_var} must be set for --provider {provider:?}"))?;
    let env_token = std::env::var(token_var).ok();
    Ok((kind, remote_url, env_token))
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| Error::InvalidConfig(format!("invalid duration {s:?}: {e}")))
        .context("parsing --max-age")
}
