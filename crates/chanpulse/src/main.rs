//! `chanpulse` command line.
//!
//! Runs the collection daemon, reports sync status from the metrics store,
//! validates configuration, and seals tenant credentials for the config file.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chanpulse_core::config::MASTER_KEY_ENV;
use chanpulse_core::logging::init_logging;
use chanpulse_core::{ChannelId, Config, ConfigError, SyncTarget, TenantId};
use chanpulse_ingest::credentials::encode_blob;
use chanpulse_ingest::{
    CredentialCipher, CredentialStore, EngineDeps, HttpPlatformConnector, IngestEngine, MemoryCredentialStore,
    MemoryMetricsStore, MetricsStore, NotifierSet, SqliteMetricsStore,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Multi-tenant channel analytics ingestion.
#[derive(Parser, Debug)]
#[command(name = "chanpulse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base64 master key used to open sealed credentials.
    #[arg(long, global = true, env = MASTER_KEY_ENV, hide_env_values = true)]
    master_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run sync cycles until interrupted.
    Run(ConfigArgs),
    /// Print the sync status of a channel or tenant as JSON.
    Status(StatusArgs),
    /// Load and validate the configuration.
    CheckConfig(ConfigArgs),
    /// Seal a tenant credential read from stdin.
    SealCredential(SealArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the TOML configuration.
    #[arg(short, long, default_value = "chanpulse.toml")]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(
        long,
        allow_negative_numbers = true,
        conflicts_with = "tenant",
        required_unless_present = "tenant"
    )]
    channel: Option<ChannelId>,

    #[arg(long)]
    tenant: Option<String>,
}

#[derive(Args, Debug)]
struct SealArgs {
    #[arg(long)]
    tenant: String,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    tenants: usize,
    channels: usize,
    alert_rules: usize,
    store: String,
    platform: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error starting runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let master_key = cli.master_key;
    match cli.command {
        Command::Run(args) => run(&args.config, master_key.as_deref()).await,
        Command::Status(args) => status(&args, master_key.as_deref()).await,
        Command::CheckConfig(args) => check_config(&args.config),
        Command::SealCredential(args) => seal_credential(&args, master_key.as_deref()),
    }
}

fn cipher(master_key: Option<&str>) -> Result<Arc<CredentialCipher>> {
    let encoded = master_key.ok_or_else(|| anyhow!("{MASTER_KEY_ENV} is not set"))?;
    let cipher = CredentialCipher::from_base64(encoded).context("invalid master key")?;
    Ok(Arc::new(cipher))
}

/// Engine over the configured store. The SQLite handle is returned so the
/// caller can drain its writer on exit.
async fn build_engine(
    config: Config,
    master_key: Option<&str>,
) -> Result<(IngestEngine, Option<SqliteMetricsStore>)> {
    let cipher = cipher(master_key)?;
    let (store, credentials, sqlite): (
        Arc<dyn MetricsStore>,
        Arc<dyn CredentialStore>,
        Option<SqliteMetricsStore>,
    ) = match &config.store.path {
        Some(path) => {
            let sqlite = SqliteMetricsStore::open(path)
                .await
                .with_context(|| format!("failed to open metrics store {}", path.display()))?;
            (Arc::new(sqlite.clone()), Arc::new(sqlite.clone()), Some(sqlite))
        }
        None => {
            warn!("no store path configured, metrics are kept in memory");
            (
                Arc::new(MemoryMetricsStore::new()),
                Arc::new(MemoryCredentialStore::new()),
                None,
            )
        }
    };

    let timeout = config.rate_limit.request_timeout();
    let connector = HttpPlatformConnector::new(config.platform.base_url.clone(), timeout)
        .context("failed to build platform client")?;
    let notifiers =
        NotifierSet::from_config(&config.alerts, timeout).context("failed to build notifiers")?;

    let engine = IngestEngine::new(
        config,
        EngineDeps {
            connector: Arc::new(connector),
            store,
            credentials,
            cipher,
            notifiers,
        },
    );
    engine.bootstrap().await.context("failed to register tenants")?;
    Ok((engine, sqlite))
}

async fn run(path: &Path, master_key: Option<&str>) -> Result<()> {
    let config = Config::load(path)?;
    init_logging(&config.logging)?;
    let (engine, sqlite) = build_engine(config, master_key).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    engine.run(shutdown_rx).await;

    if let Some(sqlite) = sqlite {
        sqlite.shutdown().await.context("failed to flush metrics store")?;
    }
    Ok(())
}

async fn status(args: &StatusArgs, master_key: Option<&str>) -> Result<()> {
    let config = Config::load(&args.config.config)?;
    let target = match (&args.tenant, args.channel) {
        (Some(tenant), _) => SyncTarget::Tenant(TenantId::new(tenant.as_str())),
        (None, Some(channel)) => SyncTarget::Channel(channel),
        (None, None) => return Err(anyhow!("either --channel or --tenant is required")),
    };

    let (engine, sqlite) = build_engine(config, master_key).await?;
    let report = engine.get_sync_status(&target).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(sqlite) = sqlite {
        sqlite.shutdown().await?;
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(ConfigError::Invalid(problems)) => {
            for problem in &problems {
                eprintln!("  - {problem}");
            }
            return Err(anyhow!("{} problem(s) in {}", problems.len(), path.display()));
        }
        Err(err) => return Err(err.into()),
    };

    let summary = ConfigSummary {
        tenants: config.tenants.len(),
        channels: config.channels().count(),
        alert_rules: config.alert_rules.len(),
        store: config
            .store
            .path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string()),
        platform: config.platform.base_url.clone(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn seal_credential(args: &SealArgs, master_key: Option<&str>) -> Result<()> {
    let cipher = cipher(master_key)?;
    let mut secret = String::new();
    std::io::stdin()
        .read_to_string(&mut secret)
        .context("failed to read credential from stdin")?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err(anyhow!("empty credential on stdin"));
    }

    let blob = cipher.seal(&TenantId::new(args.tenant.as_str()), secret)?;
    println!("{}", encode_blob(&blob));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn status_takes_a_channel_or_a_tenant() {
        let cli = Cli::try_parse_from(["chanpulse", "status", "--channel", "-1001"]).unwrap();
        let Command::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(args.channel, Some(ChannelId::new(-1001)));
        assert_eq!(args.config.config, PathBuf::from("chanpulse.toml"));

        assert!(Cli::try_parse_from(["chanpulse", "status"]).is_err());
        assert!(
            Cli::try_parse_from(["chanpulse", "status", "--channel", "1", "--tenant", "a"]).is_err()
        );
    }

    #[test]
    fn missing_master_key_is_reported() {
        let err = cipher(None).unwrap_err();
        assert!(err.to_string().contains(MASTER_KEY_ENV));
    }
}
