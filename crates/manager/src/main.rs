//! certsync - Main entry point
//!
//! Reconciles Certbot certificates against desired domain groups, once or
//! on an interval, and doubles as Certbot's deploy hook.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use certsync_common::DomainGroup;
use certsync_config::{CertsyncConfig, LogFormat, SourceConfig, StorageConfig};
use certsync_manager::app::{scheduler_from_config, storage_from_config, Components};
use certsync_manager::deploy::deploy_lineage;
use certsync_manager::{CertbotClient, CertbotSettings};

/// Exit status when a pass completed with per-certificate failures
const EXIT_PASS_FAILURES: u8 = 2;

/// Environment variable carrying the Consul ACL token
const CONSUL_TOKEN_ENV: &str = "CONSUL_HTTP_TOKEN";

/// certsync - keep Certbot certificates in line with desired domain groups
#[derive(Parser, Debug)]
#[command(name = "certsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `certsync_manager=debug` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

/// Command-line overrides for configuration file values
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Contact email registered with Let's Encrypt
    #[arg(long, global = true)]
    contact_email: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long, global = true)]
    letsencrypt_use_staging: bool,

    /// Always-kept domain group, comma separated (repeatable)
    #[arg(long = "additional-domain", value_name = "DOMAINS", global = true)]
    additional_domains: Vec<DomainGroup>,

    /// Consul agent address
    #[arg(long, env = "CONSUL_HTTP_ADDR", global = true)]
    consul_address: Option<String>,

    /// Consul ACL token
    #[arg(long, env = CONSUL_TOKEN_ENV, hide_env_values = true, global = true)]
    consul_token: Option<String>,

    /// KV prefix holding instance documents
    #[arg(long, alias = "consul-ocim-prefix", global = true)]
    consul_instances_prefix: Option<String>,

    /// KV prefix certificates are stored under
    #[arg(long, global = true)]
    consul_certs_prefix: Option<String>,

    /// Webroot served for HTTP-01 challenges
    #[arg(long, global = true)]
    webroot_path: Option<PathBuf>,

    /// Command Certbot runs after each issuance or renewal
    #[arg(long, global = true)]
    deploy_hook: Option<String>,

    /// Maximum number of Certbot operations in flight
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Store certificates in this directory instead of Consul
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Read domain groups from this TOML file instead of Consul
    #[arg(long, global = true)]
    domains_file: Option<PathBuf>,

    /// Write pass metrics to this Prometheus textfile
    #[arg(long, global = true)]
    metrics_textfile: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass, or loop with --interval (default)
    Run {
        /// Seconds between passes; runs a single pass when omitted
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,

        /// Log planned actions without performing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the actions the next pass would take, as JSON
    Plan,
    /// Store a renewed certificate; invoked by Certbot
    DeployHook {
        /// Certbot lineage directory
        #[arg(long, env = "RENEWED_LINEAGE")]
        lineage: PathBuf,
    },
    /// Validate configuration and exit
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("certsync: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&cli, &config);
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Using configuration file");
    }

    let result = match &cli.command {
        None => run(&cli, config, None, false),
        Some(Commands::Run { interval, dry_run }) => run(&cli, config, *interval, *dry_run),
        Some(Commands::Plan) => plan(&cli, config),
        Some(Commands::DeployHook { lineage }) => deploy_hook(config, lineage.clone()),
        Some(Commands::CheckConfig) => check_config(&cli, config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "certsync failed");
            ExitCode::FAILURE
        }
    }
}

/// Read the configuration file (if any) and apply command-line overrides
fn load_config(cli: &Cli) -> Result<CertsyncConfig> {
    let mut config = match &cli.config {
        Some(path) => CertsyncConfig::from_file(path).context("Failed to load configuration file")?,
        None => CertsyncConfig::default(),
    };
    apply_overrides(&mut config, &cli.overrides);
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        };
    }
    Ok(config)
}

fn apply_overrides(config: &mut CertsyncConfig, overrides: &Overrides) {
    if let Some(email) = &overrides.contact_email {
        config.acme.contact_email = email.clone();
    }
    if overrides.letsencrypt_use_staging {
        config.acme.staging = true;
    }
    config
        .reconcile
        .additional_domains
        .extend(overrides.additional_domains.iter().cloned());
    if let Some(address) = &overrides.consul_address {
        config.consul.address = normalise_consul_address(address);
    }
    if let Some(token) = &overrides.consul_token {
        config.consul.token = Some(token.clone());
    }
    if let Some(prefix) = &overrides.consul_instances_prefix {
        config.consul.instances_prefix = prefix.clone();
    }
    if let Some(prefix) = &overrides.consul_certs_prefix {
        config.consul.certs_prefix = prefix.clone();
    }
    if let Some(path) = &overrides.webroot_path {
        config.acme.webroot_path = path.clone();
    }
    if let Some(hook) = &overrides.deploy_hook {
        config.acme.deploy_hook = Some(hook.clone());
    }
    if let Some(max) = overrides.max_concurrency {
        config.reconcile.max_concurrency = max;
    }
    if let Some(path) = &overrides.storage_dir {
        config.storage = StorageConfig::Directory { path: path.clone() };
    }
    if let Some(path) = &overrides.domains_file {
        config.source = SourceConfig::File { path: path.clone() };
    }
    if let Some(path) = &overrides.metrics_textfile {
        config.metrics.textfile = Some(path.clone());
    }
}

/// `CONSUL_HTTP_ADDR` is commonly given without a scheme
fn normalise_consul_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn init_logging(cli: &Cli, config: &CertsyncConfig) {
    // An explicit --log-level beats RUST_LOG, which beats the config file
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .or_else(|| EnvFilter::try_new(&config.logging.level).ok())
    .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_target(false).init(),
    }
}

/// Validate configuration and print a short report
fn check_config(cli: &Cli, config: CertsyncConfig) -> Result<ExitCode> {
    config
        .validate_all()
        .context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - source: {}", config.source.kind());
    info!("  - storage: {}", config.storage.kind());
    if config.uses_consul() {
        info!("  - consul: {}", config.consul.address);
    }
    info!(
        "  - {} always-kept domain group(s)",
        config.reconcile.additional_domains.len()
    );
    if config.acme.staging {
        warn!("Using the Let's Encrypt staging environment");
    }

    println!(
        "certsync: configuration {} test is successful",
        cli.config
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(ExitCode::SUCCESS)
}

/// Build the Certbot client, with the deploy hook pointing back at us
fn certbot_client(cli: &Cli, config: &CertsyncConfig) -> Result<CertbotClient> {
    let hook = match &config.acme.deploy_hook {
        Some(hook) => hook.clone(),
        None => default_deploy_hook(cli, config)?,
    };
    let mut settings = CertbotSettings::from_config(&config.acme, hook);

    // The hook reaches Consul with the token we were given, without it
    // ever appearing on a command line
    if let (StorageConfig::Consul, Some(token)) = (&config.storage, &config.consul.token) {
        settings
            .env
            .push((CONSUL_TOKEN_ENV.to_string(), token.clone()));
    }

    Ok(CertbotClient::new(settings))
}

/// `<this executable> [storage flags] deploy-hook`, quoted for the shell
fn default_deploy_hook(cli: &Cli, config: &CertsyncConfig) -> Result<String> {
    let exe = std::env::current_exe().context("Cannot determine path of the certsync executable")?;

    let mut parts = vec![exe.display().to_string()];
    if let Some(path) = &cli.config {
        parts.push("--config".to_string());
        parts.push(path.display().to_string());
    }
    match &config.storage {
        StorageConfig::Directory { path } => {
            parts.push("--storage-dir".to_string());
            parts.push(path.display().to_string());
        }
        StorageConfig::Consul => {
            parts.push("--consul-address".to_string());
            parts.push(config.consul.address.clone());
            parts.push("--consul-certs-prefix".to_string());
            parts.push(config.consul.certs_prefix.clone());
        }
    }
    parts.push("--log-level".to_string());
    parts.push(config.logging.level.clone());
    parts.push("deploy-hook".to_string());

    Ok(parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" "))
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")
}

/// Run a single pass, or loop until SIGINT/SIGTERM
fn run(cli: &Cli, mut config: CertsyncConfig, interval: Option<u64>, dry_run: bool) -> Result<ExitCode> {
    if dry_run {
        config.reconcile.dry_run = true;
    }
    config
        .validate_all()
        .context("Configuration validation failed")?;

    let components = Components::from_config(&config)?;
    let authority = Arc::new(certbot_client(cli, &config)?);
    let reconciler = components.reconciler(&config, authority);
    let scheduler = scheduler_from_config(&config, reconciler)?;

    let runtime = runtime()?;
    runtime.block_on(async move {
        match interval {
            None => {
                let summary = scheduler
                    .run_once()
                    .await
                    .context("Reconciliation pass aborted")?;
                Ok(if summary.has_failures() {
                    ExitCode::from(EXIT_PASS_FAILURES)
                } else {
                    ExitCode::SUCCESS
                })
            }
            Some(secs) => {
                let scheduler = scheduler.with_interval(Duration::from_secs(secs));
                let (tx, rx) = watch::channel(false);
                tokio::spawn(shutdown_on_signal(tx));
                scheduler.run(rx).await;
                Ok(ExitCode::SUCCESS)
            }
        }
    })
}

/// Print the plan of the next pass without acting on it
fn plan(cli: &Cli, config: CertsyncConfig) -> Result<ExitCode> {
    config
        .validate_all()
        .context("Configuration validation failed")?;

    let components = Components::from_config(&config)?;
    let authority = Arc::new(certbot_client(cli, &config)?);
    let reconciler = components.reconciler(&config, authority);

    let plan = runtime()?
        .block_on(reconciler.plan())
        .context("Cannot compute plan")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&plan).context("Cannot serialize plan")?
    );
    Ok(ExitCode::SUCCESS)
}

/// Certbot deploy hook: store the renewed lineage
fn deploy_hook(config: CertsyncConfig, lineage: PathBuf) -> Result<ExitCode> {
    // Only storage settings matter here; the ACME section may be incomplete
    let storage = storage_from_config(&config)?;
    let name = runtime()?
        .block_on(deploy_lineage(&lineage, storage.as_ref()))
        .with_context(|| format!("Failed to deploy {}", lineage.display()))?;
    info!(cert_name = %name, "Deploy hook finished");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_on_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal, stopping after the current pass");
    let _ = tx.send(true);
}
