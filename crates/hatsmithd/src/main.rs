//! hatsmithd: hatsmith streaming download daemon
//!
//! Usage:
//!   hatsmithd [--config hatsmith.toml] [--decrypt] [FILE]...
//!
//! Every FILE is encrypted (or decrypted) in order. Each result is served
//! once, as a streaming download on the configured download path; the next
//! job starts after the previous download finished.

mod bridge;
mod daemon;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hatsmith_transfer::{KeyMaterial, TransferJob};
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hatsmithd", version, about = "hatsmith streaming download daemon")]
struct Cli {
    /// Path to hatsmith.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "HATSMITH_CONFIG",
        default_value = "/etc/hatsmith/config.toml"
    )]
    config: PathBuf,

    /// Listen address, overrides [daemon] listen
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides [daemon] log_level
    #[arg(long, env = "HATSMITH_LOG")]
    log: Option<String>,

    /// Log format, overrides [daemon] log_format
    #[arg(long, env = "HATSMITH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Decrypt the given files instead of encrypting them
    #[arg(long)]
    decrypt: bool,

    /// Password for every job
    #[arg(long, env = "HATSMITH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Own private key (key-pair mode)
    #[arg(long, env = "HATSMITH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Peer public key (key-pair mode)
    #[arg(long, requires = "private_key")]
    public_key: Option<String>,

    /// Files to process, in order
    files: Vec<PathBuf>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = hatsmith_core::config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = match &cli.log_format {
        Some(f) => f.clone(),
        None if config.daemon.log_format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        files = cli.files.len(),
        "hatsmithd starting"
    );

    let jobs = build_jobs(&cli)?;
    let listen = cli.listen.unwrap_or_else(|| config.daemon.listen.clone());
    daemon::run(config, listen, jobs).await
}

fn build_jobs(cli: &Cli) -> Result<Vec<TransferJob>> {
    if cli.files.is_empty() {
        return Ok(Vec::new());
    }
    let key = match (&cli.password, &cli.private_key, &cli.public_key) {
        (Some(_), Some(_), _) => {
            anyhow::bail!("give either --password or --private-key/--public-key, not both")
        }
        (Some(p), None, _) => KeyMaterial::Password(SecretString::from(p.clone())),
        (None, Some(private), Some(public)) => KeyMaterial::KeyPair {
            private_key: SecretString::from(private.clone()),
            public_key: public.clone(),
        },
        (None, Some(_), None) => anyhow::bail!("--private-key needs --public-key"),
        (None, None, _) => {
            anyhow::bail!("no key material: set HATSMITH_PASSWORD or pass --private-key/--public-key")
        }
    };

    Ok(cli
        .files
        .iter()
        .map(|path| {
            if cli.decrypt {
                TransferJob::decrypt(path.clone(), key.clone())
            } else {
                TransferJob::encrypt(path.clone(), key.clone())
            }
        })
        .collect())
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
