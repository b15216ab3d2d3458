//! hatsmith: file encryption CLI
//!
//! Commands:
//!   encrypt <file>...     - encrypt files with a password or a key pair
//!   decrypt <file>...     - decrypt .enc files
//!   check <file>          - container kind, size and digests of a file
//!   keygen                - new X25519 key pair
//!   pubkey                - public key of a private key
//!   genpass               - random password or passphrase
//!   config show           - display current configuration
//!
//! encrypt/decrypt run the same coordinator pipeline the daemon serves over
//! HTTP; here the download consumer is a file writer.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hatsmith_core::config::HatsmithConfig;
use hatsmith_crypto::container::{self, ContainerKind, LEGACY_SIGNATURE_SIZE};
use hatsmith_crypto::passwords::PASSPHRASE_WORDS;
use hatsmith_crypto::{compute_public_key, generate_passphrase, generate_password, KeyPair, Provider};
use hatsmith_transfer::sink::save_downloads;
use hatsmith_transfer::{
    spawn_coordinator, CoordinatorConfig, JobOutcome, JobQueue, KeyMaterial, ProgressFn,
    QueueOptions, TransferJob,
};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "hatsmith",
    version,
    about = "hatsmith file encryption",
    long_about = "hatsmith: encrypt and decrypt files with a password or an X25519 key pair"
)]
struct Cli {
    /// Path to hatsmith.toml configuration file
    #[arg(long, short = 'c', env = "HATSMITH_CONFIG", default_value = "/etc/hatsmith/config.toml")]
    config: PathBuf,

    /// Log filter for diagnostics on stderr
    #[arg(long, env = "HATSMITH_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt files; each FILE becomes FILE.enc in the output directory
    Encrypt {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Output directory
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Decrypt files produced by `hatsmith encrypt`
    Decrypt {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Output directory
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Show the container kind, size and SHA-256 / BLAKE3 digests of a file
    Check {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Generate a key pair
    Keygen {
        #[arg(long)]
        json: bool,
    },

    /// Print the public key belonging to a private key
    Pubkey {
        /// Private key (prompted for when absent)
        #[arg(long, env = "HATSMITH_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },

    /// Generate a random password, or a passphrase with --passphrase
    Genpass {
        #[arg(long)]
        passphrase: bool,
        /// Words in the passphrase
        #[arg(long, default_value_t = PASSPHRASE_WORDS)]
        words: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// Password (prompted for when neither a password nor a key pair is given)
    #[arg(long, env = "HATSMITH_PASSWORD", hide_env_values = true, conflicts_with = "private_key")]
    password: Option<String>,

    /// Own private key
    #[arg(long, env = "HATSMITH_PRIVATE_KEY", hide_env_values = true, requires = "public_key")]
    private_key: Option<String>,

    /// The other party's public key
    #[arg(long, requires = "private_key")]
    public_key: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);
    let config = hatsmith_core::config::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Encrypt { files, out, key } => {
            let key = key_material(key, true, config.crypto.min_password_len)?;
            let jobs = files
                .into_iter()
                .map(|f| TransferJob::encrypt(f, key.clone()))
                .collect();
            cmd_transfer(&config, jobs, &out, "encrypt").await
        }
        Commands::Decrypt { files, out, key } => {
            let key = key_material(key, false, config.crypto.min_password_len)?;
            let jobs = files
                .into_iter()
                .map(|f| TransferJob::decrypt(f, key.clone()))
                .collect();
            cmd_transfer(&config, jobs, &out, "decrypt").await
        }
        Commands::Check { file, json } => cmd_check(&file, json),
        Commands::Keygen { json } => cmd_keygen(json),
        Commands::Pubkey { private_key } => cmd_pubkey(private_key),
        Commands::Genpass { passphrase, words } => cmd_genpass(passphrase, words),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Key material ──────────────────────────────────────────────────────────────

fn key_material(args: KeyArgs, encrypting: bool, min_len: usize) -> Result<KeyMaterial> {
    if let (Some(private_key), Some(public_key)) = (args.private_key, args.public_key) {
        return Ok(KeyMaterial::KeyPair {
            private_key: SecretString::from(private_key),
            public_key,
        });
    }

    let password = match args.password {
        Some(p) => p,
        None => {
            let p = rpassword::prompt_password("Password: ").context("reading password")?;
            if encrypting {
                let again =
                    rpassword::prompt_password("Repeat password: ").context("reading password")?;
                if p != again {
                    anyhow::bail!("passwords do not match");
                }
            }
            p
        }
    };
    if encrypting {
        check_password_length(&password, min_len)?;
    }
    Ok(KeyMaterial::Password(SecretString::from(password)))
}

fn check_password_length(password: &str, min_len: usize) -> Result<()> {
    let len = password.chars().count();
    if len < min_len {
        anyhow::bail!(
            "password must be at least {min_len} characters (got {len}); `hatsmith genpass` makes one"
        );
    }
    Ok(())
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── `hatsmith encrypt` / `hatsmith decrypt` ───────────────────────────────────

async fn cmd_transfer(
    config: &HatsmithConfig,
    jobs: Vec<TransferJob>,
    out: &Path,
    label: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating output directory: {}", out.display()))?;

    let provider = Provider::new();
    let self_test = provider.clone();
    tokio::task::spawn_blocking(move || self_test.initialize())
        .await
        .context("provider self-test task")?
        .context("crypto provider self-test")?;

    let cancel = CancellationToken::new();
    let (handle, hub, coordinator) = spawn_coordinator(
        &CoordinatorConfig::from_config(config),
        provider,
        cancel.clone(),
    );
    let total = jobs.len();
    let sink = tokio::spawn(save_downloads(hub, out.to_path_buf(), total));

    let pb = make_progress_bar(0, label);
    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done: u64, total: u64, msg: &str| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
        pb_clone.set_message(msg.to_string());
    });

    let mut queue = JobQueue::new(handle, QueueOptions::from_config(config)).with_progress(progress);
    for job in jobs {
        queue.push(job);
    }
    let reports = queue.run().await;
    pb.finish_and_clear();

    let all_finished = reports
        .iter()
        .all(|r| matches!(r.outcome, JobOutcome::Finished { .. }));
    let saved = if all_finished {
        sink.await.context("output writer task")?
    } else {
        sink.abort();
        let _ = sink.await;
        for report in &reports {
            if matches!(report.outcome, JobOutcome::Failed(_)) {
                let partial = out.join(format!(".{}.part", report.output_name));
                let _ = tokio::fs::remove_file(partial).await;
            }
        }
        Vec::new()
    };
    cancel.cancel();
    let _ = coordinator.await;

    let mut failed = 0usize;
    for report in &reports {
        match &report.outcome {
            JobOutcome::Finished {
                bytes_out, chunks, ..
            } => println!(
                "  {} → {} ({}, {} chunks)",
                report.source.display(),
                out.join(&report.output_name).display(),
                fmt_bytes(*bytes_out),
                chunks
            ),
            JobOutcome::Failed(e) => {
                failed += 1;
                println!("  {}: {e}", report.source.display());
            }
            JobOutcome::Skipped => {
                failed += 1;
                println!("  {}: skipped", report.source.display());
            }
        }
    }
    for result in saved {
        result.context("writing output file")?;
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {total} file(s) not {label}ed");
    }
    Ok(())
}

// ── `hatsmith check` ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Fingerprint {
    kind: ContainerKind,
    size: u64,
    sha256: String,
    blake3: String,
}

fn fingerprint(path: &Path) -> Result<Fingerprint> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut sha = Sha256::new();
    let mut b3 = blake3::Hasher::new();
    let mut prefix = Vec::with_capacity(LEGACY_SIGNATURE_SIZE);
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        if prefix.len() < LEGACY_SIGNATURE_SIZE {
            let take = (LEGACY_SIGNATURE_SIZE - prefix.len()).min(n);
            prefix.extend_from_slice(&buf[..take]);
        }
        sha.update(&buf[..n]);
        b3.update(&buf[..n]);
        size += n as u64;
    }

    Ok(Fingerprint {
        kind: container::detect_prefix(&prefix),
        size,
        sha256: format!("{:x}", sha.finalize()),
        blake3: b3.finalize().to_hex().to_string(),
    })
}

fn cmd_check(path: &Path, json: bool) -> Result<()> {
    let fp = fingerprint(path)?;
    if json {
        let value = serde_json::json!({
            "file": path.display().to_string(),
            "kind": fp.kind.to_string(),
            "size": fp.size,
            "sha256": fp.sha256,
            "blake3": fp.blake3,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", path.display());
    println!("  kind:    {}", fp.kind);
    println!("  size:    {} ({} bytes)", fmt_bytes(fp.size), fp.size);
    println!("  sha256:  {}", fp.sha256);
    println!("  blake3:  {}", fp.blake3);
    match fp.kind {
        ContainerKind::Legacy => println!("  note:    legacy format, upgrade required to decrypt"),
        ContainerKind::Unrecognized => println!("  note:    not a hatsmith container"),
        _ => {}
    }
    Ok(())
}

// ── `hatsmith keygen` / `pubkey` / `genpass` ──────────────────────────────────

fn cmd_keygen(json: bool) -> Result<()> {
    let pair = KeyPair::generate();
    let private_key = pair.private_key();
    if json {
        let value = serde_json::json!({
            "public_key": pair.public_key(),
            "private_key": private_key.expose_secret(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("public key:  {}", pair.public_key());
        println!("private key: {}", private_key.expose_secret());
        eprintln!("Share the public key. Keep the private key secret.");
    }
    Ok(())
}

fn cmd_pubkey(private_key: Option<String>) -> Result<()> {
    let private_key = match private_key {
        Some(k) => k,
        None => rpassword::prompt_password("Private key: ").context("reading private key")?,
    };
    let public_key = compute_public_key(&SecretString::from(private_key.trim().to_string()))
        .context("deriving public key")?;
    println!("{public_key}");
    Ok(())
}

fn cmd_genpass(passphrase: bool, words: usize) -> Result<()> {
    let secret = if passphrase {
        if words == 0 {
            anyhow::bail!("--words must be at least 1");
        }
        generate_passphrase(words)
    } else {
        generate_password()
    };
    println!("{}", secret.expose_secret());
    Ok(())
}

// ── `hatsmith config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &HatsmithConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatsmith_crypto::container::ContainerWriter;
    use hatsmith_crypto::SessionKey;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(12), "12 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_password_length() {
        assert!(check_password_length("short", 12).is_err());
        assert!(check_password_length("twelve chars", 12).is_ok());
        // counted in characters, not bytes
        assert!(check_password_length("ééééééééééé", 12).is_err());
    }

    #[test]
    fn test_fingerprint_plain_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        let fp = fingerprint(&path).unwrap();
        assert_eq!(fp.kind, ContainerKind::Unrecognized);
        assert_eq!(fp.size, 3);
        assert_eq!(
            fp.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            fp.blake3,
            "6437b3ac38465133ffb63b75273a8db548c558465d79db03fd359c6cd5bd9d85"
        );
    }

    #[test]
    fn test_fingerprint_detects_containers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let key = SessionKey::from_bytes([9u8; 32]);

        let sym = tmp.path().join("s.enc");
        let mut w =
            ContainerWriter::new(std::fs::File::create(&sym).unwrap(), &key, Some([1u8; 16]))
                .unwrap();
        w.write_chunk(b"data", true).unwrap();
        w.finish().unwrap();
        assert_eq!(fingerprint(&sym).unwrap().kind, ContainerKind::Symmetric);

        let asym = tmp.path().join("a.enc");
        let mut w = ContainerWriter::new(std::fs::File::create(&asym).unwrap(), &key, None).unwrap();
        w.write_chunk(b"data", true).unwrap();
        w.finish().unwrap();
        assert_eq!(fingerprint(&asym).unwrap().kind, ContainerKind::Asymmetric);

        let legacy = tmp.path().join("old.enc");
        std::fs::write(&legacy, b"Encrypted Using Hat.sh and more").unwrap();
        assert_eq!(fingerprint(&legacy).unwrap().kind, ContainerKind::Legacy);
    }

    #[test]
    fn test_key_material_prefers_key_pair() {
        let pair = KeyPair::generate();
        let args = KeyArgs {
            password: None,
            private_key: Some(pair.private_key().expose_secret().to_string()),
            public_key: Some(pair.public_key()),
        };
        let key = key_material(args, true, 12).unwrap();
        assert!(matches!(key, KeyMaterial::KeyPair { .. }));

        let args = KeyArgs {
            password: Some("too short".into()),
            private_key: None,
            public_key: None,
        };
        assert!(key_material(args, true, 12).is_err());

        // the length rule applies to new passwords only
        let args = KeyArgs {
            password: Some("too short".into()),
            private_key: None,
            public_key: None,
        };
        assert!(key_material(args, false, 12).is_ok());
    }
}
