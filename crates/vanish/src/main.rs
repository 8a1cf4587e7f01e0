use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vanish_server::StorageKind;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vanish", about = "Vanish: one-time secret links", version)]
struct Cli {
    /// Vanish server URL (default: http://localhost:8080 or $VANISH_SERVER)
    #[arg(long, env = "VANISH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Vanish HTTP server
    Serve {
        /// Port to listen on (default: $VANISH_PORT or 8080)
        #[arg(long, env = "VANISH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $VANISH_HOST or 0.0.0.0)
        #[arg(long, env = "VANISH_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Directory for the key and records (default: $VANISH_DATA_DIR or platform data dir)
        #[arg(long, env = "VANISH_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Encryption key file (default: <data-dir>/vanish.key)
        #[arg(long, env = "VANISH_KEY_FILE")]
        key_file: Option<PathBuf>,
        /// Record storage: `files` or `redb`
        #[arg(long, env = "VANISH_STORAGE", default_value = "files")]
        storage: StorageKind,
        /// Maximum secret length in characters
        #[arg(long, env = "VANISH_MAX_SECRET_LENGTH")]
        max_length: Option<usize>,
    },
    /// Create a one-time link for a secret and print it
    Create {
        /// The secret text; read from stdin when omitted or `-`
        secret: Option<String>,
        /// Expiry e.g. 5m, 1h, 24h
        #[arg(long, default_value = "1h")]
        ttl: String,
    },
    /// Reveal (and destroy) a secret by token or link
    View {
        /// Token or full `/view/<token>` link
        target: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VANISH_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            key_file,
            storage,
            max_length,
        } => {
            let defaults = vanish_server::ServerConfig::from_env()?;
            let cfg = vanish_server::ServerConfig {
                host,
                port,
                data_dir,
                key_file,
                storage,
                max_secret_length: max_length.unwrap_or(defaults.max_secret_length),
                ..defaults
            };
            info!(storage = ?cfg.storage, port = cfg.port, "starting vanish server");
            vanish_server::run(cfg).await
        }

        Commands::Create { secret, ttl } => {
            let secret = match secret.as_deref() {
                None | Some("-") => read_stdin()?,
                Some(s) => s.to_owned(),
            };
            cmd_create(&cli.server, &secret, parse_duration(&ttl)?).await
        }

        Commands::View { target } => cmd_view(&cli.server, token_from(&target)).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_create(server: &str, secret: &str, expire_seconds: u64) -> Result<()> {
    let base = server.trim_end_matches('/');
    debug!(server = base, expire_seconds, "creating secret");
    let resp = Client::new()
        .post(format!("{base}/create"))
        .json(&serde_json::json!({
            "secret": secret,
            "expire_seconds": expire_seconds,
        }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }

    let token = json["token"].as_str().context("response has no token")?;
    println!("{base}/view/{token}");
    Ok(())
}

async fn cmd_view(server: &str, token: &str) -> Result<()> {
    debug!(server, "viewing secret");
    let resp = Client::new()
        .get(format!("{}/view/{}", server.trim_end_matches('/'), token))
        .send()
        .await
        .context("HTTP request failed")?;

    match resp.status() {
        StatusCode::OK => {
            let json: Value = resp.json().await.context("parse response")?;
            println!("{}", json["secret"].as_str().unwrap_or(""));
            Ok(())
        }
        StatusCode::NOT_FOUND => anyhow::bail!("secret not found or expired"),
        status => anyhow::bail!("server returned {status}"),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read secret from stdin")?;
    Ok(buf)
}

/// Parse human duration strings like "5m", "1h", "24h" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

/// Accept either a bare token or a link ending in `/view/<token>`.
fn token_from(target: &str) -> &str {
    let trimmed = target.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("24h").unwrap(), 86400);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn token_from_link_or_bare() {
        assert_eq!(token_from("abc123"), "abc123");
        assert_eq!(token_from("http://localhost:8080/view/abc123"), "abc123");
        assert_eq!(token_from("https://vanish.example/view/abc123/ "), "abc123");
    }

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
