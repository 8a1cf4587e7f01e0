use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    dirs::DataLayout,
    handlers::{create_secret, health, view_secret},
    store::{load_or_create_key, Limits, SecretStore},
    AppState, TtlPolicy,
};

/// Persistence backend for secret records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// One file per token under `<data_dir>/secrets`.
    #[default]
    Files,
    /// A single redb database at `<data_dir>/vanish.db`.
    ///
    /// redb has one writer lock, so every create and view takes it in turn,
    /// even for unrelated tokens. Prefer [`StorageKind::Files`] under
    /// concurrent load.
    Redb,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "files" | "file" => Ok(Self::Files),
            "redb" => Ok(Self::Redb),
            other => Err(format!("unknown storage '{other}' (expected 'files' or 'redb')")),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Key file location; defaults to `<data_dir>/vanish.key`.
    pub key_file: Option<PathBuf>,
    pub storage: StorageKind,
    pub max_secret_length: usize,
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    /// If set, `POST /create` accepts only these `expire_seconds` values.
    pub allowed_ttls: Option<Vec<u64>>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: None,
            key_file: None,
            storage: StorageKind::default(),
            max_secret_length: limits.max_secret_length,
            default_ttl_seconds: TtlPolicy::default().default_seconds,
            max_ttl_seconds: limits.max_ttl_seconds,
            allowed_ttls: None,
            sweep_interval: Duration::from_secs(300),
            cors_origins: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `VANISH_*` environment variables.
    ///
    /// A variable that is set but does not parse is an error, so a typo never
    /// silently falls back to a more permissive default.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let set = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let allowed_ttls = match set("VANISH_ALLOWED_TTLS") {
            Some(v) => Some(parse_ttl_list(&v).with_context(|| {
                format!("VANISH_ALLOWED_TTLS={v:?} is not a comma-separated list of seconds")
            })?),
            None => defaults.allowed_ttls,
        };
        let sweep_interval = match set("VANISH_SWEEP_INTERVAL") {
            Some(v) => humantime::parse_duration(v.trim())
                .with_context(|| format!("VANISH_SWEEP_INTERVAL={v:?} is not a duration"))?,
            None => defaults.sweep_interval,
        };

        Ok(Self {
            host: set("VANISH_HOST").unwrap_or(defaults.host),
            port: parse_var(&set, "VANISH_PORT")?.unwrap_or(defaults.port),
            data_dir: set("VANISH_DATA_DIR").map(PathBuf::from),
            key_file: set("VANISH_KEY_FILE").map(PathBuf::from),
            storage: parse_var(&set, "VANISH_STORAGE")?.unwrap_or(defaults.storage),
            max_secret_length: parse_var(&set, "VANISH_MAX_SECRET_LENGTH")?
                .unwrap_or(defaults.max_secret_length),
            default_ttl_seconds: parse_var(&set, "VANISH_DEFAULT_TTL")?
                .unwrap_or(defaults.default_ttl_seconds),
            max_ttl_seconds: parse_var(&set, "VANISH_MAX_TTL")?
                .unwrap_or(defaults.max_ttl_seconds),
            allowed_ttls,
            sweep_interval,
            cors_origins: set("VANISH_CORS_ORIGINS"),
        })
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_secret_length: self.max_secret_length,
            max_ttl_seconds: self.max_ttl_seconds,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            default_seconds: self.default_ttl_seconds,
            allowed: self.allowed_ttls.clone(),
        }
    }

    /// Reject settings that would make every create request fail.
    pub fn validate(&self) -> Result<()> {
        if self.max_secret_length == 0 {
            anyhow::bail!("max secret length must be greater than zero");
        }
        if self.default_ttl_seconds == 0 || self.default_ttl_seconds > self.max_ttl_seconds {
            anyhow::bail!(
                "default TTL {}s must be between 1s and the maximum TTL {}s",
                self.default_ttl_seconds,
                self.max_ttl_seconds
            );
        }
        if let Some(allowed) = &self.allowed_ttls {
            if let Some(bad) = allowed
                .iter()
                .find(|&&t| t == 0 || t > self.max_ttl_seconds)
            {
                anyhow::bail!("allowed TTL {bad}s is outside 1s..={}s", self.max_ttl_seconds);
            }
            if !allowed.contains(&self.default_ttl_seconds) {
                anyhow::bail!(
                    "default TTL {}s is not in the allowed TTL list",
                    self.default_ttl_seconds
                );
            }
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be greater than zero");
        }
        Ok(())
    }

    /// Load (or create) the key and open the configured backend.
    pub fn open_store(&self, layout: &DataLayout) -> Result<SecretStore> {
        let key_path = self.key_file.clone().unwrap_or_else(|| layout.key_file());
        let key = load_or_create_key(&key_path).context("load encryption key")?;

        match self.storage {
            StorageKind::Files => {
                SecretStore::open_files(&layout.records_dir(), key, self.limits())
            }
            StorageKind::Redb => SecretStore::open_redb(&layout.database(), key, self.limits()),
        }
    }
}

/// Parse a comma-separated list of seconds, e.g. `300,3600,86400`.
/// Returns `None` for an empty list or any unparseable entry.
pub fn parse_ttl_list(s: &str) -> Option<Vec<u64>> {
    let ttls = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    (!ttls.is_empty()).then_some(ttls)
}

fn parse_var<T>(set: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    set(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{name}={v:?} is invalid: {e}"))
        })
        .transpose()
}

/// Routes for the create/view contract.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/create", post(create_secret))
        .route("/view/{token}", get(view_secret))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    cfg.validate()?;

    let layout = DataLayout::resolve(cfg.data_dir.as_deref())?;
    info!(data_dir = %layout.root().display(), storage = ?cfg.storage, "using data directory");

    let store = cfg.open_store(&layout).context("open store")?;
    store.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        store,
        ttl: cfg.ttl_policy(),
    };

    let app = router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(
        %addr,
        max_secret_length = cfg.max_secret_length,
        default_ttl_seconds = cfg.default_ttl_seconds,
        "vanish server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<http::HeaderValue> =
                o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
