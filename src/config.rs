//! Configuration loader for the `forestwatch` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::{collections::HashMap, env};

use anyhow::{anyhow, bail, Result};

use crate::engine::{CooldownPolicy, EngineSettings};
use crate::models::HazardType;

/// Parse an optional environment variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Which [`IncidentStore`](crate::store::IncidentStore) backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string. Required for the postgres backend.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub listen_port: u16,

    /// Consecutive plain readings that auto-resolve an incident.
    pub cooldown_threshold: u32,

    /// Per-hazard replacements for `cooldown_threshold`.
    pub cooldown_overrides: HashMap<HazardType, u32>,

    /// A node not heard from for this long is marked inactive.
    pub node_inactive_after_secs: u64,

    /// A node heard from within this window cannot be deleted.
    pub node_delete_guard_secs: u64,

    /// Liveness sweep period; 0 disables the sweep.
    pub liveness_sweep_secs: u64,

    /// Resolved incidents older than this are purged by cleanup.
    pub cleanup_retention_days: u32,

    /// Scheduled cleanup period; 0 leaves cleanup to the API.
    pub cleanup_interval_secs: u64,

    /// Events a dashboard subscriber may lag behind before it is dropped.
    pub subscriber_buffer: usize,

    /// Also publish `<hazard>_detected` next to `hazard_detected`.
    pub legacy_hazard_events: bool,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (postgres backend only)
///
/// Optional:
/// - `STORE_BACKEND` – `postgres` or `memory` (default: postgres)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_PORT` – HTTP port (default: 8080)
/// - `COOLDOWN_THRESHOLD` – plain readings before auto-resolution (default: 5)
/// - `COOLDOWN_THRESHOLD_FIRE` / `_CHAINSAW` / `_GUNSHOTS` – per-hazard overrides
/// - `NODE_INACTIVE_AFTER_SECS` (default: 900), `NODE_DELETE_GUARD_SECS` (default: 3600)
/// - `LIVENESS_SWEEP_SECS` (default: 60), `CLEANUP_RETENTION_DAYS` (default: 90)
/// - `CLEANUP_INTERVAL_SECS` (default: 0), `SUBSCRIBER_BUFFER` (default: 64)
/// - `LEGACY_HAZARD_EVENTS` (default: false)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    load_from(|name| env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    // ---
    let store_backend = match lookup("STORE_BACKEND").as_deref().map(str::trim) {
        None | Some("") | Some("postgres") => StoreBackend::Postgres,
        Some("memory") => StoreBackend::Memory,
        Some(other) => bail!("Invalid STORE_BACKEND: '{}' (expected postgres or memory)", other),
    };

    let db_url = match store_backend {
        StoreBackend::Postgres => Some(require_env!(lookup, "DATABASE_URL")),
        StoreBackend::Memory => lookup("DATABASE_URL"),
    };

    let cooldown_threshold = parse_env!(lookup, "COOLDOWN_THRESHOLD", u32, 5);
    if cooldown_threshold == 0 {
        bail!("COOLDOWN_THRESHOLD must be at least 1");
    }

    let mut cooldown_overrides = HashMap::new();
    for hazard in HazardType::ALL {
        let var = format!("COOLDOWN_THRESHOLD_{}", hazard.as_str().to_ascii_uppercase());
        if let Some(raw) = lookup(var.as_str()) {
            let threshold: u32 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {}: {}", var, e))?;
            if threshold == 0 {
                bail!("{} must be at least 1", var);
            }
            cooldown_overrides.insert(hazard, threshold);
        }
    }

    let legacy_hazard_events = match lookup("LEGACY_HAZARD_EVENTS").as_deref().map(str::trim) {
        None | Some("") => false,
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        Some(other) => bail!("Invalid LEGACY_HAZARD_EVENTS: '{}'", other),
    };

    Ok(Config {
        store_backend,
        db_url,
        db_pool_max: parse_env!(lookup, "DB_POOL_MAX", u32, 5),
        listen_port: parse_env!(lookup, "LISTEN_PORT", u16, 8080),
        cooldown_threshold,
        cooldown_overrides,
        node_inactive_after_secs: parse_env!(lookup, "NODE_INACTIVE_AFTER_SECS", u64, 900),
        node_delete_guard_secs: parse_env!(lookup, "NODE_DELETE_GUARD_SECS", u64, 3600),
        liveness_sweep_secs: parse_env!(lookup, "LIVENESS_SWEEP_SECS", u64, 60),
        cleanup_retention_days: parse_env!(lookup, "CLEANUP_RETENTION_DAYS", u32, 90),
        cleanup_interval_secs: parse_env!(lookup, "CLEANUP_INTERVAL_SECS", u64, 0),
        subscriber_buffer: parse_env!(lookup, "SUBSCRIBER_BUFFER", usize, 64),
        legacy_hazard_events,
    })
}

impl Config {
    /// Configuration for in-process use (tests, demos): memory store, defaults.
    pub fn in_memory() -> Config {
        Config {
            store_backend: StoreBackend::Memory,
            db_url: None,
            db_pool_max: 5,
            listen_port: 8080,
            cooldown_threshold: 5,
            cooldown_overrides: HashMap::new(),
            node_inactive_after_secs: 900,
            node_delete_guard_secs: 3600,
            liveness_sweep_secs: 0,
            cleanup_retention_days: 90,
            cleanup_interval_secs: 0,
            subscriber_buffer: 256,
            legacy_hazard_events: false,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        // ---
        let mut cooldown = CooldownPolicy::new(clamp_i32(self.cooldown_threshold));
        for (hazard, threshold) in &self.cooldown_overrides {
            cooldown = cooldown.with_override(*hazard, clamp_i32(*threshold));
        }
        EngineSettings {
            cooldown,
            legacy_hazard_events: self.legacy_hazard_events,
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let masked_db_url = self
            .db_url
            .as_deref()
            .map(mask_db_url)
            .unwrap_or_else(|| "(unset)".to_string());

        let mut overrides: Vec<String> = self
            .cooldown_overrides
            .iter()
            .map(|(h, t)| format!("{h}={t}"))
            .collect();
        overrides.sort();

        tracing::info!("Configuration loaded:");
        tracing::info!("  STORE_BACKEND            : {:?}", self.store_backend);
        tracing::info!("  DATABASE_URL             : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX              : {}", self.db_pool_max);
        tracing::info!("  LISTEN_PORT              : {}", self.listen_port);
        tracing::info!("  COOLDOWN_THRESHOLD       : {}", self.cooldown_threshold);
        tracing::info!("  COOLDOWN overrides       : [{}]", overrides.join(", "));
        tracing::info!("  NODE_INACTIVE_AFTER_SECS : {}", self.node_inactive_after_secs);
        tracing::info!("  NODE_DELETE_GUARD_SECS   : {}", self.node_delete_guard_secs);
        tracing::info!("  LIVENESS_SWEEP_SECS      : {}", self.liveness_sweep_secs);
        tracing::info!("  CLEANUP_RETENTION_DAYS   : {}", self.cleanup_retention_days);
        tracing::info!("  CLEANUP_INTERVAL_SECS    : {}", self.cleanup_interval_secs);
        tracing::info!("  SUBSCRIBER_BUFFER        : {}", self.subscriber_buffer);
        tracing::info!("  LEGACY_HAZARD_EVENTS     : {}", self.legacy_hazard_events);
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Mask the password in a database URL for logging.
fn mask_db_url(db_url: &str) -> String {
    // ---
    let authority_start = db_url.find("://").map_or(0, |pos| pos + 3);
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            if colon_pos >= authority_start {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}
