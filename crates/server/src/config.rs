use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::{GridGeometry, StaticLedger, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH};
use tracing::warn;

pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub grid_width: u32,
    pub grid_height: u32,
    pub static_ledger_path: Option<String>,
    pub max_body_bytes: usize,
    pub finalize_max_attempts: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8787".into(),
            database_url: "sqlite://./data/grid.db".into(),
            grid_width: DEFAULT_GRID_WIDTH,
            grid_height: DEFAULT_GRID_HEIGHT,
            static_ledger_path: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            finalize_max_attempts: server_api::DEFAULT_FINALIZE_MAX_ATTEMPTS,
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml`, then the environment. `APP__*` variables win
/// over their bare aliases.
pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(error) => warn!(%error, "config: ignoring unreadable server.toml"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__STATIC_LEDGER_PATH") {
        settings.static_ledger_path = Some(v).filter(|path| !path.trim().is_empty());
    }

    if let Some(parsed) = parse_env(&env, "APP__GRID_WIDTH").filter(|n: &u32| *n > 0) {
        settings.grid_width = parsed;
    }
    if let Some(parsed) = parse_env(&env, "APP__GRID_HEIGHT").filter(|n: &u32| *n > 0) {
        settings.grid_height = parsed;
    }
    if let Some(parsed) = parse_env(&env, "APP__MAX_BODY_BYTES") {
        settings.max_body_bytes = parsed;
    }
    if let Some(parsed) = parse_env(&env, "APP__FINALIZE_MAX_ATTEMPTS") {
        settings.finalize_max_attempts = parsed;
    }

    if GridGeometry::checked(settings.grid_width, settings.grid_height).is_none() {
        warn!(
            width = settings.grid_width,
            height = settings.grid_height,
            "config: grid too large, using default size"
        );
        settings.grid_width = DEFAULT_GRID_WIDTH;
        settings.grid_height = DEFAULT_GRID_HEIGHT;
    }

    settings
}

fn apply_file(settings: &mut Settings, file_cfg: &HashMap<String, toml::Value>) {
    let text = |key: &str| file_cfg.get(key).and_then(toml::Value::as_str);
    let number = |key: &str| {
        file_cfg
            .get(key)
            .and_then(toml::Value::as_integer)
            .filter(|n| *n > 0)
    };

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v.to_string();
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v.to_string();
    }
    if let Some(v) = text("static_ledger_path") {
        settings.static_ledger_path = Some(v.to_string());
    }
    if let Some(v) = number("grid_width").and_then(|n| u32::try_from(n).ok()) {
        settings.grid_width = v;
    }
    if let Some(v) = number("grid_height").and_then(|n| u32::try_from(n).ok()) {
        settings.grid_height = v;
    }
    if let Some(v) = number("max_body_bytes").and_then(|n| usize::try_from(n).ok()) {
        settings.max_body_bytes = v;
    }
    if let Some(v) = number("finalize_max_attempts").and_then(|n| usize::try_from(n).ok()) {
        settings.finalize_max_attempts = v;
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable override");
            None
        }
    }
}

/// Reads the static sold ledger. A configured but missing file is treated as
/// "no static sales"; a file that exists but does not parse is an error.
pub fn load_static_ledger(path: Option<&str>) -> anyhow::Result<StaticLedger> {
    let Some(path) = path else {
        return Ok(StaticLedger::default());
    };
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            warn!(%path, "config: static ledger file not found, starting without static sales");
            return Ok(StaticLedger::default());
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read static ledger '{path}'"))
        }
    };
    StaticLedger::from_json(&raw).with_context(|| format!("static ledger '{path}' is not valid"))
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
