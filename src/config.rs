use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::schema::default_snapshot_path;

const APP_DIR: &str = "match_history";
const DB_FILE: &str = "history.sqlite";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub workers: usize,
    pub busy_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let path_var = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        let workers = get("MATCH_HISTORY_WORKERS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(4)
            .clamp(1, 32);
        let busy_ms = get("MATCH_HISTORY_BUSY_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(5_000);
        Self {
            db_path: path_var("MATCH_HISTORY_DB").or_else(default_db_path),
            snapshot_path: path_var("MATCH_HISTORY_SNAPSHOT"),
            workers,
            busy_timeout: Duration::from_millis(busy_ms),
        }
    }

    pub fn snapshot_path_for(&self, db_path: &std::path::Path) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| default_snapshot_path(db_path))
    }
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(DB_FILE))
}

/// `--name value` or `--name=value` from the process arguments.
pub fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
            && !next.starts_with("--")
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

pub fn positional_args(args: &[String], value_flags: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if value_flags.contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        out.push(arg.clone());
    }
    out
}
