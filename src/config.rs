#![forbid(unsafe_code)]

//! Server configuration built once at startup from three layers, strongest
//! last: `.env` file values, process environment, explicit overrides from
//! the command line. No ambient globals; the resolved [`ServerOptions`] is
//! handed to the router explicitly.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_STATIC_ROOT: &str = "public";
pub const DEFAULT_TEMP_DIR: &str = "temp";
pub const DEFAULT_MAX_DOWNLOADS: usize = 4;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub static_root: PathBuf,
    pub temp_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_root: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub max_concurrent_downloads: Option<usize>,
    pub ytdlp_bin: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_server_options(overrides: ServerOverrides) -> Result<ServerOptions> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_server_options(&file_vars, env_var_string, overrides)
}

fn build_server_options(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ServerOverrides,
) -> Result<ServerOptions> {
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("TUBEFETCH_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEFETCH_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    let static_root = overrides
        .static_root
        .or_else(|| lookup_value("TUBEFETCH_STATIC_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_ROOT));

    let temp_dir = overrides
        .temp_dir
        .or_else(|| lookup_value("TUBEFETCH_TEMP_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR));

    let max_concurrent_downloads = overrides
        .max_concurrent_downloads
        .or_else(|| {
            lookup_value("TUBEFETCH_MAX_DOWNLOADS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_MAX_DOWNLOADS);

    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("TUBEFETCH_YTDLP", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    let ffmpeg_bin = overrides
        .ffmpeg_bin
        .or_else(|| lookup_value("TUBEFETCH_FFMPEG", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN));

    Ok(ServerOptions {
        host,
        port,
        static_root,
        temp_dir,
        max_concurrent_downloads,
        ytdlp_bin,
        ffmpeg_bin,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
