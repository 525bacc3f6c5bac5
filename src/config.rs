#![forbid(unsafe_code)]

//! Runtime settings resolution.
//!
//! Values come from, in order of precedence: explicit overrides (CLI flags),
//! process environment variables, a `.env` file in the working directory,
//! and finally built-in defaults. Nothing is mandatory; a bare checkout with
//! an input file next to it runs with the defaults.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_ROOT: &str = "output";
pub const DEFAULT_INPUT_FILE: &str = "metaunsorted.txt";
pub const DEFAULT_MAX_RECORDS: usize = 20_000;
pub const DEFAULT_ASSIST_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ASSIST_MODEL: &str = "gpt-3.5-turbo";

/// Fully resolved settings the binary runs with.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Root directory holding one subdirectory per record id.
    pub output_root: PathBuf,
    /// Line-oriented archive dump to read records from.
    pub input_file: PathBuf,
    /// Upper bound on lines processed in one run.
    pub max_records: usize,
    /// Base URL of the OpenAI-compatible extraction endpoint.
    pub assist_api_url: String,
    pub assist_model: String,
    pub assist_api_key: Option<String>,
}

/// Values a caller pins before the environment is consulted.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub output_root: Option<PathBuf>,
    pub input_file: Option<PathBuf>,
    pub max_records: Option<usize>,
    pub assist_api_url: Option<String>,
    pub assist_model: Option<String>,
    pub assist_api_key: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(SettingsOverrides::default())
}

pub fn resolve_runtime_settings(overrides: SettingsOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> RuntimeSettings {
    let output_root = overrides
        .output_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("ARCHIVE_OUTPUT_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_OUTPUT_ROOT.to_string());
    let input_file = overrides
        .input_file
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("ARCHIVE_INPUT_FILE", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_INPUT_FILE.to_string());
    let max_records = overrides
        .max_records
        .or_else(|| {
            lookup_value("ARCHIVE_MAX_RECORDS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .unwrap_or(DEFAULT_MAX_RECORDS);
    let assist_api_url = overrides
        .assist_api_url
        .or_else(|| lookup_value("ASSIST_API_URL", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ASSIST_API_URL.to_string());
    let assist_model = overrides
        .assist_model
        .or_else(|| lookup_value("ASSIST_MODEL", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ASSIST_MODEL.to_string());
    let assist_api_key = overrides
        .assist_api_key
        .or_else(|| lookup_value("ASSIST_API_KEY", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty());

    RuntimeSettings {
        output_root: PathBuf::from(output_root),
        input_file: PathBuf::from(input_file),
        max_records,
        assist_api_url,
        assist_model,
        assist_api_key,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a `.env`-style file: `KEY=value` lines, optional `export ` prefix,
/// optional single or double quotes, `#` comments. Missing file is fine.
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
