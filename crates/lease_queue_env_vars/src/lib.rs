#![doc = include_str!("../README.md")]

use anyhow::{Context, anyhow};
use std::error::Error;
use std::str::FromStr;

/// Reads an environment variable for the current process.
///
/// Unlike [std::env::var], the `.env` file is loaded first (via [dotenvy])
/// and a missing variable yields `Ok(None)` instead of an error.
#[track_caller]
pub fn var(key: &str) -> anyhow::Result<Option<String>> {
    match dotenvy::var(key) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Reads an environment variable and fails if it is not set.
#[track_caller]
pub fn required_var(key: &str) -> anyhow::Result<String> {
    required(var(key), key)
}

/// Reads an environment variable and parses it with [FromStr], if it is set.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> anyhow::Result<Option<R>>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    let Some(content) = var(key)? else {
        return Ok(None);
    };

    let value = content
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {key} environment variable"))?;

    Ok(Some(value))
}

/// Reads and parses an environment variable, falling back to `default` when
/// it is not set. A value that is set but fails to parse is still an error.
#[track_caller]
pub fn var_parsed_or<R>(key: &str, default: R) -> anyhow::Result<R>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    Ok(var_parsed(key)?.unwrap_or(default))
}

/// Reads and parses an environment variable, and fails if it is not set.
#[track_caller]
pub fn required_var_parsed<R>(key: &str) -> anyhow::Result<R>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    required(var_parsed(key), key)
}

fn required<T>(res: anyhow::Result<Option<T>>, key: &str) -> anyhow::Result<T> {
    res?.ok_or_else(|| anyhow!("Failed to find required {key} environment variable"))
}

/// Reads a comma-separated list from an environment variable.
///
/// Entries are trimmed and empty entries are skipped, so `"a, ,b"` yields
/// `["a", "b"]`. An unset or empty variable yields an empty list.
#[track_caller]
pub fn list(key: &str) -> anyhow::Result<Vec<String>> {
    let values = match var(key)? {
        None => vec![],
        Some(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    };

    Ok(values)
}
