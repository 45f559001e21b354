//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::collections::BTreeMap;
use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, InvalidationGraph, KeyTemplate};

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, GraphArgs, SimulateArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "optimist";
const ENV_PREFIX: &str = "OPTIMIST";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub invalidation: Vec<InvalidationOverride>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Configured change to one category's invalidation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationOverride {
    pub category: String,
    pub mode: OverrideMode,
    pub templates: Vec<KeyTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideMode {
    /// Add templates to the built-in rule.
    Extend,
    /// Use only the configured templates.
    Replace,
}

impl Settings {
    /// Apply the configured overrides on top of `base`.
    pub fn invalidation_graph(&self, mut base: InvalidationGraph) -> InvalidationGraph {
        for rule in &self.invalidation {
            let templates = rule.templates.iter().cloned();
            match rule.mode {
                OverrideMode::Extend => base.extend(rule.category.clone(), templates),
                OverrideMode::Replace => base.replace(rule.category.clone(), templates),
            }
        }
        base
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    invalidation: BTreeMap<String, RawInvalidationRule>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max_entries) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max_entries);
        }
        if let Some(stale_after_ms) = overrides.cache_stale_after_ms {
            self.cache.stale_after_ms = Some(stale_after_ms);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            invalidation,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let invalidation = build_invalidation_overrides(invalidation)?;

        Ok(Self {
            logging,
            cache,
            invalidation,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let notice_capacity = cache.notice_capacity.unwrap_or(defaults.notice_capacity);
    if notice_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.notice_capacity",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        max_entries: cache.max_entries.unwrap_or(defaults.max_entries),
        stale_after_ms: cache.stale_after_ms.unwrap_or(defaults.stale_after_ms),
        notice_capacity,
    })
}

fn build_invalidation_overrides(
    rules: BTreeMap<String, RawInvalidationRule>,
) -> Result<Vec<InvalidationOverride>, LoadError> {
    rules
        .into_iter()
        .map(|(category, rule)| {
            if category.trim().is_empty() {
                return Err(LoadError::invalid(
                    "invalidation",
                    "category name must not be empty",
                ));
            }
            if rule.keys.is_empty() && !rule.replace {
                return Err(LoadError::invalid(
                    "invalidation",
                    format!("`{category}` lists no keys to add"),
                ));
            }

            let templates = rule
                .keys
                .iter()
                .map(|raw| KeyTemplate::from_str(raw))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| LoadError::invalid("invalidation", format!("`{category}`: {err}")))?;

            let mode = if rule.replace {
                OverrideMode::Replace
            } else {
                OverrideMode::Extend
            };

            Ok(InvalidationOverride {
                category,
                mode,
                templates,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<usize>,
    stale_after_ms: Option<u64>,
    notice_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationRule {
    keys: Vec<String>,
    replace: bool,
}

#[cfg(test)]
mod tests;
