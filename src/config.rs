//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use regex::Regex;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Which inspection backend reviews submitted SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionBackendKind {
    /// Local static rules only
    #[default]
    Rules,
    /// Static rules followed by a rolled-back trial run on the target
    DryRun,
}

impl FromStr for InspectionBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rules" | "builtin" => Ok(Self::Rules),
            "dry_run" | "dryrun" | "dry-run" => Ok(Self::DryRun),
            _ => Err(()),
        }
    }
}

/// `auto_review_wrong`: which check findings reject a ticket automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum AutoReviewPolicy {
    /// Unset: only errors reject
    #[default]
    Unset,
    /// "1": any warning rejects
    RejectWarnings,
    /// "2": only errors reject
    RejectErrors,
}

impl AutoReviewPolicy {
    pub fn rejects_warnings(self) -> bool {
        matches!(self, AutoReviewPolicy::RejectWarnings)
    }

    /// Errors are fatal under every recognised setting
    pub fn rejects_errors(self) -> bool {
        true
    }
}

impl FromStr for AutoReviewPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(Self::Unset),
            "1" => Ok(Self::RejectWarnings),
            "2" => Ok(Self::RejectErrors),
            _ => Err(()),
        }
    }
}

/// How per-database execution results reduce to a terminal ticket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Exception only when the highest error level is critical
    #[default]
    Severity,
    /// Exception when any statement reported a warning or an error
    ErrorCount,
}

impl FromStr for AggregationPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "severity" | "level" => Ok(Self::Severity),
            "count" | "error_count" => Ok(Self::ErrorCount),
            _ => Err(()),
        }
    }
}

/// Inspection configuration
#[derive(Debug, Clone)]
pub struct InspectionConfig {
    pub backend: InspectionBackendKind,
    /// Statements matching this pattern are rejected; empty disables the check
    pub critical_ddl_regex: String,
    pub auto_review_wrong: AutoReviewPolicy,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            backend: InspectionBackendKind::Rules,
            critical_ddl_regex: String::new(),
            auto_review_wrong: AutoReviewPolicy::Unset,
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub aggregation: AggregationPolicy,
    /// When disabled, engines that support backup force it on
    pub enable_backup_switch: bool,
    pub query_max_rows: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationPolicy::Severity,
            enable_backup_switch: false,
            query_max_rows: 1000,
        }
    }
}

/// Target database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub inspection: InspectionConfig,
    pub execution: ExecutionConfig,
    pub pool: PoolConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is fine; a malformed one is not
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e.into());
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let inspection = InspectionConfig {
            backend: parse_or_default(&lookup, "INSPECTION_BACKEND", InspectionBackendKind::Rules)?,
            critical_ddl_regex: lookup("CRITICAL_DDL_REGEX").unwrap_or_default(),
            auto_review_wrong: parse_or_default(&lookup, "AUTO_REVIEW_WRONG", AutoReviewPolicy::Unset)?,
        };

        let execution = ExecutionConfig {
            aggregation: parse_or_default(&lookup, "EXECUTE_AGGREGATION", AggregationPolicy::Severity)?,
            enable_backup_switch: parse_bool(&lookup, "ENABLE_BACKUP_SWITCH", false)?,
            query_max_rows: parse_or_default(&lookup, "QUERY_MAX_ROWS", 1000)?,
        };

        let pool = PoolConfig {
            max_pool_size: parse_or_default(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            connect_timeout: Duration::from_secs(parse_or_default(&lookup, "DB_CONNECT_TIMEOUT_SECS", 10)?),
        };

        let settings = Self {
            inspection,
            execution,
            pool,
        };
        // Surface a bad pattern at startup rather than on the first check
        settings.compile_critical_regex()?;
        Ok(settings)
    }

    /// Compile `critical_ddl_regex`, anchored at the statement start
    pub fn compile_critical_regex(&self) -> Result<Option<Regex>, ConfigError> {
        let pattern = self.inspection.critical_ddl_regex.trim();
        if pattern.is_empty() {
            return Ok(None);
        }
        Regex::new(&format!("^(?:{})", pattern))
            .map(Some)
            .map_err(|e| ConfigError::ParseError(format!("CRITICAL_DDL_REGEX: {}", e)))
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
    }
}
