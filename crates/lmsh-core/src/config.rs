//! Engine configuration.
//!
//! `EngineConfig` is passed explicitly into the engine and the pipeline;
//! nothing reads the environment after start-up.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{LmshError, Result, ValidationError};
use crate::retry::RetryPolicy;

/// Operator-supplied grading command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Program and arguments, whitespace separated.
    pub command: String,
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hook_timeout_secs() -> u64 {
    60
}

impl HookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tuning knobs for reconciliation and propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Points used when an assignment declares none.
    pub default_points: u32,
    /// Compare-and-swap races tolerated per key before reporting a conflict.
    pub cas_budget: u32,
    /// Submissions processed concurrently during propagation.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub grading_hook: Option<HookConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_points: 100,
            cas_budget: 5,
            concurrency: 4,
            retry: RetryPolicy::default(),
            grading_hook: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LMSH_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `LMSH_DEFAULT_POINTS` | `default_points` |
    /// | `LMSH_CAS_BUDGET` | `cas_budget` |
    /// | `LMSH_CONCURRENCY` | `concurrency` |
    /// | `LMSH_MAX_ATTEMPTS` | `retry.max_attempts` |
    /// | `LMSH_BASE_DELAY_MS` | `retry.base_delay_ms` |
    /// | `LMSH_MAX_DELAY_MS` | `retry.max_delay_ms` |
    /// | `LMSH_GRADING_HOOK` | `grading_hook.command` |
    /// | `LMSH_HOOK_TIMEOUT_SECS` | `grading_hook.timeout_secs` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "LMSH_DEFAULT_POINTS")? {
            config.default_points = v;
        }
        if let Some(v) = parse_var(&lookup, "LMSH_CAS_BUDGET")? {
            config.cas_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "LMSH_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "LMSH_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "LMSH_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "LMSH_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = v;
        }
        if let Some(command) = lookup("LMSH_GRADING_HOOK").filter(|c| !c.trim().is_empty()) {
            config.grading_hook = Some(HookConfig {
                command,
                timeout_secs: parse_var(&lookup, "LMSH_HOOK_TIMEOUT_SECS")?
                    .unwrap_or_else(default_hook_timeout_secs),
            });
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| LmshError::Validation(ValidationError::Other(msg.to_string()));
        if self.default_points == 0 {
            return Err(invalid("default points must be greater than zero"));
        }
        if self.cas_budget == 0 {
            return Err(invalid("CAS budget must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry max attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry base delay exceeds max delay"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            LmshError::Validation(ValidationError::Other(format!(
                "{name}: invalid value {raw:?}"
            )))
        }),
    }
}
