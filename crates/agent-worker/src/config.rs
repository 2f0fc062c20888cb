//! Worker configuration from the environment

use std::str::FromStr;

use agent_core::ExecutorConfig;
use agent_tools::HttpToolConfig;
use anyhow::{anyhow, Context};

/// Which reasoning provider drives the task loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReasonerKind {
    #[default]
    Simulated,
    Ollama,
}

impl FromStr for ReasonerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "simulated" => Ok(Self::Simulated),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Unknown AGENT_REASONER '{other}' (expected simulated or ollama)")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub reasoner: ReasonerKind,
    pub executor: ExecutorConfig,
    pub http: HttpToolConfig,
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>().with_context(|| format!("Invalid {key}: {v}")))
        .transpose()
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .context("DATABASE_URL must be set")?;

        let reasoner = get("AGENT_REASONER").as_deref().unwrap_or_default().parse()?;

        let mut executor = ExecutorConfig::default();
        if let Some(retries) = parse_var(&get, "AGENT_MAX_STEP_RETRIES")? {
            executor.max_step_retries = retries;
        }

        let mut http = HttpToolConfig::default();
        if let Some(timeout_ms) = parse_var(&get, "HTTP_TOOL_TIMEOUT_MS")? {
            http.timeout_ms = timeout_ms;
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_var(&get, "DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
            reasoner,
            executor,
            http,
        })
    }
}
