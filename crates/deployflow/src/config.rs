use crate::jobs::retry::RetryConfig;
use crate::pipelines::PipelineSettings;
use crate::worker::WorkerPoolConfig;
use std::time::Duration;

/// Runtime configuration for the worker binary, read from the environment
/// (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub lease_seconds: u64,
    pub reap_interval_seconds: u64,
    pub deploy_timeout_seconds: u64,

    pub registry: String,
    pub registry_token: Option<String>,
    pub base_domain: String,
    pub internal_domain: String,

    pub orchestrator_url: String,
    pub orchestrator_token: String,
    pub infra_url: String,
    pub infra_token: String,
    pub infra_max_retries: u32,
    pub git_api_base: String,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("DEPLOYFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("DEPLOYFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let orchestrator_url = required("DEPLOYFLOW_ORCHESTRATOR_URL")?;
        let orchestrator_token = required("DEPLOYFLOW_ORCHESTRATOR_TOKEN")?;
        let infra_url = env_or_fallback("DEPLOYFLOW_INFRA_URL", "INFRA_API_URL")
            .unwrap_or_else(|| "https://api.digitalocean.com".to_string());
        let infra_token = env_or_fallback("DEPLOYFLOW_INFRA_TOKEN", "INFRA_API_TOKEN")
            .ok_or_else(|| anyhow::anyhow!("DEPLOYFLOW_INFRA_TOKEN is missing"))?;

        Ok(Self {
            database_url,
            worker_id,
            workers: parsed("DEPLOYFLOW_WORKERS", "WORKERS").unwrap_or(4).clamp(1, 64),
            poll_interval_ms: parsed("DEPLOYFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
                .unwrap_or(500),
            lease_seconds: parsed("DEPLOYFLOW_LEASE_SECONDS", "LEASE_SECONDS").unwrap_or(900),
            reap_interval_seconds: parsed("DEPLOYFLOW_REAP_INTERVAL_SECONDS", "REAP_INTERVAL_SECONDS")
                .unwrap_or(30),
            deploy_timeout_seconds: parsed("DEPLOYFLOW_DEPLOY_TIMEOUT_SECONDS", "DEPLOY_TIMEOUT_SECONDS")
                .unwrap_or(300),

            registry: env_or_fallback("DEPLOYFLOW_REGISTRY", "REGISTRY")
                .unwrap_or_else(|| "registry.localhost".to_string()),
            registry_token: env_or_fallback("DEPLOYFLOW_REGISTRY_TOKEN", "REGISTRY_TOKEN"),
            base_domain: env_or_fallback("DEPLOYFLOW_BASE_DOMAIN", "BASE_DOMAIN")
                .unwrap_or_else(|| "apps.localhost".to_string()),
            internal_domain: env_or_fallback("DEPLOYFLOW_INTERNAL_DOMAIN", "INTERNAL_DOMAIN")
                .unwrap_or_else(|| "internal.localhost".to_string()),

            orchestrator_url,
            orchestrator_token,
            infra_url,
            infra_token,
            infra_max_retries: parsed("DEPLOYFLOW_INFRA_MAX_RETRIES", "INFRA_MAX_RETRIES")
                .unwrap_or(3),
            git_api_base: env_or_fallback("DEPLOYFLOW_GIT_API_BASE", "GIT_API_BASE")
                .unwrap_or_else(|| "https://api.github.com".to_string()),

            admin_addr: env_or_fallback("DEPLOYFLOW_ADMIN_ADDR", "ADMIN_ADDR")
                .and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: env_bool("DEPLOYFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
        })
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_id: self.worker_id.clone(),
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease: Duration::from_secs(self.lease_seconds),
            reap_interval: Duration::from_secs(self.reap_interval_seconds),
            retry: RetryConfig::default(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            registry: self.registry.clone(),
            base_domain: self.base_domain.clone(),
            internal_domain: self.internal_domain.clone(),
            deploy_timeout: Duration::from_secs(self.deploy_timeout_seconds),
            ..PipelineSettings::default()
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{key} is missing"))
}

fn parsed<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_addr_can_be_switched_off() {
        assert_eq!(normalize_optional_addr(" off "), None);
        assert_eq!(normalize_optional_addr(""), None);
        assert_eq!(
            normalize_optional_addr("127.0.0.1:8088"),
            Some("127.0.0.1:8088".to_string())
        );
    }
}
