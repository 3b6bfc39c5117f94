//! Orchestrator configuration.

use serde::Deserialize;

/// Orchestrator configuration loaded from environment variables.
///
/// Environment variables are prefixed with `OXFLOW_`:
/// - `OXFLOW_SERVER_NAME`: Instance name for identification
/// - `OXFLOW_DEBUG`: Enable debug mode (default: false)
/// - `OXFLOW_NATS_URL`: NATS URL for worker-job notifications (optional)
/// - `OXFLOW_WORKER_JOB_SUBJECT`: NATS subject for worker jobs
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Instance name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// NATS URL (optional; the in-memory queue is used when unset)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// NATS subject for worker-job notifications
    #[serde(default = "default_worker_job_subject")]
    pub worker_job_subject: String,
}

fn default_server_name() -> String {
    "oxflow-orchestrator".to_string()
}

fn default_worker_job_subject() -> String {
    "oxflow.jobs".to_string()
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `OXFLOW_`. A `.env` file is
    /// honored when present.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("OXFLOW_").from_env::<OrchestratorConfig>()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            debug: false,
            nats_url: None,
            worker_job_subject: default_worker_job_subject(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.server_name, "oxflow-orchestrator");
        assert!(!config.debug);
        assert!(config.nats_url.is_none());
        assert_eq!(config.worker_job_subject, "oxflow.jobs");
    }
}
