//! Startup environment validation (§6).
//!
//! Every binary calls [`RuntimeConfig::from_env`] once, at the very top
//! of `main`, before anything else touches the network or a store. All
//! missing or invalid variables are collected into a single
//! [`ConfigError::Invalid`] so an operator fixes the environment in one
//! pass instead of a loop of restart-and-discover.

use std::env;

use refund_error::{Classify, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration invalid: {problems:?}")]
    Invalid { problems: Vec<String> },
}

impl Classify for ConfigError {
    fn code(&self) -> ErrorCode {
        ErrorCode::MissingEnvVar
    }
}

/// `GEMINI_API_KEY` and friends: required variables common to every
/// binary that drives an LLM call.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub adjudicator_model: String,
    pub ontology_model: String,
    pub extraction_model: String,
    pub critic_model: String,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct OrdersDbConfig {
    pub connection_string: String,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub project: String,
    pub region: String,
    pub queue_name: String,
    pub processor_url: String,
    pub service_account_email: String,
}

/// Points at the mounted secret holding the Gmail OAuth refresh-token
/// bundle; the daemon reads and parses it once at startup.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub credentials_path: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub llm: LlmConfig,
    pub graph: GraphConfig,
    pub orders_db: OrdersDbConfig,
    pub blob: BlobConfig,
    pub task_queue: TaskQueueConfig,
    pub mail: MailConfig,
    pub llama_cloud_api_key: Option<String>,
}

struct EnvReader {
    problems: Vec<String>,
}

impl EnvReader {
    fn new() -> Self {
        EnvReader { problems: Vec::new() }
    }

    fn required(&mut self, key: &str) -> String {
        match env::var(key) {
            Ok(v) if !v.trim().is_empty() => v,
            Ok(_) => {
                self.problems.push(format!("{key} is set but empty"));
                String::new()
            }
            Err(_) => {
                self.problems.push(format!("{key} is not set"));
                String::new()
            }
        }
    }

    fn optional(&mut self, key: &str, default: &str) -> String {
        env::var(key).unwrap_or_else(|_| default.to_string())
    }

    fn optional_opt(&mut self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl RuntimeConfig {
    /// Reads every variable in §6 from the process environment,
    /// aggregating every problem found rather than failing on the
    /// first one.
    pub fn from_env() -> Result<RuntimeConfig, ConfigError> {
        let mut reader = EnvReader::new();

        let llm = LlmConfig {
            api_key: reader.required("GEMINI_API_KEY"),
            adjudicator_model: reader.optional("ADJUDICATOR_MODEL", "gemini-2.5-pro"),
            ontology_model: reader.optional("ONTOLOGY_MODEL", "gemini-2.5-pro"),
            extraction_model: reader.optional("EXTRACTION_MODEL", "gemini-2.5-pro"),
            critic_model: reader.optional("CRITIC_MODEL", "gemini-2.5-pro"),
        };

        let graph = GraphConfig {
            uri: reader.required("NEO4J_URI"),
            user: reader.required("NEO4J_USER"),
            password: reader.required("NEO4J_PASSWORD"),
        };

        let orders_db = OrdersDbConfig {
            connection_string: reader.required("ORDERS_DATABASE_URL"),
        };

        let blob = BlobConfig {
            bucket: reader.required("BLOB_BUCKET_NAME"),
        };

        let task_queue = TaskQueueConfig {
            project: reader.required("TASK_QUEUE_PROJECT"),
            region: reader.required("TASK_QUEUE_REGION"),
            queue_name: reader.required("TASK_QUEUE_NAME"),
            processor_url: reader.required("TASK_QUEUE_PROCESSOR_URL"),
            service_account_email: reader.required("TASK_QUEUE_SA_EMAIL"),
        };

        let mail = MailConfig {
            credentials_path: reader.required("GMAIL_CREDENTIALS_PATH"),
        };

        let llama_cloud_api_key = reader.optional_opt("LLAMA_CLOUD_API_KEY");

        if reader.problems.is_empty() {
            Ok(RuntimeConfig {
                llm,
                graph,
                orders_db,
                blob,
                task_queue,
                mail,
                llama_cloud_api_key,
            })
        } else {
            Err(ConfigError::Invalid {
                problems: reader.problems,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_REQUIRED: &[&str] = &[
        "GEMINI_API_KEY",
        "NEO4J_URI",
        "NEO4J_USER",
        "NEO4J_PASSWORD",
        "ORDERS_DATABASE_URL",
        "BLOB_BUCKET_NAME",
        "TASK_QUEUE_PROJECT",
        "TASK_QUEUE_REGION",
        "TASK_QUEUE_NAME",
        "TASK_QUEUE_PROCESSOR_URL",
        "TASK_QUEUE_SA_EMAIL",
        "GMAIL_CREDENTIALS_PATH",
    ];

    fn clear_all() {
        for key in ALL_REQUIRED {
            env::remove_var(key);
        }
        env::remove_var("LLAMA_CLOUD_API_KEY");
    }

    fn set_all_required() {
        for key in ALL_REQUIRED {
            env::set_var(key, "test-value");
        }
    }

    #[test]
    fn missing_vars_are_all_collected_not_just_first() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = RuntimeConfig::from_env().unwrap_err();
        let ConfigError::Invalid { problems } = err;
        assert!(problems.len() >= ALL_REQUIRED.len());
        assert!(problems.iter().any(|p| p.contains("GEMINI_API_KEY")));
        assert!(problems.iter().any(|p| p.contains("NEO4J_URI")));
        clear_all();
    }

    #[test]
    fn complete_env_produces_config_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_all_required();
        let config = RuntimeConfig::from_env().expect("all required vars set");
        assert_eq!(config.llm.adjudicator_model, "gemini-2.5-pro");
        assert!(config.llama_cloud_api_key.is_none());
        clear_all();
    }

    #[test]
    fn blank_value_is_treated_as_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_all_required();
        env::set_var("GEMINI_API_KEY", "   ");
        let err = RuntimeConfig::from_env().unwrap_err();
        let ConfigError::Invalid { problems } = err;
        assert!(problems.iter().any(|p| p.contains("GEMINI_API_KEY")));
        clear_all();
    }
}
