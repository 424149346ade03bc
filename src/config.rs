use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable agent name, used in the welcome banner
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// TCP listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Rewrite collaborator (LLM) configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Source artifact the rewrite pipeline operates on
    #[serde(default)]
    pub artifact: ArtifactConfig,

    /// Path of the persisted state snapshot
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Environment variable the API key is read from. The key itself never
    /// lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_artifact_path")]
    pub path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_agent_name() -> String {
    "morph-agent".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7077
}

fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_llm_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_api_key_env() -> String {
    "MORPH_API_KEY".to_string()
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("src/main.rs")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("morph_state.json")
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: default_artifact_path(),
            backup_dir: default_backup_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            listen: ListenConfig::default(),
            llm: LlmConfig::default(),
            artifact: ArtifactConfig::default(),
            state_file: default_state_file(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            agent = %config.agent_name,
            listen = %format!("{}:{}", config.listen.host, config.listen.port),
            artifact = %config.artifact.path.display(),
            "configuration loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 7077);
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.artifact.backup_dir, PathBuf::from("backups"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_content = r#"
agent_name = "test-agent"
state_file = "state/test.json"

[listen]
host = "0.0.0.0"
port = 9001

[llm]
base_url = "https://llm.example.com"
model = "test-model"
max_tokens = 2000
timeout_secs = 30

[artifact]
path = "agent.rs"
backup_dir = "agent_backups"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.agent_name, "test-agent");
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 9001);
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.llm.timeout_secs, 30);
        assert_eq!(config.artifact.path, PathBuf::from("agent.rs"));
        assert_eq!(config.state_file, PathBuf::from("state/test.json"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_content = r#"
[listen]
port = 4242
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.listen.port, 4242);
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.agent_name, "morph-agent");
        assert_eq!(config.llm.max_tokens, 4000);
    }
}
