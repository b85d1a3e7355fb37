use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND: &str = "127.0.0.1:50051";
pub const DEFAULT_AGENT_NAME: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("invalid agent {name}: {reason}")]
    InvalidAgent { name: String, reason: String },

    #[error("cannot determine home directory")]
    NoHome,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Server-level settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".agentd"))
        .unwrap_or_else(|| PathBuf::from(".agentd"))
}

fn default_agent() -> String {
    DEFAULT_AGENT_NAME.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
            default_agent: default_agent(),
        }
    }
}

impl ServerConfig {
    /// `~/.config/agentd/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".config").join("agentd").join("config.json"))
            .ok_or(ConfigError::NoHome)
    }

    /// Reads the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(io_error(path))?;
        let mut config: ServerConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.bind = config.bind.trim().to_string();
        if config.bind.is_empty() {
            config.bind = default_bind();
        }
        config.data_dir = expand_home(&config.data_dir);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(io_error(path))
    }

    /// Applies `AGENTD_BIND`, `AGENTD_DATA_DIR` and `AGENTD_DEFAULT_AGENT`.
    pub fn apply_env(&mut self) {
        if let Ok(bind) = dotenv::var("AGENTD_BIND") {
            self.bind = bind;
        }
        if let Ok(dir) = dotenv::var("AGENTD_DATA_DIR") {
            self.data_dir = expand_home(Path::new(&dir));
        }
        if let Ok(agent) = dotenv::var("AGENTD_DEFAULT_AGENT") {
            self.default_agent = agent;
        }
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills")
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Model endpoint for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key, if one is needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// A named agent: prompt, provider and sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub provider: ProviderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_context_size")]
    pub context_size: u64,
}

fn default_max_turns() -> u32 {
    20
}

fn default_context_size() -> u64 {
    4096
}

impl AgentConfig {
    /// The agent written on first start.
    pub fn bundled_default() -> Self {
        Self {
            name: DEFAULT_AGENT_NAME.to_string(),
            display_name: Some("Default Assistant".to_string()),
            system_prompt: Some("You are a helpful assistant.".to_string()),
            provider: ProviderConfig {
                endpoint: "http://127.0.0.1:8080/v1".to_string(),
                model: "gpt-oss-20b-Q4_K_M.gguf".to_string(),
                api_key_env: None,
                timeout_secs: default_timeout_secs(),
            },
            temperature: Some(0.7),
            max_tokens: Some(4096),
            max_turns: default_max_turns(),
            context_size: default_context_size(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAgent {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.provider.endpoint.trim().is_empty() {
            return Err(invalid("provider endpoint is empty"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(invalid("provider model is empty"));
        }
        if self.max_turns == 0 {
            return Err(invalid("maxTurns must be at least 1"));
        }
        Ok(())
    }
}

/// Agent configurations stored one per file under `<data_dir>/agents`.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    dir: PathBuf,
}

impl AgentRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes the bundled default agent unless a file for it already exists.
    pub fn ensure_default(&self) -> Result<(), ConfigError> {
        let path = self.path_for(DEFAULT_AGENT_NAME);
        if path.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let content = serde_json::to_string_pretty(&AgentConfig::bundled_default())
            .map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        std::fs::write(&path, content).map_err(io_error(&path))
    }

    pub fn load(&self, name: &str) -> Result<AgentConfig, ConfigError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConfigError::InvalidAgent {
                name: name.to_string(),
                reason: "name must be a plain file name".to_string(),
            });
        }

        let path = self.path_for(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::UnknownAgent(name.to_string()))
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let mut agent: AgentConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        if agent.name.is_empty() {
            agent.name = name.to_string();
        }
        agent.validate()?;
        Ok(agent)
    }

    /// Names of all stored agents, sorted.
    pub fn list(&self) -> Result<Vec<String>, ConfigError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}
