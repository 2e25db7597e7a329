use std::collections::HashSet;
use std::path::PathBuf;

use parley_common::{AgentType, Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmProviderConfig,
    pub backups: Vec<BackupProviderConfig>,
    pub backup_cooldown_secs: u64,
    pub agents: Vec<AgentProfileConfig>,
    pub dispatcher: DispatcherConfig,
    pub moderation: ModerationConfig,
    pub summarization: SummarizationConfig,
    pub tools: ToolsConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmProviderConfig::default(),
            backups: Vec::new(),
            backup_cooldown_secs: 300,
            agents: default_agents(),
            dispatcher: DispatcherConfig::default(),
            moderation: ModerationConfig::default(),
            summarization: SummarizationConfig::default(),
            tools: ToolsConfig::default(),
            database: DatabaseConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn agent(&self, agent_type: AgentType) -> Option<&AgentProfileConfig> {
        self.agents.iter().find(|a| a.agent_type == agent_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.max_tool_iterations == 0 {
            return Err(Error::Config(
                "dispatcher.max_tool_iterations must be at least 1".into(),
            ));
        }

        let mut backup_names = HashSet::new();
        for backup in &self.backups {
            if backup.name.trim().is_empty() {
                return Err(Error::Config("backup provider name cannot be empty".into()));
            }
            if !backup_names.insert(backup.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate backup provider name '{}'",
                    backup.name
                )));
            }
        }

        let mut agent_types = HashSet::new();
        for agent in &self.agents {
            if !agent_types.insert(agent.agent_type) {
                return Err(Error::Config(format!(
                    "agent '{}' is configured more than once",
                    agent.agent_type
                )));
            }
        }
        for agent in &self.agents {
            if let Some(target) = agent.escalates_to {
                if target == agent.agent_type {
                    return Err(Error::Config(format!(
                        "agent '{}' cannot escalate to itself",
                        agent.agent_type
                    )));
                }
                if !agent_types.contains(&target) {
                    return Err(Error::Config(format!(
                        "agent '{}' escalates to unconfigured agent '{target}'",
                        agent.agent_type
                    )));
                }
            }
        }
        if self.agent(self.dispatcher.default_agent).is_none() {
            return Err(Error::Config(format!(
                "default agent '{}' has no profile",
                self.dispatcher.default_agent
            )));
        }

        self.moderation.validate()?;

        if self.summarization.interval_secs == 0 {
            return Err(Error::Config(
                "summarization.interval_secs must be positive".into(),
            ));
        }
        if self.summarization.min_messages == 0 {
            return Err(Error::Config(
                "summarization.min_messages must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LlmProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), self.api_key_env.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProviderConfig {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl BackupProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), self.api_key_env.as_deref())
    }
}

fn resolve_key(inline: Option<&str>, env_name: Option<&str>) -> Option<String> {
    inline
        .filter(|k| !k.trim().is_empty())
        .map(str::to_string)
        .or_else(|| env_name.and_then(|name| std::env::var(name).ok()))
        .filter(|k| !k.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfileConfig {
    pub agent_type: AgentType,
    /// Falls back to `llm.model`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub escalates_to: Option<AgentType>,
}

fn default_agents() -> Vec<AgentProfileConfig> {
    vec![
        AgentProfileConfig {
            agent_type: AgentType::Low,
            model: None,
            system_prompt: Some(
                "You are a fast, friendly assistant. If a request needs deeper reasoning \
                 than you can give, call the escalate tool."
                    .to_string(),
            ),
            tools: vec!["current_time".to_string(), "ask_user".to_string()],
            max_tokens: Some(1024),
            temperature: None,
            escalates_to: Some(AgentType::High),
        },
        AgentProfileConfig {
            agent_type: AgentType::High,
            model: None,
            system_prompt: Some("You are a careful assistant that reasons step by step.".into()),
            tools: vec!["current_time".to_string(), "ask_user".to_string()],
            max_tokens: Some(4096),
            temperature: None,
            escalates_to: None,
        },
        AgentProfileConfig {
            agent_type: AgentType::Core,
            model: None,
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            escalates_to: None,
        },
        AgentProfileConfig {
            agent_type: AgentType::User,
            model: None,
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            escalates_to: None,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub default_agent: AgentType,
    pub max_tool_iterations: usize,
    pub max_context_tokens: usize,
    pub max_tokens: u32,
    /// Tool whose call defers the turn until the user answers.
    pub clarification_tool: String,
    /// Tool a weaker agent calls to hand the request to its `escalates_to` agent.
    pub escalation_tool: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_agent: AgentType::Low,
            max_tool_iterations: 10,
            max_context_tokens: 100_000,
            max_tokens: 4096,
            clarification_tool: "ask_user".to_string(),
            escalation_tool: "escalate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanThreshold {
    /// Confirmed-nonsense count at which this ban applies.
    pub count: u32,
    pub ban_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    pub thresholds: Vec<BanThreshold>,
    /// `{hours}` is replaced with the ban length.
    pub ban_message: String,
    pub warning_message: String,
    /// Ask a model to confirm repeat offenses before they count.
    pub verify_with_llm: bool,
    /// Defaults to `llm.model`.
    pub verifier_model: Option<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: vec![
                BanThreshold {
                    count: 3,
                    ban_hours: 1,
                },
                BanThreshold {
                    count: 5,
                    ban_hours: 6,
                },
                BanThreshold {
                    count: 7,
                    ban_hours: 24,
                },
            ],
            ban_message: "You have been temporarily blocked for {hours} hour(s) after repeated \
                          meaningless messages."
                .to_string(),
            warning_message: "That message doesn't look like a real question. Repeated \
                              meaningless messages will lead to a temporary block."
                .to_string(),
            verify_with_llm: true,
            verifier_model: None,
        }
    }
}

impl ModerationConfig {
    /// Model that double-checks repeat offenses, or `None` when the check is
    /// switched off.
    pub fn verifier<'a>(&'a self, default_model: &'a str) -> Option<&'a str> {
        if !self.verify_with_llm {
            return None;
        }
        Some(self.verifier_model.as_deref().unwrap_or(default_model))
    }

    pub fn validate(&self) -> Result<()> {
        if self.thresholds.is_empty() {
            return Err(Error::Config("moderation.thresholds cannot be empty".into()));
        }
        for pair in self.thresholds.windows(2) {
            if pair[1].count <= pair[0].count {
                return Err(Error::Config(
                    "moderation.thresholds must be sorted by strictly increasing count".into(),
                ));
            }
        }
        if self
            .thresholds
            .iter()
            .any(|t| t.count == 0 || t.ban_hours == 0)
        {
            return Err(Error::Config(
                "moderation thresholds need a positive count and ban_hours".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_messages: usize,
    /// A session summarized less than this long ago is not re-summarized.
    pub staleness_secs: u64,
    /// Sessions idle for longer than this are left alone.
    pub recency_secs: u64,
    pub model: Option<String>,
    pub max_summary_tokens: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            min_messages: 20,
            staleness_secs: 3600,
            recency_secs: 3600,
            model: None,
            max_summary_tokens: 500,
        }
    }
}

/// Built-in tool settings. `read_file` is only registered once a root
/// directory is set, and never reads outside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub read_file_root: Option<PathBuf>,
    pub read_file_max_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            read_file_root: None,
            read_file_max_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to `~/.parley/parley.db`.
    pub path: Option<PathBuf>,
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
