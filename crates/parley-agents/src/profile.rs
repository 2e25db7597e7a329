use parley_common::AgentType;
use parley_config::{AgentProfileConfig, AppConfig};

/// Resolved per-agent settings used by the tool loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub agent_type: AgentType,
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<String>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub escalates_to: Option<AgentType>,
}

impl AgentProfile {
    pub fn new(agent_type: AgentType, model: impl Into<String>) -> Self {
        Self {
            agent_type,
            model: model.into(),
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: None,
            escalates_to: None,
        }
    }

    /// Fill gaps in `entry` from the global defaults.
    pub fn from_config(entry: &AgentProfileConfig, config: &AppConfig) -> Self {
        Self {
            agent_type: entry.agent_type,
            model: entry.model.clone().unwrap_or_else(|| config.llm.model.clone()),
            system_prompt: entry.system_prompt.clone(),
            tools: entry.tools.clone(),
            max_tokens: entry.max_tokens.unwrap_or(config.dispatcher.max_tokens),
            temperature: entry.temperature,
            escalates_to: entry.escalates_to,
        }
    }

    /// Profile for every configured agent type.
    pub fn all_from_config(config: &AppConfig) -> Vec<Self> {
        config
            .agents
            .iter()
            .map(|entry| Self::from_config(entry, config))
            .collect()
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}
