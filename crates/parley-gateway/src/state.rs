use std::sync::Arc;
use std::time::Duration;

use parley_agents::{
    ActionCallback, AgentProfile, BackupChain, BackupLlm, FailoverProvider, LlmNonsenseVerifier,
    LlmProvider, OpenAiProvider, ToolCallLoop, ToolExecutor, ToolRegistry,
};
use parley_common::{Error, Result};
use parley_config::AppConfig;
use parley_db::{InMemoryStore, SqliteStore, Stores, UserStore};
use parley_security::{ModerationGate, NonsenseVerifier};
use tracing::{debug, info, warn};

use crate::dispatcher::RequestDispatcher;
use crate::scheduler::SummarizationScheduler;

/// Open the configured backend with every capability wired.
pub fn open_stores(config: &AppConfig) -> Result<Stores> {
    if config.database.in_memory {
        info!("using in-memory store");
        return Ok(Stores::full(Arc::new(InMemoryStore::new())));
    }
    let path = config
        .database
        .path
        .as_deref()
        .ok_or_else(|| Error::Config("database.path is not set".into()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("opening database at {}", path.display());
    Ok(Stores::full(Arc::new(SqliteStore::open(path)?)))
}

/// Everything a transport needs: the dispatcher for inbound messages and
/// the archival scheduler to start alongside it.
pub struct Gateway {
    pub dispatcher: Arc<RequestDispatcher>,
    pub scheduler: Arc<SummarizationScheduler>,
    pub stores: Stores,
    pub provider: Arc<dyn LlmProvider>,
    summarization_enabled: bool,
}

pub struct GatewayBuilder<'a> {
    config: &'a AppConfig,
    stores: Stores,
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    callback: Option<Arc<dyn ActionCallback>>,
}

impl<'a> GatewayBuilder<'a> {
    pub fn new(config: &'a AppConfig, stores: Stores) -> Self {
        Self {
            config,
            stores,
            provider: None,
            tools: None,
            callback: None,
        }
    }

    /// Replace the provider stack built from `llm` and `backups`.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn callback(mut self, callback: Arc<dyn ActionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => build_provider(config)?,
        };
        let tools = self.tools.unwrap_or_else(|| {
            if config.tools.read_file_root.is_none()
                && config.agents.iter().any(|a| a.tools.iter().any(|t| t == "read_file"))
            {
                warn!("read_file is listed for an agent but tools.read_file_root is not set");
            }
            Arc::new(ToolRegistry::from_config(&config.tools)) as Arc<dyn ToolExecutor>
        });

        let mut tool_loop = ToolCallLoop::new(
            Arc::clone(&provider),
            tools,
            self.stores.clone(),
            &config.dispatcher,
        );
        if let Some(callback) = self.callback {
            tool_loop = tool_loop.with_callback(callback);
        }

        let users: Arc<dyn UserStore> = match &self.stores.users {
            Some(users) => Arc::clone(users),
            None => {
                warn!("store has no user capability, user state will not persist");
                Arc::new(InMemoryStore::new())
            }
        };

        let moderation = ModerationGate::new(
            config.moderation.clone(),
            Arc::clone(&users),
            nonsense_verifier(config, &provider),
        );

        let dispatcher = RequestDispatcher::new(
            self.stores.clone(),
            users,
            moderation,
            tool_loop,
            AgentProfile::all_from_config(config),
            config.dispatcher.default_agent,
        );

        let scheduler = SummarizationScheduler::new(
            &self.stores,
            Arc::clone(&provider),
            config.summarization.clone(),
            config.llm.model.clone(),
        );

        Ok(Gateway {
            dispatcher: Arc::new(dispatcher),
            scheduler: Arc::new(scheduler),
            stores: self.stores,
            provider,
            summarization_enabled: config.summarization.enabled,
        })
    }
}

impl Gateway {
    pub fn from_config(config: &AppConfig, stores: Stores) -> Result<Self> {
        GatewayBuilder::new(config, stores).build()
    }

    /// Start background work that the config enables.
    pub fn start_background(&self) {
        if self.summarization_enabled {
            // `shutdown` stops the loop; the handle is not needed
            let _ = self.scheduler.start();
        } else {
            info!("summarization disabled");
        }
    }

    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}

/// LLM double-check for repeat offenses, on unless `verify_with_llm` is off.
fn nonsense_verifier(
    config: &AppConfig,
    provider: &Arc<dyn LlmProvider>,
) -> Option<Arc<dyn NonsenseVerifier>> {
    let model = config.moderation.verifier(&config.llm.model)?;
    debug!(model, "nonsense verifier enabled");
    Some(Arc::new(LlmNonsenseVerifier::new(Arc::clone(provider), model)))
}

/// Primary OpenAI-compatible provider, wrapped in the backup chain when any
/// backups are configured.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn LlmProvider>> {
    let timeout = Duration::from_secs(config.llm.timeout_secs);
    let primary = OpenAiProvider::new(
        api_key_or_warn("primary", config.llm.resolve_api_key()),
        config.llm.base_url.clone(),
    )
    .with_timeout(timeout)?;

    if config.backups.is_empty() {
        return Ok(Arc::new(primary));
    }

    let mut backups = Vec::with_capacity(config.backups.len());
    for backup in &config.backups {
        let provider = OpenAiProvider::new(
            api_key_or_warn(&backup.name, backup.resolve_api_key()),
            backup.base_url.clone(),
        )
        .with_name(backup.name.clone())
        .with_timeout(timeout)?;
        backups.push(BackupLlm {
            name: backup.name.clone(),
            model: backup.model.clone(),
            provider: Arc::new(provider),
        });
    }
    info!(backups = backups.len(), "backup providers configured");
    let chain = BackupChain::new(
        backups,
        Duration::from_secs(config.backup_cooldown_secs),
    );
    Ok(Arc::new(FailoverProvider::new(
        Arc::new(chain),
        Arc::new(primary),
    )))
}

fn api_key_or_warn(name: &str, key: Option<String>) -> String {
    key.unwrap_or_else(|| {
        warn!(provider = name, "no API key configured, sending unauthenticated requests");
        String::new()
    })
}
