pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentProfileConfig, AppConfig, BackupProviderConfig, BanThreshold, DatabaseConfig,
    DispatcherConfig, LlmProviderConfig, LogConfig, ModerationConfig, SummarizationConfig,
    ToolsConfig,
};
