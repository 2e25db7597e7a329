pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parley_common::{Error, Result, Session};
use parley_config::ToolsConfig;
use parley_db::{OpenedFileRecord, OpenedFileStore};
use tracing::{debug, info};

use crate::providers::ToolDefinition;

pub use builtin::{CurrentTimeTool, ReadFileTool};

/// What a tool sees of the turn that invoked it.
pub struct ToolContext<'a> {
    pub session: &'a Session,
    pub user_id: &'a str,
    pub opened_files: Option<Arc<dyn OpenedFileStore>>,
}

impl<'a> ToolContext<'a> {
    pub fn new(session: &'a Session, opened_files: Option<Arc<dyn OpenedFileStore>>) -> Self {
        Self {
            session,
            user_id: &session.user_id,
            opened_files,
        }
    }

    /// Allocate a file ID on the session and persist it when the store
    /// tracks opened files. Returns the allocated ID either way.
    pub async fn record_opened_file(&self, path: &str) -> Result<String> {
        let id = self.session.generate_file_id();
        if let Some(store) = &self.opened_files {
            store
                .record_opened_file(&OpenedFileRecord {
                    id: id.clone(),
                    session_id: self.session.id.clone(),
                    path: path.to_string(),
                    opened_at: Utc::now(),
                })
                .await?;
        }
        debug!(session_id = %self.session.id, file_id = %id, "opened {path}");
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON-schema object for the arguments; a top-level `required` array is
    /// lifted into [`ToolDefinition::required`].
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, context: &ToolContext<'_>, args: serde_json::Value) -> Result<ToolOutput>;

    fn definition(&self) -> ToolDefinition {
        let mut parameters = self.input_schema();
        let required = parameters
            .as_object_mut()
            .and_then(|obj| obj.remove("required"))
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters,
            required,
        }
    }
}

/// Runs a named tool with raw JSON arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Schemas for the tools in `allowed` that this executor knows.
    fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition>;

    async fn execute(
        &self,
        context: &ToolContext<'_>,
        name: &str,
        arguments: &str,
    ) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `current_time`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTimeTool));
        registry
    }

    /// Built-ins plus `read_file` when a root directory is configured.
    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut registry = Self::with_builtins();
        if let Some(root) = &config.read_file_root {
            info!(root = %root.display(), "read_file enabled");
            registry.register(Arc::new(
                ReadFileTool::confined_to(root).with_max_bytes(config.read_file_max_bytes),
            ));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    async fn execute(
        &self,
        context: &ToolContext<'_>,
        name: &str,
        arguments: &str,
    ) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;

        let args = if arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| Error::Tool(format!("invalid arguments for {name}: {e}")))?
        };

        let output = tool.execute(context, args).await?;
        if output.is_error {
            return Err(Error::Tool(output.content));
        }
        Ok(output.content)
    }
}

#[cfg(test)]
mod tests {
    use parley_common::AgentType;
    use parley_db::InMemoryStore;
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the text argument"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn execute(&self, _ctx: &ToolContext<'_>, args: serde_json::Value) -> Result<ToolOutput> {
            match args["text"].as_str() {
                Some(text) => Ok(ToolOutput::success(text)),
                None => Ok(ToolOutput::error("missing 'text'")),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry
    }

    #[test]
    fn file_reading_needs_a_configured_root() {
        assert_eq!(ToolRegistry::with_builtins().names(), vec!["current_time"]);
        assert_eq!(
            ToolRegistry::from_config(&ToolsConfig::default()).names(),
            vec!["current_time"]
        );

        let dir = tempfile::tempdir().unwrap();
        let config = ToolsConfig {
            read_file_root: Some(dir.path().to_path_buf()),
            ..ToolsConfig::default()
        };
        assert_eq!(
            ToolRegistry::from_config(&config).names(),
            vec!["current_time", "read_file"]
        );
    }

    #[test]
    fn definitions_filter_and_lift_required() {
        let defs = registry().definitions(&["echo".to_string(), "missing".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].required, vec!["text".to_string()]);
        assert!(defs[0].parameters.get("required").is_none());
    }

    #[tokio::test]
    async fn execute_reports_failures_as_errors() {
        let session = Session::new("u1", AgentType::Low, 1);
        let ctx = ToolContext::new(&session, None);
        let registry = registry();

        assert_eq!(
            registry.execute(&ctx, "echo", r#"{"text":"hi"}"#).await.unwrap(),
            "hi"
        );

        let unknown = registry.execute(&ctx, "nope", "{}").await.unwrap_err();
        assert!(unknown.to_string().contains("unknown tool: nope"));

        let bad_json = registry.execute(&ctx, "echo", "{not json").await.unwrap_err();
        assert!(bad_json.to_string().contains("invalid arguments for echo"));

        let tool_error = registry.execute(&ctx, "echo", "").await.unwrap_err();
        assert!(tool_error.to_string().contains("missing 'text'"));
    }

    #[tokio::test]
    async fn opened_files_get_session_ids() {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new("u1", AgentType::High, 2);
        let ctx = ToolContext::new(&session, Some(store.clone()));

        assert_eq!(ctx.record_opened_file("/a").await.unwrap(), "u1-h-s0002-f1");
        assert_eq!(ctx.record_opened_file("/b").await.unwrap(), "u1-h-s0002-f2");
        let saved = store.opened_files_for("u1-h-s0002");
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].path, "/b");
    }
}
