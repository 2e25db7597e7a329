use std::path::{Path, PathBuf};

use parley_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

/// Resolves and parses the application config.
///
/// Looks in `~/.parley/` for `config.yml`, `config.yaml` or `config.toml`
/// (first match wins), then applies `PARLEY_*` environment overrides and
/// validates the result. A missing file yields the defaults.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
        }
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".parley"))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Default location of the SQLite database when `database.path` is unset.
    pub fn default_database_path(&self) -> PathBuf {
        self.config_dir.join("parley.db")
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|p| p.is_file())
    }

    pub fn load(&self) -> Result<AppConfig> {
        let config = match self.config_path() {
            Some(path) => Self::parse_file(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };
        self.finish(config)
    }

    /// Parse a single file, choosing the format from its extension. The
    /// database still defaults into the standard config directory.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let config = Self::parse_file(path)?;
        Self::new().finish(config)
    }

    fn finish(&self, mut config: AppConfig) -> Result<AppConfig> {
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        if config.database.path.is_none() && !config.database.in_memory {
            config.database.path = Some(self.default_database_path());
        }
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config = parse_str(&raw, path)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_str(raw: &str, path: &Path) -> Result<AppConfig> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "toml" => toml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display()))),
        "yml" | "yaml" => serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension '{other}' for {}",
            path.display()
        ))),
    }
}

/// Environment takes precedence over the file.
pub(crate) fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(key) = non_empty("PARLEY_LLM_API_KEY") {
        config.llm.api_key = Some(key);
    }
    if let Some(url) = non_empty("PARLEY_LLM_BASE_URL") {
        config.llm.base_url = Some(url);
    }
    if let Some(model) = non_empty("PARLEY_LLM_MODEL") {
        config.llm.model = model;
    }
    if let Some(level) = non_empty("PARLEY_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(path) = non_empty("PARLEY_DATABASE_PATH") {
        if path == ":memory:" {
            config.database.in_memory = true;
            config.database.path = None;
        } else {
            config.database.path = Some(PathBuf::from(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parley_common::AgentType;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        assert!(loader.config_path().is_none());

        let config = loader.load().unwrap();
        assert_eq!(config.dispatcher.max_tool_iterations, 10);
        assert_eq!(config.database.path, Some(dir.path().join("parley.db")));
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            r#"
llm:
  model: gpt-4.1
  base_url: http://localhost:8080/v1
backups:
  - name: groq
    model: llama-3.1-8b
    base_url: https://api.groq.com/openai/v1
backup_cooldown_secs: 60
dispatcher:
  default_agent: high
  max_tool_iterations: 4
"#,
        )
        .unwrap();

        let config = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(config.llm.model, "gpt-4.1");
        assert_eq!(config.backups.len(), 1);
        assert_eq!(config.backups[0].name, "groq");
        assert_eq!(config.backup_cooldown_secs, 60);
        assert_eq!(config.dispatcher.default_agent, AgentType::High);
        assert_eq!(config.dispatcher.max_tool_iterations, 4);
        // untouched sections keep their defaults
        assert_eq!(config.summarization.min_messages, 20);
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[llm]
model = "gpt-4o"

[moderation]
enabled = false

[[moderation.thresholds]]
count = 2
ban_hours = 12
"#,
        )
        .unwrap();

        let config = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert!(!config.moderation.enabled);
        assert_eq!(config.moderation.thresholds.len(), 1);
        assert_eq!(config.moderation.thresholds[0].ban_hours, 12);
    }

    #[test]
    fn invalid_yaml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "llm: [unterminated").unwrap();
        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_extension_rejected() {
        let err = parse_str("{}", Path::new("config.json")).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn validation_runs_after_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "dispatcher:\n  max_tool_iterations: 0\n",
        )
        .unwrap();
        assert!(ConfigLoader::with_dir(dir.path()).load().is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PARLEY_LLM_API_KEY", "sk-env"),
            ("PARLEY_LLM_BASE_URL", "http://proxy/v1"),
            ("PARLEY_LOG_LEVEL", "debug"),
            ("PARLEY_DATABASE_PATH", ":memory:"),
            ("PARLEY_LLM_MODEL", "  "),
        ]);
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.llm.base_url.as_deref(), Some("http://proxy/v1"));
        assert_eq!(config.log.level, "debug");
        assert!(config.database.in_memory);
        // blank values are ignored
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }
}
