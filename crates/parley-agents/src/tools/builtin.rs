use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parley_common::Result;
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::tools::{Tool, ToolContext, ToolOutput};

/// Default cap on bytes returned by `read_file`.
const DEFAULT_MAX_READ_BYTES: usize = 64 * 1024;

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &'static str {
        "current_time"
    }

    fn description(&self) -> &'static str {
        "Return the current date and time in UTC (RFC 3339) and as a Unix timestamp."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _context: &ToolContext<'_>, _args: serde_json::Value) -> Result<ToolOutput> {
        let now = Utc::now();
        Ok(ToolOutput::success(
            json!({"utc": now.to_rfc3339(), "unix": now.timestamp()}).to_string(),
        ))
    }
}

/// Reads a UTF-8 text file from inside one root directory. Paths that
/// resolve outside it, through `..` or symlinks, are refused.
pub struct ReadFileTool {
    root: PathBuf,
    max_bytes: usize,
}

impl ReadFileTool {
    pub fn confined_to(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn resolve(&self, requested: &str) -> std::result::Result<PathBuf, String> {
        let root = &self.root;
        let candidate = if Path::new(requested).is_absolute() {
            PathBuf::from(requested)
        } else {
            root.join(requested)
        };
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| format!("cannot resolve root {}: {e}", root.display()))?;
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|e| format!("cannot open {requested}: {e}"))?;
        if !resolved.starts_with(&root) {
            return Err(format!("{requested} is outside the allowed directory"));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a text file and return its contents. Large files are truncated."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, context: &ToolContext<'_>, args: serde_json::Value) -> Result<ToolOutput> {
        let Some(requested) = args["path"].as_str() else {
            return Ok(ToolOutput::error("missing or invalid 'path' argument"));
        };
        let path = match self.resolve(requested).await {
            Ok(p) => p,
            Err(msg) => return Ok(ToolOutput::error(msg)),
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => return Ok(ToolOutput::error(format!("cannot open {requested}: {e}"))),
        };
        let mut buf = Vec::with_capacity(self.max_bytes.min(8192));
        // one extra byte tells us whether the file was truncated
        file.take(self.max_bytes as u64 + 1)
            .read_to_end(&mut buf)
            .await?;
        let truncated = buf.len() > self.max_bytes;
        buf.truncate(self.max_bytes);

        context.record_opened_file(&path.to_string_lossy()).await?;

        let mut content = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            content.push_str(&format!("\n[truncated after {} bytes]", self.max_bytes));
        }
        Ok(ToolOutput::success(content))
    }
}
