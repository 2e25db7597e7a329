//! Ordered failover across alternate providers with per-provider cooldowns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use parley_common::{Error, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::providers::{LlmProvider, LlmRequest, LlmResponse};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// One alternate provider. `model` replaces the request's model when used.
#[derive(Clone)]
pub struct BackupLlm {
    pub name: String,
    pub model: String,
    pub provider: Arc<dyn LlmProvider>,
}

/// Providers tried in fixed order. A provider that errors or returns an
/// empty generation is skipped until its cooldown expires.
///
/// Concurrent callers may probe the same provider at once; the last failure
/// to record a cooldown wins.
pub struct BackupChain {
    backups: Vec<BackupLlm>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl BackupChain {
    pub fn new(backups: Vec<BackupLlm>, cooldown: Duration) -> Self {
        Self {
            backups,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_cooling_down(&self, name: &str) -> bool {
        self.cooldown_until(name)
            .is_some_and(|until| Instant::now() < until)
    }

    fn cooldown_until(&self, name: &str) -> Option<Instant> {
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    fn trip(&self, name: &str) {
        let until = Instant::now() + self.cooldown;
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), until);
    }

    /// First usable response from a provider not in cooldown, or `None` when
    /// every backup failed or is cooling down.
    pub async fn try_backup(&self, request: &LlmRequest) -> Option<LlmResponse> {
        for backup in &self.backups {
            if self.is_cooling_down(&backup.name) {
                debug!("backup '{}' cooling down, skipping", backup.name);
                continue;
            }

            let mut attempt = request.clone();
            attempt.model = backup.model.clone();

            match backup.provider.create_chat_completion(&attempt).await {
                Ok(response) if response.is_usable() => {
                    debug!("backup '{}' answered", backup.name);
                    return Some(response);
                }
                Ok(_) => {
                    warn!(
                        "backup '{}' returned an empty generation, cooling down for {:?}",
                        backup.name, self.cooldown
                    );
                    self.trip(&backup.name);
                }
                Err(e) => {
                    warn!(
                        "backup '{}' failed ({e}), cooling down for {:?}",
                        backup.name, self.cooldown
                    );
                    self.trip(&backup.name);
                }
            }
        }
        None
    }
}

/// Presents "backups first, then primary" as a single provider.
pub struct FailoverProvider {
    backups: Arc<BackupChain>,
    primary: Arc<dyn LlmProvider>,
}

impl FailoverProvider {
    pub fn new(backups: Arc<BackupChain>, primary: Arc<dyn LlmProvider>) -> Self {
        Self { backups, primary }
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn provider_id(&self) -> &str {
        self.primary.provider_id()
    }

    async fn create_chat_completion(&self, request: &LlmRequest) -> Result<LlmResponse> {
        if !self.backups.is_empty() {
            if let Some(response) = self.backups.try_backup(request).await {
                return Ok(response);
            }
            info!(
                "no backup available, falling back to primary '{}'",
                self.primary.provider_id()
            );
        }

        self.primary
            .create_chat_completion(request)
            .await
            .map_err(|e| match e {
                Error::Provider { .. } => e,
                other => Error::provider(self.primary.provider_id(), other.to_string()),
            })
    }

    async fn health_check(&self) -> Result<bool> {
        self.primary.health_check().await
    }
}
