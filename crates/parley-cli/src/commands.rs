use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use parley_common::{AgentType, RequestContext, StatusPhase, StatusUpdate};
use parley_config::AppConfig;
use parley_gateway::{DispatchOutcome, Gateway, open_stores};
use parley_security::redact_secrets;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn chat(config: &AppConfig, user: &str, agent: Option<AgentType>) -> anyhow::Result<()> {
    let stores = open_stores(config).context("failed to open the session store")?;
    let gateway = Gateway::from_config(config, stores).context("failed to assemble the gateway")?;
    gateway.start_background();

    let agent = agent.unwrap_or(gateway.dispatcher.default_agent());
    println!("Chatting with the {agent} agent as '{user}'. Ctrl-D or /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        let cancel = CancellationToken::new();
        let ctx = RequestContext::new(user)
            .with_cancel(cancel.clone())
            .with_status(Arc::new(print_status));

        let result = tokio::select! {
            result = gateway.dispatcher.dispatch_to(&ctx, agent, text) => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                println!("(cancelled)");
                continue;
            }
        };
        match result {
            Ok(DispatchOutcome::Replied(replies)) => {
                for reply in replies {
                    println!("{reply}");
                }
            }
            Ok(DispatchOutcome::Queued) => println!("(queued behind the running request)"),
            Err(e) => {
                warn!("request failed: {e}");
                eprintln!("error: {e}");
            }
        }
    }

    gateway.shutdown();
    Ok(())
}

fn print_status(update: StatusUpdate) {
    let label = match &update.phase {
        StatusPhase::ToolExecuting => "running tool",
        StatusPhase::Routing => "handing off",
        StatusPhase::AgentCalling => "asking",
        _ => return,
    };
    match update.detail {
        Some(detail) => eprintln!("  .. {label} {detail}"),
        None => eprintln!("  .. {label}"),
    }
}

pub async fn sessions(config: &AppConfig, user: &str) -> anyhow::Result<()> {
    let stores = open_stores(config).context("failed to open the session store")?;
    let sessions = stores
        .sessions
        .list(user)
        .await
        .with_context(|| format!("failed to list sessions for '{user}'"))?;

    if sessions.is_empty() {
        println!("No sessions for '{user}'.");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{:<28} {:<5} {:>4} active {:>4} archived  {}  {}",
            session.id,
            session.agent_type.as_str(),
            session.msgs.len(),
            session.archived_msgs.len(),
            session.updated_at.format("%Y-%m-%d %H:%M"),
            session.title.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn summarize(config: &AppConfig) -> anyhow::Result<()> {
    let stores = open_stores(config).context("failed to open the session store")?;
    let gateway = Gateway::from_config(config, stores).context("failed to assemble the gateway")?;
    let report = gateway
        .scheduler
        .run_once()
        .await
        .context("summarization pass failed")?;
    info!(?report, "summarization pass finished");
    println!(
        "scanned {} sessions, summarized {}, skipped {}, failed {}",
        report.scanned, report.summarized, report.skipped, report.failed
    );
    Ok(())
}

pub fn config_check(config: &AppConfig) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if shown.llm.api_key.is_some() {
        shown.llm.api_key = Some("[REDACTED]".into());
    }
    for backup in &mut shown.backups {
        if backup.api_key.is_some() {
            backup.api_key = Some("[REDACTED]".into());
        }
    }
    let yaml = serde_yaml::to_string(&shown).context("failed to render config")?;
    println!("# configuration is valid\n{}", redact_secrets(&yaml));
    Ok(())
}
