use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use vaultsync_config::PermissionMode;
use vaultsync_engine::{AccessMode, PermissionBroker, PermissionState, StaticBroker};

/// Asks on the terminal.  `y` grants, `n` denies, anything else (or no
/// terminal at all) counts as a dismissed prompt.
pub(crate) struct TerminalBroker;

fn interpret(answer: &str) -> PermissionState {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PermissionState::Granted,
        "n" | "no" => PermissionState::Denied,
        _ => PermissionState::Prompt,
    }
}

#[async_trait]
impl PermissionBroker for TerminalBroker {
    async fn decide(&self, path: &Path, mode: AccessMode) -> PermissionState {
        if !io::stdin().is_terminal() {
            warn!(path = %path.display(), %mode, "no terminal to ask for permission");
            return PermissionState::Prompt;
        }
        let question = format!("allow {mode} access to {}? [y/n] ", path.display());
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            print!("{question}");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => interpret(&line),
            Ok(Err(err)) => {
                warn!(error = %err, "permission prompt failed");
                PermissionState::Prompt
            }
            Err(err) => {
                warn!(error = %err, "permission prompt task failed");
                PermissionState::Prompt
            }
        }
    }
}

pub(crate) fn broker_for(mode: PermissionMode) -> Arc<dyn PermissionBroker> {
    match mode {
        PermissionMode::Prompt => Arc::new(TerminalBroker),
        PermissionMode::Grant => Arc::new(StaticBroker::grant()),
        PermissionMode::Deny => Arc::new(StaticBroker::deny()),
    }
}
