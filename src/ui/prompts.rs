//! Confirmation prompt with non-interactive fallback

use super::context::UiContext;
use crate::error::{ConbuilderError, ConbuilderResult};

/// Ask a yes/no question. `--yes` approves, a non-interactive context
/// answers `default`.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> ConbuilderResult<bool> {
    if ctx.auto_yes() {
        println!("  {} (auto-approved)", message);
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    // cliclack blocks on the terminal
    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| ConbuilderError::User(format!("Prompt task failed: {}", e)))?
    .map_err(|e| ConbuilderError::User(format!("Prompt failed: {}", e)))
}
