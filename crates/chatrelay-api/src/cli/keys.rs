//! API key commands.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Create an API key and print it. Only the hash is stored.
pub async fn create_key(state: &AppState, user_id: i64, name: &str, json: bool) -> Result<()> {
    let key = state.api_keys.create(user_id, name).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "user_id": user_id, "name": name, "key": key })
        );
        return Ok(());
    }

    println!();
    println!(
        "  {} API key for user {} (save this -- it won't be shown again):",
        style("🔑").bold(),
        style(user_id).bold()
    );
    println!();
    println!("  {}", style(&key).yellow().bold());
    println!();

    Ok(())
}
