//! Quota administration commands: grant, subscribe, show.

use anyhow::{Result, bail};
use console::style;

use chatrelay_types::error::RepositoryError;

use crate::state::AppState;

pub async fn grant(state: &AppState, user_id: i64, amount: f32, json: bool) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        bail!("amount must be a positive number");
    }

    let balance = state.ledger.grant(user_id, amount).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "user_id": user_id, "granted": amount, "balance": balance })
        );
    } else {
        println!(
            "  {} Granted {} to user {} (balance {})",
            style("✓").green().bold(),
            style(amount).bold(),
            user_id,
            style(format!("{balance:.2}")).cyan()
        );
    }

    Ok(())
}

pub async fn subscribe(
    state: &AppState,
    user_id: i64,
    model: &str,
    limit: i64,
    json: bool,
) -> Result<()> {
    if limit <= 0 {
        bail!("limit must be positive");
    }

    match state.ledger.subscribe(user_id, model, limit).await {
        Ok(()) => {}
        Err(RepositoryError::NotFound) => {
            bail!("user {user_id} has no quota account; run `chatrelay quota grant` first")
        }
        Err(e) => return Err(e.into()),
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "user_id": user_id, "model": model, "usage_limit": limit })
        );
    } else {
        println!(
            "  {} User {} subscribed to '{}' ({} generations)",
            style("✓").green().bold(),
            user_id,
            style(model).cyan(),
            style(limit).bold()
        );
    }

    Ok(())
}

pub async fn show(state: &AppState, user_id: i64, model: Option<&str>, json: bool) -> Result<()> {
    let Some(balance) = state.ledger.balance(user_id).await? else {
        bail!("user {user_id} has no quota account");
    };

    let plan_used = match model {
        Some(model) => state.ledger.subscription_used(user_id, model).await?,
        None => None,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "user_id": user_id,
                "balance": balance,
                "model": model,
                "plan_used": plan_used,
            }))?
        );
        return Ok(());
    }

    println!();
    println!("  User {}", style(user_id).bold());
    println!("  Balance: {}", style(format!("{balance:.2}")).cyan());
    if let Some(model) = model {
        match plan_used {
            Some(used) => println!("  Plan '{}': {} used", style(model).cyan(), used),
            None => println!("  Plan '{}': {}", model, style("none").dim()),
        }
    }
    println!();

    Ok(())
}
