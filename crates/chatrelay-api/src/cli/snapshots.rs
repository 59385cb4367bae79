//! Durable snapshot commands: list, purge.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use chatrelay_types::session::{SessionSnapshot, SessionStatus};

use crate::state::AppState;

fn status_color(status: SessionStatus) -> Color {
    match status {
        SessionStatus::Pending => Color::Yellow,
        SessionStatus::Processing => Color::Cyan,
        SessionStatus::Completed => Color::Green,
        SessionStatus::Error => Color::Red,
        SessionStatus::Cancelled => Color::DarkGrey,
    }
}

/// List every live snapshot in the session namespace, newest first.
pub async fn list_snapshots(state: &AppState, json: bool) -> Result<()> {
    let entries = state.persistence.list_snapshots().await?;

    let mut snapshots: Vec<SessionSnapshot> = Vec::with_capacity(entries.len());
    let mut undecodable = 0usize;
    for (id, loaded) in entries {
        match loaded {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "undecodable snapshot");
                undecodable += 1;
            }
        }
    }
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if json {
        let views: Vec<_> = snapshots.iter().map(SessionSnapshot::view).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!();
        println!(
            "  {} No session snapshots in namespace '{}'.",
            style("i").blue().bold(),
            state.persistence.namespace()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Session").fg(Color::White),
        Cell::new("User").fg(Color::White),
        Cell::new("Conversation").fg(Color::White),
        Cell::new("Model").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Output").fg(Color::White),
        Cell::new("Last activity").fg(Color::White),
    ]);

    for snapshot in &snapshots {
        table.add_row(vec![
            Cell::new(snapshot.id).fg(Color::Cyan),
            Cell::new(snapshot.user_id),
            Cell::new(snapshot.conversation_id),
            Cell::new(&snapshot.model),
            Cell::new(snapshot.status).fg(status_color(snapshot.status)),
            Cell::new(format!("{} chars", snapshot.total_progress.chars().count())),
            Cell::new(snapshot.last_activity.format("%Y-%m-%d %H:%M:%S").to_string())
                .fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} snapshot{}",
        style(snapshots.len()).bold(),
        if snapshots.len() == 1 { "" } else { "s" }
    );
    if undecodable > 0 {
        println!(
            "  {} {} undecodable snapshot{} skipped",
            style("!").yellow().bold(),
            undecodable,
            if undecodable == 1 { "" } else { "s" }
        );
    }
    println!();

    Ok(())
}

/// Delete cache entries whose TTL has passed.
pub async fn purge(state: &AppState, json: bool) -> Result<()> {
    let removed = state.persistence.purge_expired().await?;

    if json {
        println!("{}", serde_json::json!({ "purged": removed }));
    } else {
        println!(
            "  {} Purged {} expired cache entr{}",
            style("✓").green().bold(),
            style(removed).bold(),
            if removed == 1 { "y" } else { "ies" }
        );
    }

    Ok(())
}
