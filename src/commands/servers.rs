use anyhow::{Context, Result};

use proxyrank::pipeline::RunController;
use proxyrank::storage::ServerRepository;
use proxyrank::utils::truncate_text;

pub async fn list_servers(repo: &dyn ServerRepository, group: Option<String>) -> Result<()> {
    let entries = repo.list_entries().await?;
    let selected = repo.get_selected().await?;

    let entries: Vec<_> = entries
        .into_iter()
        .filter(|entry| group.as_deref().map_or(true, |g| entry.config.group_id == g))
        .collect();

    if entries.is_empty() {
        println!("No servers stored.");
        return Ok(());
    }

    for (i, entry) in entries.iter().enumerate() {
        let mark = match &selected {
            Some(s) if s.server_id == entry.config.id => "*",
            _ => " ",
        };
        let latency = entry
            .affiliation
            .map(|info| info.latency_label())
            .unwrap_or_default();

        println!(
            "{mark} {:>3}. {:<40} {:>8}  [{}]",
            i + 1,
            truncate_text(&entry.config.name, 40),
            latency,
            entry.config.outbound.protocol
        );
        println!("        ID: {}", entry.config.id);
    }

    Ok(())
}

pub async fn select_server(controller: &RunController, server_id: String) -> Result<()> {
    controller
        .select_server(&server_id)
        .await
        .with_context(|| format!("Failed to select server {server_id}"))?;

    println!("Selected server {server_id}");
    Ok(())
}
