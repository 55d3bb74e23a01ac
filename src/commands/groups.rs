use anyhow::{Context, Result};

use proxyrank::models::Group;
use proxyrank::pipeline::RunController;
use proxyrank::storage::ServerRepository;

pub async fn list_groups(repo: &dyn ServerRepository) -> Result<()> {
    let groups = repo.list_groups().await?;

    if groups.is_empty() {
        println!("No groups yet.");
        println!("Run 'proxyrank add-group --name <NAME> --url <URL>' to create one.");
        return Ok(());
    }

    println!("Groups");
    println!("================================");
    for group in groups {
        let servers = repo.list_server_ids(&group.id).await?.len();
        let state = if group.enabled { "enabled" } else { "disabled" };
        println!("{} ({servers} servers, {state})", group.name);
        println!("   ID: {}", group.id);
        if group.is_subscribed() {
            println!("   URL: {}", group.url);
        }
    }

    Ok(())
}

pub async fn add_group(
    repo: &dyn ServerRepository,
    name: String,
    url: Option<String>,
    disabled: bool,
) -> Result<()> {
    let mut group = Group::new(name, url.unwrap_or_default());
    group.enabled = !disabled;

    repo.save_group(&group)
        .await
        .context("Failed to save group")?;

    tracing::info!(group_id = %group.id, name = %group.name, "Group created");
    println!("Created group '{}' ({})", group.name, group.id);
    Ok(())
}

pub async fn enable_groups(controller: &RunController, group_ids: Vec<String>) -> Result<()> {
    controller
        .select_groups(&group_ids)
        .await
        .context("Failed to update enabled groups")?;

    let snapshot = controller.snapshot().borrow().clone();
    for group in &snapshot.groups {
        let mark = if group.enabled { "x" } else { " " };
        println!("[{mark}] {} ({})", group.name, group.id);
    }
    Ok(())
}
